//! Pre-Merge Validator — wave completion check before merging
//!
//! Every check runs and is reported even after an earlier one fails; the
//! verdict is APPROVED only when no required check failed.

use super::lock::{DecisionLock, DecisionLockStore};
use super::report::{CheckResult, ValidationKind, ValidationReport};
use crate::budget::{BudgetLimits, BudgetStatus};
use crate::error::CoordinationResult;
use crate::journal::EventLog;
use crate::retry::RetryController;
use crate::safety::{KillSwitch, SafetyCheck};
use crate::signal::names::{events, SignalKey, SignalPattern, COORDINATOR};
use crate::signal::types::CompletionPayload;
use crate::signal::SignalBus;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{info, warn};

static FAILURE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)(test result: FAILED|^error(\[E\d+\])?:|\bFAILED\b|npm ERR!|panicked at|\b[1-9]\d* (failed|failing)\b|BUILD FAILED)",
    )
    .expect("FAILURE_MARKER regex should compile")
});

static SUCCESS_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(test result: ok|build succeeded|compiled successfully|\b\d+ passed\b|all tests passed|\bFinished\b)",
    )
    .expect("SUCCESS_MARKER regex should compile")
});

/// Everything pre-merge reads besides the bus and journal
#[derive(Debug, Clone)]
pub struct PremergeInput {
    pub wave: u32,
    pub logs_dir: PathBuf,
    pub min_completions: usize,
    pub budget: BudgetLimits,
    pub max_retries: u32,
}

/// What a single log file says
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogVerdict {
    Failed,
    Succeeded,
    Inconclusive,
}

/// Classify log text; a failure marker anywhere wins over success markers
pub fn scan_log(text: &str) -> LogVerdict {
    if FAILURE_MARKER.is_match(text) {
        LogVerdict::Failed
    } else if SUCCESS_MARKER.is_match(text) {
        LogVerdict::Succeeded
    } else {
        LogVerdict::Inconclusive
    }
}

fn log_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .map(|ext| ext == "log" || ext == "txt")
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    files
}

pub struct PremergeValidator {
    locks: DecisionLockStore,
    bus: SignalBus,
    journal: EventLog,
    kill_switch: KillSwitch,
}

impl PremergeValidator {
    pub fn new(
        locks: DecisionLockStore,
        bus: SignalBus,
        journal: EventLog,
        kill_switch: KillSwitch,
    ) -> Self {
        Self {
            locks,
            bus,
            journal,
            kill_switch,
        }
    }

    fn pattern(&self, event: &str) -> Option<SignalPattern> {
        SignalPattern::new(events::from_anyone(event)).ok()
    }

    fn count(&self, event: &str) -> usize {
        self.pattern(event).map(|p| self.bus.count(&p)).unwrap_or(0)
    }

    fn check_approval(&self, wave: u32) -> CheckResult {
        let approvals = self.count(&events::qa_approved(wave));
        let rejections: Vec<String> = [events::qa_rejected(wave), events::review_rejected(wave)]
            .iter()
            .filter_map(|e| self.pattern(e))
            .flat_map(|p| self.bus.list(&p))
            .map(|s| s.key().to_string())
            .collect();

        if !rejections.is_empty() {
            CheckResult::fail("approval", format!("{} rejection(s) on record", rejections.len()))
                .with_items(rejections)
        } else if approvals == 0 {
            CheckResult::fail("approval", "no qa-approved signal")
        } else {
            CheckResult::pass("approval", format!("{} approval(s), no rejections", approvals))
        }
    }

    fn check_completions(&self, input: &PremergeInput) -> CheckResult {
        let signals = self
            .pattern(&events::complete(input.wave))
            .map(|p| self.bus.list(&p))
            .unwrap_or_default();
        let mut failed = Vec::new();
        for signal in &signals {
            if let Some(payload) = signal.payload_as::<CompletionPayload>() {
                if payload.status == "failed" {
                    failed.push(format!("{} reported failed", signal.participant));
                }
            }
        }
        let done = signals.len() - failed.len();
        let detail = format!("{}/{} completion signal(s)", done, input.min_completions);

        if done < input.min_completions || !failed.is_empty() {
            CheckResult::fail("completions", detail).with_items(failed)
        } else {
            CheckResult::pass("completions", detail)
        }
    }

    fn check_escalations(&self, name: &str, event: &str) -> CheckResult {
        let open: Vec<String> = self
            .pattern(event)
            .map(|p| self.bus.list(&p))
            .unwrap_or_default()
            .into_iter()
            .filter(|s| !s.flag("resolved"))
            .map(|s| {
                let reason = s
                    .payload
                    .get("reason")
                    .and_then(|r| r.as_str())
                    .unwrap_or("no reason given")
                    .to_string();
                format!("{}: {}", s.participant, reason)
            })
            .collect();

        if open.is_empty() {
            CheckResult::pass(name, "none open")
        } else {
            CheckResult::fail(name, format!("{} open", open.len())).with_items(open)
        }
    }

    fn check_budget(&self, input: &PremergeInput) -> [CheckResult; 2] {
        let ledger = input.budget.ledger(&self.bus, input.wave);
        let detail = format!("{} of {} spent", ledger.total(), ledger.limit());
        let hard = match ledger.status() {
            BudgetStatus::Exceeded => CheckResult::fail("budget", detail.clone()),
            _ => CheckResult::pass("budget", detail),
        };
        let soft = match ledger.status() {
            BudgetStatus::Ok => CheckResult::pass(
                "budget-warn",
                format!("below warn threshold {}", ledger.warn_threshold()),
            ),
            _ => CheckResult::warn(
                "budget-warn",
                format!("at or above warn threshold {}", ledger.warn_threshold()),
            ),
        }
        .advisory();
        [hard, soft]
    }

    fn check_kill_switch(&self) -> CheckResult {
        let status = self.kill_switch.status();
        if status.is_safe() {
            CheckResult::pass("kill-switch", "clear")
        } else {
            CheckResult::fail("kill-switch", status.to_string())
        }
    }

    /// A violation stays open until its participant publishes a
    /// `boundary-pass` newer than the violation.
    fn check_violations(&self, wave: u32) -> CheckResult {
        let violations = match self.journal.violations(Some(wave)) {
            Ok(v) => v,
            Err(e) => return CheckResult::fail("violations", format!("journal unreadable: {}", e)),
        };
        let open: Vec<String> = violations
            .into_iter()
            .filter(|v| {
                let cleared = SignalKey::new(&v.participant, events::boundary_pass(wave))
                    .ok()
                    .and_then(|key| self.bus.read(&key))
                    .map(|pass| pass.timestamp > v.timestamp)
                    .unwrap_or(false);
                !cleared
            })
            .map(|v| format!("{}: {} ({})", v.participant, v.file, v.reason))
            .collect();

        if open.is_empty() {
            CheckResult::pass("violations", "no open boundary violations")
        } else {
            CheckResult::fail("violations", format!("{} open violation(s)", open.len()))
                .with_items(open)
        }
    }

    fn check_build_logs(&self, input: &PremergeInput) -> CheckResult {
        let files = log_files(&input.logs_dir);
        if files.is_empty() {
            return if self.count(&events::qa_approved(input.wave)) > 0 {
                CheckResult::pass("build-test", "no logs; qa-approved on record")
            } else {
                CheckResult::fail(
                    "build-test",
                    format!("no logs in {} and no qa approval", input.logs_dir.display()),
                )
            };
        }

        let mut failed = Vec::new();
        let mut inconclusive = Vec::new();
        for path in &files {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match std::fs::read_to_string(path) {
                Ok(text) => match scan_log(&text) {
                    LogVerdict::Failed => failed.push(format!("{}: failure marker", name)),
                    LogVerdict::Inconclusive => inconclusive.push(format!("{}: no success marker", name)),
                    LogVerdict::Succeeded => {}
                },
                Err(e) => {
                    warn!(log = %path.display(), "Unreadable log: {}", e);
                    failed.push(format!("{}: unreadable", name));
                }
            }
        }

        if failed.is_empty() && inconclusive.is_empty() {
            CheckResult::pass("build-test", format!("{} log(s) clean", files.len()))
        } else {
            let count = failed.len() + inconclusive.len();
            failed.extend(inconclusive);
            CheckResult::fail(
                "build-test",
                format!("{} of {} log(s) not clean", count, files.len()),
            )
            .with_items(failed)
        }
    }

    fn check_retries(&self, input: &PremergeInput) -> CheckResult {
        let mut controller = RetryController::new(input.max_retries);
        match self.journal.for_wave(input.wave) {
            Ok(history) => controller.replay(input.wave, &history),
            Err(e) => return CheckResult::fail("retries", format!("journal unreadable: {}", e)),
        }
        // No journal or bus attached, so observing never writes
        if let Err(e) = controller.observe_signals(&self.bus, input.wave) {
            return CheckResult::fail("retries", format!("retry signals unreadable: {}", e));
        }
        let escalated: Vec<String> = controller
            .states_for_wave(input.wave)
            .into_iter()
            .filter(|s| !s.can_retry())
            .map(|s| format!("{} ({}/{})", s.scope.target, s.count, s.max))
            .collect();

        if escalated.is_empty() {
            CheckResult::pass("retries", "no scope at retry limit")
        } else {
            CheckResult::fail("retries", format!("{} scope(s) exhausted", escalated.len()))
                .with_items(escalated)
        }
    }

    /// Evaluate every check and build the report, without side effects
    pub fn evaluate(&self, input: &PremergeInput) -> ValidationReport {
        let wave = input.wave;
        let mut report = ValidationReport::new(ValidationKind::Premerge, wave);

        report.add(self.check_approval(wave));
        report.add(self.check_completions(input));
        report.add(self.check_escalations("escalations", &events::escalation(wave)));
        report.add(self.check_escalations("escalations-urgent", &events::escalation_urgent(wave)));
        report.add(self.check_escalations(
            "escalations-security",
            &events::escalation_security(wave),
        ));
        for check in self.check_budget(input) {
            report.add(check);
        }
        report.add(self.check_kill_switch());
        report.add(self.check_violations(wave));
        report.add(self.check_build_logs(input));
        report.add(self.check_retries(input));

        report.input_hash = Some(inputs_hash(&report));
        report.finalize();
        report
    }

    /// Evaluate, lock the decision and publish `merge-approved` or
    /// `merge-rejected`, withdrawing the other.
    pub fn run(&self, input: &PremergeInput, dry_run: bool) -> CoordinationResult<ValidationReport> {
        let mut report = self.evaluate(input);
        report.dry_run = dry_run;
        info!(wave = input.wave, verdict = %report.verdict, "{}", report.summary());
        if dry_run {
            return Ok(report);
        }

        let hash = report.input_hash.clone().unwrap_or_default();
        let lock = DecisionLock::from_report(&report, &hash);
        report.lock = Some(self.locks.commit(&lock)?);

        let (publish, withdraw) = if report.verdict.is_success() {
            (events::merge_approved(input.wave), events::merge_rejected(input.wave))
        } else {
            (events::merge_rejected(input.wave), events::merge_approved(input.wave))
        };
        self.bus.store().remove(&SignalKey::new(COORDINATOR, withdraw)?)?;
        self.bus.publish(
            COORDINATOR,
            &publish,
            serde_json::json!({
                "verdict": report.verdict,
                "failing": report.failing,
                "input_hash": hash,
            }),
        )?;
        Ok(report)
    }
}

/// blake3 over each check's name, outcome and detail
fn inputs_hash(report: &ValidationReport) -> String {
    let mut hasher = blake3::Hasher::new();
    for check in &report.checks {
        hasher.update(check.name.as_bytes());
        hasher.update(b"\0");
        hasher.update(check.outcome.to_string().as_bytes());
        hasher.update(b"\0");
        hasher.update(check.detail.as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::report::{CheckOutcome, Verdict};
    use crate::journal::{JournalEvent, ViolationRecord};
    use crate::signal::MemorySignalStore;
    use chrono::Utc;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        dir: TempDir,
        input: PremergeInput,
        validator: PremergeValidator,
        bus: SignalBus,
        journal: EventLog,
    }

    fn setup() -> Fixture {
        let dir = tempdir().unwrap();
        let store = MemorySignalStore::shared();
        let bus = SignalBus::new(store.clone());
        let journal = EventLog::new(dir.path().join("journal.jsonl"));
        let kill_switch = KillSwitch::new(dir.path().join("EMERGENCY-STOP"), store);
        let validator = PremergeValidator::new(
            DecisionLockStore::new(dir.path().join("locks")),
            bus.clone(),
            journal.clone(),
            kill_switch,
        );
        let input = PremergeInput {
            wave: 1,
            logs_dir: dir.path().join("logs/wave-1"),
            min_completions: 2,
            budget: BudgetLimits::default(),
            max_retries: 3,
        };
        Fixture {
            dir,
            input,
            validator,
            bus,
            journal,
        }
    }

    fn happy_path(f: &Fixture) {
        for p in ["fe-1", "be-1"] {
            f.bus
                .publish(p, &events::complete(1), serde_json::json!({"status": "complete"}))
                .unwrap();
        }
        f.bus
            .publish("qa", &events::qa_approved(1), serde_json::json!({}))
            .unwrap();
        std::fs::create_dir_all(&f.input.logs_dir).unwrap();
        std::fs::write(
            f.input.logs_dir.join("test.log"),
            "running 12 tests\ntest result: ok. 12 passed; 0 failed\n",
        )
        .unwrap();
    }

    #[test]
    fn test_approved_publishes_merge_signal() {
        let f = setup();
        happy_path(&f);
        let report = f.validator.run(&f.input, false).unwrap();
        assert_eq!(report.verdict, Verdict::Approved, "{}", report.render_human());
        assert!(report.lock.as_ref().unwrap().exists());
        let approved = SignalKey::new(COORDINATOR, events::merge_approved(1)).unwrap();
        assert!(f.bus.read(&approved).is_some());
    }

    #[test]
    fn test_every_failure_is_listed() {
        let f = setup();
        f.bus
            .publish("fe-1", &events::complete(1), serde_json::json!({}))
            .unwrap();
        f.bus
            .publish(
                COORDINATOR,
                &events::escalation_security(1),
                serde_json::json!({"reason": "secret in diff"}),
            )
            .unwrap();
        f.bus
            .publish(
                "fe-1",
                &events::tokens(1),
                serde_json::json!({"input_cost": "4.00", "output_cost": "2.00"}),
            )
            .unwrap();

        let report = f.validator.run(&f.input, false).unwrap();
        assert_eq!(report.verdict, Verdict::Rejected);
        assert_eq!(
            report.failing,
            vec![
                "approval",
                "completions",
                "escalations-security",
                "budget",
                "build-test"
            ]
        );
        assert_eq!(report.check("escalations").unwrap().outcome, CheckOutcome::Pass);
        assert_eq!(report.check("budget-warn").unwrap().outcome, CheckOutcome::Warn);

        let rejected = SignalKey::new(COORDINATOR, events::merge_rejected(1)).unwrap();
        assert!(f.bus.read(&rejected).is_some());
    }

    #[test]
    fn test_resolved_escalation_is_not_open() {
        let f = setup();
        happy_path(&f);
        f.bus
            .publish(
                COORDINATOR,
                &events::escalation(1),
                serde_json::json!({"reason": "stuck", "resolved": true}),
            )
            .unwrap();
        let report = f.validator.evaluate(&f.input);
        assert_eq!(report.verdict, Verdict::Approved);
    }

    #[test]
    fn test_rejection_contradicts_approval() {
        let f = setup();
        happy_path(&f);
        f.bus
            .publish("reviewer", &events::review_rejected(1), serde_json::json!({}))
            .unwrap();
        let report = f.validator.evaluate(&f.input);
        assert_eq!(report.failing, vec!["approval"]);
    }

    #[test]
    fn test_failing_log_rejects() {
        let f = setup();
        happy_path(&f);
        std::fs::write(
            f.input.logs_dir.join("build.log"),
            "error[E0425]: cannot find value `x`\n",
        )
        .unwrap();
        let report = f.validator.evaluate(&f.input);
        let check = report.check("build-test").unwrap();
        assert_eq!(check.outcome, CheckOutcome::Fail);
        assert_eq!(check.items, vec!["build.log: failure marker"]);
    }

    #[test]
    fn test_missing_logs_fall_back_to_qa_approval() {
        let f = setup();
        happy_path(&f);
        std::fs::remove_dir_all(&f.input.logs_dir).unwrap();
        let report = f.validator.evaluate(&f.input);
        assert_eq!(report.check("build-test").unwrap().outcome, CheckOutcome::Pass);
    }

    #[test]
    fn test_violation_cleared_by_later_boundary_pass() {
        let f = setup();
        happy_path(&f);
        let mut record = ViolationRecord::new("fe-1", "backend/db.rs", "outside allow-list").in_wave(1);
        record.timestamp = Utc::now() - chrono::Duration::minutes(5);
        f.journal.append(&JournalEvent::Violation(record)).unwrap();

        let report = f.validator.evaluate(&f.input);
        assert_eq!(report.failing, vec!["violations"]);

        f.bus
            .publish("fe-1", &events::boundary_pass(1), serde_json::json!({}))
            .unwrap();
        assert_eq!(f.validator.evaluate(&f.input).verdict, Verdict::Approved);
    }

    #[test]
    fn test_kill_switch_and_retries_block() {
        let f = setup();
        happy_path(&f);
        std::fs::write(f.dir.path().join("EMERGENCY-STOP"), "{}").unwrap();
        f.journal
            .append(&JournalEvent::Escalated {
                wave: 1,
                scope: "story:FE-1".to_string(),
                count: 3,
                reason: "retry limit 3 reached".to_string(),
                timestamp: Utc::now(),
            })
            .unwrap();

        let report = f.validator.evaluate(&f.input);
        assert_eq!(report.failing, vec!["kill-switch", "retries"]);
        assert_eq!(report.check("retries").unwrap().items, vec!["story:FE-1 (3/3)"]);
    }

    #[test]
    fn test_retry_signal_at_limit_rejects() {
        let f = setup();
        happy_path(&f);
        f.bus
            .publish(
                "fe-1",
                &events::retry(1, "FE-1"),
                serde_json::json!({"target": "FE-1", "attempt": 3}),
            )
            .unwrap();

        let report = f.validator.evaluate(&f.input);
        assert_eq!(report.check("retries").unwrap().outcome, CheckOutcome::Fail);
        assert_eq!(report.check("retries").unwrap().items, vec!["story:FE-1 (3/3)"]);
        assert_eq!(report.verdict, Verdict::Rejected);
        // Evaluation leaves no escalation behind
        assert!(f.journal.for_wave(1).unwrap().is_empty());
    }

    #[test]
    fn test_retry_signal_below_limit_passes() {
        let f = setup();
        happy_path(&f);
        f.bus
            .publish(
                "be-1",
                &events::retry(1, "BE-1"),
                serde_json::json!({"target": "BE-1", "attempt": 2}),
            )
            .unwrap();

        let report = f.validator.evaluate(&f.input);
        assert_eq!(report.check("retries").unwrap().outcome, CheckOutcome::Pass);
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let f = setup();
        happy_path(&f);
        let report = f.validator.run(&f.input, true).unwrap();
        assert_eq!(report.verdict, Verdict::Approved);
        assert!(!f.dir.path().join("locks").exists());
        let approved = SignalKey::new(COORDINATOR, events::merge_approved(1)).unwrap();
        assert!(f.bus.read(&approved).is_none());
    }

    #[test]
    fn test_scan_log_markers() {
        assert_eq!(scan_log("test result: ok. 3 passed"), LogVerdict::Succeeded);
        assert_eq!(scan_log("3 passed, 1 failed"), LogVerdict::Failed);
        assert_eq!(scan_log("webpack compiled successfully"), LogVerdict::Succeeded);
        assert_eq!(scan_log("npm ERR! code 1"), LogVerdict::Failed);
        assert_eq!(scan_log("nothing to see"), LogVerdict::Inconclusive);
    }
}
