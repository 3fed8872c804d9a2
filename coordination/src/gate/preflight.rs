//! Pre-Flight Validator — runs before any work is dispatched
//!
//! Checks, all evaluated (no fail-fast):
//! - `schema`: every story file parses and has id/title/domain/criteria
//! - `coverage`: requirement ids in the reference document (advisory)
//! - `estimate`: story points × cost per point against the budget
//! - `wave-size`: item count against the configured maximum
//! - `aggregate`: at least one valid work item

use super::lock::{DecisionLock, DecisionLockStore, LockVerification};
use super::report::{CheckResult, ValidationKind, ValidationReport};
use crate::budget::{BudgetLimits, Cost};
use crate::error::CoordinationResult;
use crate::signal::names::{events, SignalKey, COORDINATOR};
use crate::signal::SignalBus;
use crate::work_item::{content_hash, load_story_dir, valid_items, StoryLoad, WorkItem};
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::LazyLock;
use tracing::info;

/// Requirement ids such as `REQ-12`, `FR-3`, `NFR-1`, `US-40`
static REQUIREMENT_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:REQ|FR|NFR|US)-\d+\b").expect("REQUIREMENT_ID regex should compile")
});

/// Points assumed for a story that does not state any
pub const DEFAULT_STORY_POINTS: u32 = 1;

/// Everything pre-flight reads
#[derive(Debug, Clone)]
pub struct PreflightInput {
    pub wave: u32,
    pub stories_dir: PathBuf,
    pub reference_doc: Option<PathBuf>,
    pub budget: BudgetLimits,
    pub cost_per_point: Cost,
    pub max_wave_size: usize,
}

/// Requirement ids mentioned in a text
pub fn requirement_ids(text: &str) -> BTreeSet<String> {
    REQUIREMENT_ID
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

fn check_schema(loads: &[StoryLoad]) -> CheckResult {
    let mut problems = Vec::new();
    let mut ids: HashMap<&str, usize> = HashMap::new();

    for load in loads {
        let file = load
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match load {
            StoryLoad::Invalid { error, .. } => problems.push(format!("{}: {}", file, error)),
            StoryLoad::Parsed { item, .. } => {
                for problem in item.schema_problems() {
                    problems.push(format!("{}: {}", file, problem));
                }
                if !item.id.is_empty() {
                    *ids.entry(item.id.as_str()).or_default() += 1;
                }
            }
        }
    }
    let mut duplicates: Vec<&str> = ids
        .into_iter()
        .filter(|(_, n)| *n > 1)
        .map(|(id, _)| id)
        .collect();
    duplicates.sort_unstable();
    problems.extend(duplicates.into_iter().map(|id| format!("duplicate id {}", id)));

    if problems.is_empty() {
        CheckResult::pass("schema", format!("{} story files valid", loads.len()))
    } else {
        CheckResult::fail("schema", format!("{} problem(s)", problems.len())).with_items(problems)
    }
}

fn check_coverage(reference: Option<&PathBuf>, items: &[WorkItem]) -> CheckResult {
    let Some(path) = reference else {
        return CheckResult::warn("coverage", "no reference document configured").advisory();
    };
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) => {
            return CheckResult::warn(
                "coverage",
                format!("reference document {} unreadable: {}", path.display(), e),
            )
            .advisory();
        }
    };

    let wanted = requirement_ids(&text);
    let mut covered = BTreeSet::new();
    for item in items {
        covered.extend(item.requirements.iter().cloned());
        covered.extend(requirement_ids(&item.title));
        for criterion in &item.acceptance_criteria {
            covered.extend(requirement_ids(criterion));
        }
    }
    let gaps: Vec<String> = wanted.difference(&covered).cloned().collect();

    if gaps.is_empty() {
        CheckResult::pass(
            "coverage",
            format!("{} requirement(s) covered", wanted.len()),
        )
        .advisory()
    } else {
        CheckResult::fail(
            "coverage",
            format!("{} of {} requirement(s) uncovered", gaps.len(), wanted.len()),
        )
        .advisory()
        .with_items(gaps)
    }
}

fn check_estimate(items: &[WorkItem], input: &PreflightInput) -> CheckResult {
    let points: u32 = items
        .iter()
        .map(|i| i.story_points.unwrap_or(DEFAULT_STORY_POINTS))
        .sum();
    let estimate = input.cost_per_point.times(points as u64);
    let limit = input.budget.limit;
    let warn_at = limit.scale(input.budget.warn_fraction);
    let detail = format!("{} points ≈ {} of {} budget", points, estimate, limit);

    if estimate >= limit {
        CheckResult::fail("estimate", detail)
    } else if estimate >= warn_at {
        CheckResult::warn("estimate", detail)
    } else {
        CheckResult::pass("estimate", detail)
    }
}

fn check_wave_size(items: &[WorkItem], max: usize) -> CheckResult {
    let detail = format!("{} item(s), maximum {}", items.len(), max);
    if items.len() > max {
        CheckResult::warn("wave-size", detail)
    } else {
        CheckResult::pass("wave-size", detail)
    }
}

pub struct PreflightValidator {
    locks: DecisionLockStore,
    bus: SignalBus,
}

impl PreflightValidator {
    pub fn new(locks: DecisionLockStore, bus: SignalBus) -> Self {
        Self { locks, bus }
    }

    /// Evaluate every check and build the report, without side effects
    pub fn evaluate(&self, input: &PreflightInput) -> ValidationReport {
        let mut report = ValidationReport::new(ValidationKind::Preflight, input.wave);

        let loads = match load_story_dir(&input.stories_dir) {
            Ok(loads) => loads,
            Err(e) => {
                report.add(CheckResult::fail("schema", e.to_string()));
                Vec::new()
            }
        };
        let items = valid_items(&loads);

        if !loads.is_empty() || report.checks.is_empty() {
            report.add(check_schema(&loads));
        }
        report.add(check_coverage(input.reference_doc.as_ref(), &items));
        report.add(check_estimate(&items, input));
        report.add(check_wave_size(&items, input.max_wave_size));
        report.add(if items.is_empty() {
            CheckResult::fail("aggregate", "no valid work items")
        } else {
            CheckResult::pass("aggregate", format!("{} valid work item(s)", items.len()))
        });

        report.input_hash = Some(content_hash(&items));
        report.finalize();
        report
    }

    /// Evaluate, then lock the decision and publish `preflight-go` on
    /// GO / CONDITIONAL-GO. A NO-GO withdraws any earlier `preflight-go`.
    pub fn run(&self, input: &PreflightInput, dry_run: bool) -> CoordinationResult<ValidationReport> {
        let mut report = self.evaluate(input);
        report.dry_run = dry_run;
        info!(wave = input.wave, verdict = %report.verdict, "{}", report.summary());
        if dry_run {
            return Ok(report);
        }

        let hash = report.input_hash.clone().unwrap_or_default();
        let go_key = SignalKey::new(COORDINATOR, events::preflight_go(input.wave))?;
        if report.verdict.is_success() {
            let lock = DecisionLock::from_report(&report, &hash);
            report.lock = Some(self.locks.commit(&lock)?);
            self.bus.publish(
                COORDINATOR,
                &go_key.event,
                serde_json::json!({
                    "verdict": report.verdict,
                    "input_hash": hash,
                }),
            )?;
        } else {
            self.bus.store().remove(&go_key)?;
        }
        Ok(report)
    }

    /// Recompute the work item hash and compare it with the stored lock
    pub fn verify_lock(&self, input: &PreflightInput) -> CoordinationResult<LockVerification> {
        let items = valid_items(&load_story_dir(&input.stories_dir)?);
        self.locks.verify(
            input.wave,
            ValidationKind::Preflight.decision_point(),
            &content_hash(&items),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::report::{CheckOutcome, Verdict};
    use crate::signal::names::SignalPattern;
    use crate::signal::MemorySignalStore;
    use tempfile::{tempdir, TempDir};

    fn write_story(dir: &std::path::Path, item: &WorkItem) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(
            dir.join(format!("{}.json", item.id.to_lowercase())),
            serde_json::to_string_pretty(item).unwrap(),
        )
        .unwrap();
    }

    fn setup() -> (TempDir, PreflightInput, PreflightValidator, SignalBus) {
        let dir = tempdir().unwrap();
        let stories = dir.path().join("stories/wave-1");
        write_story(
            &stories,
            &WorkItem::new("FE-1", "Login page", "frontend")
                .with_criteria(&["renders form"])
                .with_requirements(&["REQ-1"])
                .with_points(3),
        );
        write_story(
            &stories,
            &WorkItem::new("BE-1", "Auth API", "backend")
                .with_criteria(&["issues token for REQ-2"])
                .with_points(2),
        );
        let reference = dir.path().join("prd.md");
        std::fs::write(&reference, "REQ-1 login\nREQ-2 tokens\n").unwrap();

        let input = PreflightInput {
            wave: 1,
            stories_dir: stories,
            reference_doc: Some(reference),
            budget: BudgetLimits::default(),
            cost_per_point: "0.10".parse().unwrap(),
            max_wave_size: 8,
        };
        let bus = SignalBus::new(MemorySignalStore::shared());
        let locks = DecisionLockStore::new(dir.path().join("locks"));
        let validator = PreflightValidator::new(locks, bus.clone());
        (dir, input, validator, bus)
    }

    #[test]
    fn test_go_writes_lock_and_signal() {
        let (_dir, input, validator, bus) = setup();
        let report = validator.run(&input, false).unwrap();
        assert_eq!(report.verdict, Verdict::Go, "{}", report.render_human());
        assert!(report.lock.as_ref().unwrap().exists());
        assert_eq!(
            bus.count(&SignalPattern::new("coordinator.wave-1-preflight-go").unwrap()),
            1
        );
        assert!(matches!(
            validator.verify_lock(&input).unwrap(),
            LockVerification::Valid(_)
        ));
    }

    #[test]
    fn test_changed_items_make_lock_stale() {
        let (_dir, input, validator, _bus) = setup();
        validator.run(&input, false).unwrap();
        write_story(
            &input.stories_dir,
            &WorkItem::new("FE-2", "Settings", "frontend").with_criteria(&["saves"]),
        );
        assert!(matches!(
            validator.verify_lock(&input).unwrap(),
            LockVerification::Stale { .. }
        ));
    }

    #[test]
    fn test_all_failures_reported_together() {
        let (_dir, mut input, validator, bus) = setup();
        std::fs::write(input.stories_dir.join("broken.json"), "{").unwrap();
        input.cost_per_point = "1.00".parse().unwrap();
        input.max_wave_size = 1;

        let report = validator.run(&input, false).unwrap();
        assert_eq!(report.verdict, Verdict::NoGo);
        assert_eq!(report.failing, vec!["schema", "estimate"]);
        assert_eq!(report.check("wave-size").unwrap().outcome, CheckOutcome::Warn);
        assert!(report.lock.is_none());
        assert_eq!(bus.count(&SignalPattern::new("*.wave-1-preflight-go").unwrap()), 0);
    }

    #[test]
    fn test_coverage_gap_is_conditional() {
        let (dir, input, validator, _bus) = setup();
        std::fs::write(dir.path().join("prd.md"), "REQ-1 REQ-2 NFR-9").unwrap();
        let report = validator.evaluate(&input);
        assert_eq!(report.verdict, Verdict::ConditionalGo);
        assert_eq!(report.check("coverage").unwrap().items, vec!["NFR-9"]);
    }

    #[test]
    fn test_missing_story_dir_is_no_go() {
        let (dir, mut input, validator, _bus) = setup();
        input.stories_dir = dir.path().join("stories/wave-7");
        let report = validator.evaluate(&input);
        assert_eq!(report.verdict, Verdict::NoGo);
        assert!(report.failing.contains(&"aggregate".to_string()));
        assert_eq!(report.checks.iter().filter(|c| c.name == "schema").count(), 1);
    }

    #[test]
    fn test_dry_run_has_no_side_effects() {
        let (dir, input, validator, bus) = setup();
        let report = validator.run(&input, true).unwrap();
        assert!(report.dry_run);
        assert!(report.lock.is_none());
        assert!(!dir.path().join("locks").exists());
        assert_eq!(bus.count(&SignalPattern::new("*").unwrap()), 0);
    }

    #[test]
    fn test_requirement_ids() {
        let ids = requirement_ids("See REQ-1, FR-22 and NFR-3; not XREQ-4 or REQ-");
        let ids: Vec<_> = ids.into_iter().collect();
        assert_eq!(ids, vec!["FR-22", "NFR-3", "REQ-1"]);
    }
}
