//! Verb handlers
//!
//! Each handler returns an [`Output`] carrying both renderings of its result;
//! `main` chooses one and maps `code` to the process exit status.

use crate::cli::{GateCommand, SignalCommand, SnapshotCommand, ValidateTarget};
use crate::config::Context;
use anyhow::Result;
use coordination::boundary::{resolve_workspace, BoundaryReport, BoundaryRules, BoundaryValidator};
use coordination::dispatch::derive_statuses;
use coordination::error::CoordinationError;
use coordination::gate::{
    GateAwait, GateMachine, LockVerification, PreflightInput, PreflightValidator, PremergeInput,
    PremergeValidator,
};
use coordination::retry::{RetryController, RetryDecision, RetryScope, RetryTarget};
use coordination::safety::{CancelContext, SafetyCheck};
use coordination::signal::{AwaitOutcome, SignalPattern};
use coordination::snapshot::RestoreSelector;
use coordination::work_item::{load_story_dir, valid_items, WorkItem};
use coordination::{ChangeSet, DomainPolicy, Participant, WorkDispatcher};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Result of one command
#[derive(Debug, Clone)]
pub struct Output {
    pub code: i32,
    pub human: String,
    pub json: serde_json::Value,
}

impl Output {
    fn ok(human: impl Into<String>, json: serde_json::Value) -> Self {
        Self {
            code: 0,
            human: human.into(),
            json,
        }
    }

    fn failed(human: impl Into<String>, json: serde_json::Value) -> Self {
        Self {
            code: 1,
            human: human.into(),
            json,
        }
    }

    fn with_code(mut self, code: i32) -> Self {
        self.code = code;
        self
    }
}

fn wave_items(ctx: &Context) -> Vec<WorkItem> {
    load_story_dir(&ctx.config.stories_dir(ctx.wave))
        .map(|loads| valid_items(&loads))
        .unwrap_or_default()
}

fn gate_machine(ctx: &Context) -> Result<GateMachine> {
    Ok(GateMachine::new(ctx.pipeline()?, ctx.bus())
        .with_safety(Arc::new(ctx.kill_switch()))
        .with_budget(ctx.config.budget()))
}

fn cancel_context(ctx: &Context) -> CancelContext {
    CancelContext::new().with_safety(Arc::new(ctx.kill_switch()))
}

// ============================================================================
// validate
// ============================================================================

pub fn validate(ctx: &Context, target: ValidateTarget) -> Result<Output> {
    match target {
        ValidateTarget::Preflight {
            stories,
            reference,
            verify_lock,
        } => preflight(ctx, stories, reference, verify_lock),
        ValidateTarget::Premerge {
            logs,
            min_completions,
        } => premerge(ctx, logs, min_completions),
        ValidateTarget::Boundary {
            all,
            baseline,
            baseline_dir,
            files,
        } => boundary(ctx, all, &baseline, baseline_dir, files),
    }
}

fn preflight(
    ctx: &Context,
    stories: Option<std::path::PathBuf>,
    reference: Option<std::path::PathBuf>,
    verify_lock: bool,
) -> Result<Output> {
    let input = PreflightInput {
        wave: ctx.wave,
        stories_dir: stories.unwrap_or_else(|| ctx.config.stories_dir(ctx.wave)),
        reference_doc: reference.or_else(|| ctx.config.reference_doc.clone()),
        budget: ctx.config.budget(),
        cost_per_point: ctx.config.cost_per_point,
        max_wave_size: ctx.config.max_wave_size,
    };
    let validator = PreflightValidator::new(ctx.locks(), ctx.bus());

    if verify_lock {
        let verification = validator.verify_lock(&input)?;
        let (state, code) = match &verification {
            LockVerification::Valid(_) => ("valid", 0),
            LockVerification::Stale { .. } => ("stale", 1),
            LockVerification::Missing => ("missing", 1),
        };
        let human = format!("Pre-flight decision lock for wave {}: {}", ctx.wave, state);
        let json = match verification {
            LockVerification::Valid(lock) => json!({"state": state, "lock": lock}),
            LockVerification::Stale { lock, current_hash } => {
                json!({"state": state, "lock": lock, "current_hash": current_hash})
            }
            LockVerification::Missing => json!({"state": state}),
        };
        return Ok(Output::ok(human, json).with_code(code));
    }

    if !ctx.dry_run {
        ctx.kill_switch().ensure_safe()?;
    }
    let report = validator.run(&input, ctx.dry_run)?;
    Ok(Output::ok(report.render_human(), serde_json::to_value(&report)?).with_code(report.exit_code()))
}

fn premerge(
    ctx: &Context,
    logs: Option<std::path::PathBuf>,
    min_completions: Option<usize>,
) -> Result<Output> {
    let input = PremergeInput {
        wave: ctx.wave,
        logs_dir: logs.unwrap_or_else(|| ctx.config.logs_dir(ctx.wave)),
        min_completions: min_completions.unwrap_or(ctx.config.min_completions),
        budget: ctx.config.budget(),
        max_retries: ctx.config.retry_limit,
    };
    let validator = PremergeValidator::new(ctx.locks(), ctx.bus(), ctx.journal(), ctx.kill_switch());
    let report = validator.run(&input, ctx.dry_run)?;
    Ok(Output::ok(report.render_human(), serde_json::to_value(&report)?).with_code(report.exit_code()))
}

fn change_set(
    ctx: &Context,
    participant: &Participant,
    baseline: &str,
    baseline_dir: Option<&std::path::Path>,
    files: &[String],
) -> coordination::CoordinationResult<ChangeSet> {
    if !files.is_empty() {
        return Ok(ChangeSet::new(&participant.name, files.iter()));
    }
    let root = ctx.project_root();
    let workspace = participant
        .workspace
        .as_deref()
        .map(|w| resolve_workspace(root, w))
        .unwrap_or_else(|| root.clone());
    match baseline_dir {
        Some(dir) => ChangeSet::between_dirs(&participant.name, &resolve_workspace(root, dir), &workspace),
        None => ChangeSet::from_git(&participant.name, &workspace, baseline),
    }
}

fn boundary(
    ctx: &Context,
    all: bool,
    baseline: &str,
    baseline_dir: Option<std::path::PathBuf>,
    files: Vec<String>,
) -> Result<Output> {
    let roster = ctx.roster()?;
    let validator = BoundaryValidator::new(BoundaryRules::from_roster(&roster)?);
    let targets: Vec<&Participant> = if all {
        roster.workers().collect()
    } else {
        let name = ctx.require_participant()?;
        let participant = roster.get(name).ok_or_else(|| {
            CoordinationError::invocation(format!("participant '{}' is not in the roster", name))
        })?;
        vec![participant]
    };

    let (journal, bus) = (ctx.journal(), ctx.bus());
    let mut reports: Vec<BoundaryReport> = Vec::new();
    let mut errors = Vec::new();
    for participant in targets {
        let changes = match change_set(ctx, participant, baseline, baseline_dir.as_deref(), &files) {
            Ok(changes) => changes,
            Err(e @ CoordinationError::Environment { .. }) => {
                warn!(participant = %participant.name, "Change set unavailable: {}", e);
                errors.push(json!({"participant": participant.name, "error": e.to_string()}));
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let policy = DomainPolicy::for_participant(participant)?;
        let report = validator.validate(ctx.wave, &policy, &changes);
        if !ctx.dry_run {
            validator.record(&report, &journal, &bus)?;
        }
        reports.push(report);
    }

    let mut human = format!("Boundary check, wave {}\n\n", ctx.wave);
    for report in &reports {
        let tag = if report.passed() { "PASS" } else { "FAIL" };
        human.push_str(&format!(
            "  {}  {:<16} {} file(s), {} violation(s)\n",
            tag,
            report.participant,
            report.checked,
            report.violation_count()
        ));
        for v in &report.violations {
            human.push_str(&format!("          - {}: {}\n", v.file, v.reason));
        }
    }
    for error in &errors {
        human.push_str(&format!(
            "  FAIL  {:<16} {}\n",
            error["participant"].as_str().unwrap_or_default(),
            error["error"].as_str().unwrap_or_default()
        ));
    }

    let passed = errors.is_empty() && reports.iter().all(BoundaryReport::passed);
    let json = json!({"wave": ctx.wave, "passed": passed, "reports": reports, "errors": errors, "dry_run": ctx.dry_run});
    Ok(if passed {
        Output::ok(human, json)
    } else {
        Output::failed(human, json)
    })
}

// ============================================================================
// dispatch
// ============================================================================

pub fn dispatch(ctx: &Context) -> Result<Output> {
    if !ctx.dry_run {
        ctx.kill_switch().ensure_safe()?;
    }
    let machine = gate_machine(ctx)?;
    if let Ok(gate) = machine.pipeline().find("dispatch") {
        let number = gate.number;
        if !machine.can_enter(ctx.wave, number)? && !ctx.dry_run {
            let status = machine.status(ctx.wave, number)?;
            return Ok(Output::failed(
                format!("Cannot dispatch wave {}: {}", ctx.wave, status),
                json!({"wave": ctx.wave, "dispatched": false, "status": status}),
            ));
        }
    }

    let roster = ctx.roster()?;
    let items = valid_items(&load_story_dir(&ctx.config.stories_dir(ctx.wave))?);
    let mut dispatcher = WorkDispatcher::from_roster(ctx.bus(), &roster);
    let plan = if ctx.dry_run {
        dispatcher.plan(ctx.wave, &items)
    } else {
        dispatcher.assign(ctx.wave, &items)?
    };

    let mut human = format!("Wave {} dispatch", ctx.wave);
    if plan.dry_run {
        human.push_str(" (dry run)");
    }
    human.push_str("\n\n");
    for a in &plan.assignments {
        human.push_str(&format!("  {:<12} -> {} ({})\n", a.story_id, a.participant, a.domain));
    }
    for u in &plan.unassigned {
        human.push_str(&format!("  {:<12} -- {}\n", u.story_id, u.reason));
    }

    let json = serde_json::to_value(&plan)?;
    Ok(if plan.unassigned.is_empty() {
        Output::ok(human, json)
    } else {
        Output::failed(human, json)
    })
}

// ============================================================================
// gate
// ============================================================================

pub async fn gate(ctx: &Context, command: GateCommand) -> Result<Output> {
    let machine = gate_machine(ctx)?;
    match command {
        GateCommand::Status => {
            let states = machine.evaluate(ctx.wave)?;
            let mut human = format!("Gates, wave {}\n\n", ctx.wave);
            for s in &states {
                human.push_str(&format!("  {:>2}  {:<12} {}\n", s.number, s.name, s.status));
            }
            Ok(Output::ok(human, json!({"wave": ctx.wave, "gates": states})))
        }
        GateCommand::Await { gate, timeout } => {
            let number = machine.pipeline().find(&gate)?.number;
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| ctx.config.await_timeout());
            let outcome = machine
                .await_gate(ctx.wave, number, timeout, &cancel_context(ctx))
                .await?;
            Ok(match outcome {
                GateAwait::Ready => Output::ok(
                    format!("Gate {} ready", gate),
                    json!({"gate": number, "outcome": "ready"}),
                ),
                GateAwait::Timeout { last } => Output::failed(
                    format!("Timed out waiting for gate {}: {}", gate, last),
                    json!({"gate": number, "outcome": "timeout", "status": last}),
                ),
                GateAwait::Aborted { reason } => Output::failed(
                    format!("Aborted waiting for gate {}: {}", gate, reason),
                    json!({"gate": number, "outcome": "aborted", "reason": reason}),
                ),
            })
        }
    }
}

// ============================================================================
// snapshot / restore
// ============================================================================

pub fn snapshot(ctx: &Context, command: SnapshotCommand) -> Result<Output> {
    let manager = ctx.snapshots();
    match command {
        SnapshotCommand::Create { checkpoint } => {
            if ctx.dry_run {
                return Ok(Output::ok(
                    format!(
                        "Would snapshot {} as wave {} checkpoint {}",
                        manager.state_file().display(),
                        ctx.wave,
                        checkpoint
                    ),
                    json!({"wave": ctx.wave, "checkpoint": checkpoint, "dry_run": true}),
                ));
            }
            let info = manager.snapshot(ctx.wave, &checkpoint)?;
            Ok(Output::ok(
                format!("Snapshot written: {}", info.path.display()),
                serde_json::to_value(&info)?,
            ))
        }
        SnapshotCommand::List => {
            let snapshots = manager.list(ctx.wave)?;
            let mut human = format!("Snapshots, wave {} (newest first)\n\n", ctx.wave);
            for s in &snapshots {
                human.push_str(&format!(
                    "  {}  {:<16} {}\n",
                    s.meta.created_at.format("%Y-%m-%d %H:%M:%S"),
                    s.meta.checkpoint,
                    s.path.display()
                ));
            }
            Ok(Output::ok(human, json!({"wave": ctx.wave, "snapshots": snapshots})))
        }
        SnapshotCommand::Prune { keep } => {
            let keep = keep.unwrap_or(ctx.config.snapshot_retention);
            let removed = if ctx.dry_run {
                manager
                    .list(ctx.wave)?
                    .into_iter()
                    .skip(keep)
                    .map(|s| s.path)
                    .collect()
            } else {
                manager.prune(ctx.wave, keep)?
            };
            let verb = if ctx.dry_run { "Would remove" } else { "Removed" };
            Ok(Output::ok(
                format!("{} {} snapshot(s), keeping {}", verb, removed.len(), keep),
                json!({"wave": ctx.wave, "keep": keep, "removed": removed, "dry_run": ctx.dry_run}),
            ))
        }
    }
}

pub fn restore(ctx: &Context, selector: &str, no_backup: bool) -> Result<Output> {
    let manager = ctx.snapshots();
    let selector: RestoreSelector = selector.parse()?;
    if ctx.dry_run {
        let source = manager.find(ctx.wave, &selector)?;
        return Ok(Output::ok(
            format!("Would restore {} from {}", manager.state_file().display(), source.display()),
            json!({"wave": ctx.wave, "restored_from": source, "dry_run": true}),
        ));
    }
    let outcome = manager.restore(ctx.wave, &selector, !no_backup)?;
    let mut human = format!(
        "Restored {} from {}",
        outcome.state_file.display(),
        outcome.restored_from.display()
    );
    if let Some(backup) = &outcome.backup {
        human.push_str(&format!("\nPrevious state backed up to {}", backup.display()));
    }
    Ok(Output::ok(human, serde_json::to_value(&outcome)?))
}

// ============================================================================
// report
// ============================================================================

pub fn report(ctx: &Context) -> Result<Output> {
    let bus = ctx.bus();
    let journal = ctx.journal();
    let gates = GateMachine::new(ctx.pipeline()?, bus.clone()).evaluate(ctx.wave)?;
    let budget = ctx.config.budget().ledger(&bus, ctx.wave).summary();

    let mut retries = RetryController::new(ctx.config.retry_limit);
    retries.replay(ctx.wave, &journal.for_wave(ctx.wave)?);
    let retry_states: Vec<_> = retries.states_for_wave(ctx.wave).into_iter().cloned().collect();

    let violations = journal.violations(Some(ctx.wave))?;
    let items = wave_items(ctx);
    let statuses = derive_statuses(&bus, ctx.wave, &items)?;
    let safety = ctx.kill_switch().status();

    let mut human = format!("Wave {} report\n\nGates:\n", ctx.wave);
    for s in &gates {
        human.push_str(&format!("  {:>2}  {:<12} {}\n", s.number, s.name, s.status));
    }
    human.push_str(&format!(
        "\nBudget: {} of {} ({})\nKill switch: {}\nViolations: {}\n",
        budget.total,
        budget.limit,
        budget.status,
        safety,
        violations.len()
    ));
    if !retry_states.is_empty() {
        human.push_str("\nRetries:\n");
        for r in &retry_states {
            let flag = if r.escalated { " escalated" } else { "" };
            human.push_str(&format!("  {:<20} {}/{}{}\n", r.scope.target.to_string(), r.count, r.max, flag));
        }
    }
    if !statuses.is_empty() {
        human.push_str("\nWork items:\n");
        for (id, status) in &statuses {
            human.push_str(&format!("  {:<12} {}\n", id, status));
        }
    }

    Ok(Output::ok(
        human,
        json!({
            "wave": ctx.wave,
            "gates": gates,
            "budget": budget,
            "kill_switch": safety,
            "violations": violations.len(),
            "retries": retry_states,
            "work_items": statuses,
        }),
    ))
}

// ============================================================================
// kill / resume / retry
// ============================================================================

pub fn kill(ctx: &Context, reason: &str) -> Result<Output> {
    let switch = ctx.kill_switch();
    let scope = ctx.participant.clone().unwrap_or_else(|| "global".to_string());
    if !ctx.dry_run {
        match &ctx.participant {
            Some(name) => {
                switch.stop_participant(name, reason)?;
            }
            None => switch.trip_global(reason)?,
        }
    }
    Ok(Output::ok(
        format!("Kill switch tripped ({}): {}", scope, reason),
        json!({"scope": scope, "reason": reason, "dry_run": ctx.dry_run}),
    ))
}

pub fn resume(ctx: &Context) -> Result<Output> {
    let switch = ctx.kill_switch();
    let scope = ctx.participant.clone().unwrap_or_else(|| "global".to_string());
    let cleared = if ctx.dry_run {
        false
    } else {
        match &ctx.participant {
            Some(name) => switch.resume_participant(name)?,
            None => switch.clear_global()?,
        }
    };
    let human = if cleared {
        format!("Kill switch cleared ({})", scope)
    } else {
        format!("Kill switch was not set ({})", scope)
    };
    Ok(Output::ok(human, json!({"scope": scope, "cleared": cleared})))
}

pub fn retry(ctx: &Context, target: &str) -> Result<Output> {
    let scope = RetryScope {
        wave: ctx.wave,
        target: RetryTarget::parse(target),
    };

    if ctx.dry_run {
        let mut controller = RetryController::new(ctx.config.retry_limit);
        controller.replay(ctx.wave, &ctx.journal().for_wave(ctx.wave)?);
        let allowed = controller.can_retry(&scope);
        let human = format!("{}: retry {}", scope, if allowed { "allowed" } else { "not allowed" });
        return Ok(Output::ok(human, json!({"scope": scope, "can_retry": allowed, "dry_run": true}))
            .with_code(if allowed { 0 } else { 1 }));
    }

    ctx.kill_switch().ensure_safe()?;
    let mut controller = RetryController::new(ctx.config.retry_limit)
        .with_journal(ctx.journal())
        .with_bus(ctx.bus());
    controller.load(ctx.wave)?;
    match controller.record_retry(&scope)? {
        RetryDecision::Retry { attempt, remaining } => {
            info!(%scope, attempt, remaining, "Retry recorded");
            Ok(Output::ok(
                format!("{}: attempt {} recorded, {} remaining", scope, attempt, remaining),
                json!({"scope": scope, "decision": "retry", "attempt": attempt, "remaining": remaining}),
            ))
        }
        RetryDecision::Escalate { count } => Ok(Output::failed(
            format!("{}: retry limit reached after {} attempt(s); escalated", scope, count),
            json!({"scope": scope, "decision": "escalate", "count": count}),
        )),
    }
}

// ============================================================================
// signal
// ============================================================================

pub async fn signal(ctx: &Context, command: SignalCommand) -> Result<Output> {
    let bus = ctx.bus();
    match command {
        SignalCommand::Publish { event, payload } => {
            let participant = ctx.require_participant()?;
            let payload: serde_json::Value = serde_json::from_str(&payload).map_err(|e| {
                CoordinationError::invocation(format!("--payload is not valid JSON: {}", e))
            })?;
            if ctx.dry_run {
                return Ok(Output::ok(
                    format!("Would publish {}.{}", participant, event),
                    json!({"participant": participant, "event": event, "payload": payload, "dry_run": true}),
                ));
            }
            ctx.kill_switch().ensure_safe()?;
            let path = bus.publish(participant, &event, payload)?;
            Ok(Output::ok(
                format!("Published {}", path.display()),
                json!({"participant": participant, "event": event, "location": path}),
            ))
        }
        SignalCommand::Await { pattern, timeout } => {
            let pattern = SignalPattern::new(pattern)?;
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| ctx.config.await_timeout());
            Ok(match bus.await_signal(&pattern, timeout, &cancel_context(ctx)).await {
                AwaitOutcome::Found(signal) => Output::ok(
                    format!("Found {}", signal.key()),
                    json!({"outcome": "found", "signal": signal}),
                ),
                AwaitOutcome::Timeout => Output::failed(
                    format!("Timed out waiting for {}", pattern),
                    json!({"outcome": "timeout", "pattern": pattern.as_str()}),
                ),
                AwaitOutcome::Aborted { reason } => Output::failed(
                    format!("Aborted waiting for {}: {}", pattern, reason),
                    json!({"outcome": "aborted", "reason": reason}),
                ),
            })
        }
        SignalCommand::List { pattern } => {
            let pattern = SignalPattern::new(pattern)?;
            let signals = bus.list(&pattern);
            let mut human = String::new();
            for s in &signals {
                human.push_str(&format!(
                    "{}  {}\n",
                    s.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
                    s.key()
                ));
            }
            Ok(Output::ok(human, json!({"signals": signals})))
        }
    }
}
