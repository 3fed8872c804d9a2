//! Integration tests for a full wave
//!
//! Drives one wave from pre-flight to merge approval through the library
//! API, with the signal bus on disk the way separate participant processes
//! would share it.

use std::path::Path;
use std::sync::Arc;

use coordination::boundary::{BoundaryRules, BoundaryValidator, ChangeSet, DomainPolicy};
use coordination::gate::{GateMachine, GatePipeline, GateStatus, LockVerification};
use coordination::signal::{events, SharedSignalStore, COORDINATOR};
use coordination::work_item::WorkItem;
use coordination::{
    BudgetLimits, Cost, DecisionLockStore, EventLog, FsSignalStore, KillSwitch, Participant,
    PreflightInput, PreflightValidator, PremergeInput, PremergeValidator, Role, Roster, SignalBus,
    SignalKey, Verdict, WorkDispatcher,
};
use tempfile::TempDir;

struct Wave {
    dir: TempDir,
    store: SharedSignalStore,
    bus: SignalBus,
    roster: Roster,
}

impl Wave {
    fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let store: SharedSignalStore = Arc::new(FsSignalStore::new(dir.path().join("signals")));
        let bus = SignalBus::new(store.clone());
        let roster = Roster::new(vec![
            Participant::new("fe-1", Role::FrontendWorker)
                .in_domain("frontend")
                .with_boundary(&["src/app"], &[]),
            Participant::new("fe-2", Role::FrontendWorker)
                .in_domain("frontend")
                .with_boundary(&["src/app"], &[]),
            Participant::new("be-1", Role::BackendWorker)
                .in_domain("backend")
                .with_boundary(&["src/api"], &["src/api/migrations"]),
            Participant::new("be-2", Role::BackendWorker)
                .in_domain("backend")
                .with_boundary(&["src/api"], &[]),
            Participant::new("qa", Role::Qa),
        ]);
        Self {
            dir,
            store,
            bus,
            roster,
        }
    }

    fn path(&self, rel: &str) -> std::path::PathBuf {
        self.dir.path().join(rel)
    }

    fn items(&self) -> Vec<WorkItem> {
        vec![
            WorkItem::new("FE-1", "Login form", "frontend").with_criteria(&["renders"]),
            WorkItem::new("FE-2", "Profile page", "frontend").with_criteria(&["renders"]),
            WorkItem::new("BE-1", "Login endpoint", "backend").with_criteria(&["returns token"]),
            WorkItem::new("BE-2", "Profile endpoint", "backend").with_criteria(&["returns user"]),
        ]
    }

    fn write_stories(&self) -> std::path::PathBuf {
        let dir = self.path("stories/wave-1");
        std::fs::create_dir_all(&dir).unwrap();
        for item in self.items() {
            std::fs::write(
                dir.join(format!("{}.json", item.id.to_lowercase())),
                serde_json::to_string_pretty(&item).unwrap(),
            )
            .unwrap();
        }
        dir
    }

    fn kill_switch(&self) -> KillSwitch {
        KillSwitch::new(self.path("EMERGENCY-STOP"), self.store.clone())
    }

    fn machine(&self) -> GateMachine {
        GateMachine::new(GatePipeline::standard(4), self.bus.clone())
            .with_safety(Arc::new(self.kill_switch()))
            .with_budget(BudgetLimits::default())
    }

    fn premerge(&self) -> (PremergeValidator, PremergeInput) {
        let validator = PremergeValidator::new(
            DecisionLockStore::new(self.path("locks")),
            self.bus.clone(),
            EventLog::new(self.path("journal.jsonl")),
            self.kill_switch(),
        );
        let input = PremergeInput {
            wave: 1,
            logs_dir: self.path("logs/wave-1"),
            min_completions: 4,
            budget: BudgetLimits::default(),
            max_retries: 3,
        };
        (validator, input)
    }

    fn write_log(&self, name: &str, content: &str) {
        let dir = self.path("logs/wave-1");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(name), content).unwrap();
    }
}

fn status_of(machine: &GateMachine, gate: u8) -> GateStatus {
    machine.status(1, gate).unwrap()
}

fn preflight_input(stories: &Path) -> PreflightInput {
    PreflightInput {
        wave: 1,
        stories_dir: stories.to_path_buf(),
        reference_doc: None,
        budget: BudgetLimits::default(),
        cost_per_point: Cost::from_cents(10),
        max_wave_size: 8,
    }
}

#[test]
fn test_wave_runs_through_every_gate() {
    let wave = Wave::new();
    let machine = wave.machine();
    let stories = wave.write_stories();

    assert!(!machine.can_enter(1, 1).unwrap());

    // Gate 0
    let preflight = PreflightValidator::new(DecisionLockStore::new(wave.path("locks")), wave.bus.clone());
    let report = preflight.run(&preflight_input(&stories), false).unwrap();
    assert!(report.verdict.is_success(), "{}", report.render_human());
    assert!(matches!(
        preflight.verify_lock(&preflight_input(&stories)).unwrap(),
        LockVerification::Valid(_)
    ));
    assert!(machine.can_enter(1, 1).unwrap());

    // Gate 1
    let mut dispatcher = WorkDispatcher::from_roster(wave.bus.clone(), &wave.roster);
    let plan = dispatcher.assign(1, &wave.items()).unwrap();
    assert!(plan.start_published);
    assert!(plan.unassigned.is_empty());
    let routed: Vec<(&str, &str)> = plan
        .assignments
        .iter()
        .map(|a| (a.story_id.as_str(), a.participant.as_str()))
        .collect();
    assert_eq!(
        routed,
        vec![("FE-1", "fe-1"), ("FE-2", "fe-2"), ("BE-1", "be-1"), ("BE-2", "be-2")]
    );
    assert!(status_of(&machine, 1).is_ready());

    // Gate 2: three of four completions is not enough
    for (participant, story) in [("fe-1", "FE-1"), ("fe-2", "FE-2"), ("be-1", "BE-1")] {
        wave.bus
            .publish(participant, &events::complete(1), serde_json::json!({"stories": [story]}))
            .unwrap();
    }
    assert!(matches!(status_of(&machine, 2), GateStatus::Pending { .. }));
    wave.bus
        .publish("be-2", &events::complete(1), serde_json::json!({"stories": ["BE-2"]}))
        .unwrap();
    assert!(status_of(&machine, 2).is_ready());

    // Gate 3
    let journal = EventLog::new(wave.path("journal.jsonl"));
    let validator = BoundaryValidator::new(BoundaryRules::from_roster(&wave.roster).unwrap());
    for (name, files) in [
        ("fe-1", vec!["src/app/login.tsx"]),
        ("fe-2", vec!["src/app/profile.tsx"]),
        ("be-1", vec!["src/api/login.rs", "Cargo.lock"]),
        ("be-2", vec!["src/api/profile.rs"]),
    ] {
        let participant = wave.roster.get(name).unwrap();
        let policy = DomainPolicy::for_participant(participant).unwrap();
        let report = validator.validate(1, &policy, &ChangeSet::new(name, files));
        assert!(report.passed(), "{:?}", report.violations);
        validator.record(&report, &journal, &wave.bus).unwrap();
    }
    assert!(status_of(&machine, 3).is_ready());

    // Gates 4 and 5
    wave.bus
        .publish("qa", &events::qa_approved(1), serde_json::json!({}))
        .unwrap();
    wave.bus
        .publish("qa", &events::review_approved(1), serde_json::json!({}))
        .unwrap();
    assert!(status_of(&machine, 5).is_ready());

    // Gate 6
    wave.write_log("cargo-test.log", "test result: ok. 40 passed; 0 failed\n");
    let (premerge, input) = wave.premerge();
    let report = premerge.run(&input, false).unwrap();
    assert_eq!(report.verdict, Verdict::Approved, "{}", report.render_human());
    assert!(wave.path("locks/wave-1-premerge.lock.json").exists());

    let states = machine.evaluate(1).unwrap();
    assert!(states.iter().all(|s| s.status.is_ready()));
}

#[test]
fn test_boundary_violation_blocks_and_rejects_merge() {
    let wave = Wave::new();
    let machine = wave.machine();
    let journal = EventLog::new(wave.path("journal.jsonl"));
    let validator = BoundaryValidator::new(BoundaryRules::from_roster(&wave.roster).unwrap());

    let be1 = wave.roster.get("be-1").unwrap();
    let policy = DomainPolicy::for_participant(be1).unwrap();
    let report = validator.validate(
        1,
        &policy,
        &ChangeSet::new("be-1", ["src/api/migrations/001.sql", "src/app/page.tsx", ".env"]),
    );
    assert_eq!(report.violation_count(), 3);
    validator.record(&report, &journal, &wave.bus).unwrap();

    for p in ["fe-1", "fe-2", "be-1", "be-2"] {
        wave.bus
            .publish(p, &events::complete(1), serde_json::json!({}))
            .unwrap();
    }
    assert!(matches!(status_of(&machine, 3), GateStatus::Waiting { .. } | GateStatus::Blocked { .. }));
    assert_eq!(journal.violations(Some(1)).unwrap().len(), 3);

    wave.bus
        .publish("qa", &events::qa_approved(1), serde_json::json!({}))
        .unwrap();
    wave.write_log("test.log", "test result: ok. 3 passed\n");
    let (premerge, input) = wave.premerge();
    let report = premerge.run(&input, false).unwrap();
    assert_eq!(report.verdict, Verdict::Rejected);
    assert!(report.failing.contains(&"violations".to_string()));

    let rejected = SignalKey::new(COORDINATOR, events::merge_rejected(1)).unwrap();
    assert!(wave.bus.read(&rejected).is_some());
}

#[test]
fn test_budget_exhaustion_stops_gate_entry() {
    let wave = Wave::new();
    let machine = wave.machine();

    wave.bus
        .publish("fe-1", &events::tokens(1), serde_json::json!({"cost": "3.00"}))
        .unwrap();
    wave.bus
        .publish("be-1", &events::tokens(1), serde_json::json!({"input_cost": 1.5, "output_cost": 0.75}))
        .unwrap();
    let ledger = BudgetLimits::default().ledger(&wave.bus, 1);
    assert_eq!(ledger.total(), "5.25".parse::<Cost>().unwrap());

    let err = machine.can_enter(1, 1).unwrap_err();
    assert_eq!(err.error_code(), "BUDGET_EXCEEDED");

    let (premerge, input) = wave.premerge();
    let report = premerge.evaluate(&input);
    assert!(report.failing.contains(&"budget".to_string()));
}
