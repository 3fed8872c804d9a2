//! Domain Boundary Validator
//!
//! Classifies every changed path of one participant, first match wins:
//! 1. shared forbid list (applies to everyone)
//! 2. participant forbid list, when an allow list is defined
//! 3. outside the allow list, unless a tolerated project-root file
//! 4. allowed

use super::changes::ChangeSet;
use super::policy::{normalize_path, BoundaryRules, DomainPolicy};
use crate::error::CoordinationResult;
use crate::journal::{EventLog, JournalEvent, ViolationRecord};
use crate::signal::names::{events, SignalKey};
use crate::signal::SignalBus;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Why a path was flagged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ViolationReason {
    SharedForbid { pattern: String },
    Forbidden { pattern: String },
    OutsideAllowList,
}

impl std::fmt::Display for ViolationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SharedForbid { pattern } => write!(f, "matches shared forbid '{}'", pattern),
            Self::Forbidden { pattern } => write!(f, "matches forbidden path '{}'", pattern),
            Self::OutsideAllowList => write!(f, "outside allowed paths"),
        }
    }
}

/// Outcome for a single path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathDecision {
    Allowed,
    Tolerated,
    Violation(ViolationReason),
}

impl PathDecision {
    pub fn is_violation(&self) -> bool {
        matches!(self, Self::Violation(_))
    }
}

/// Result of validating one participant's change set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundaryReport {
    pub participant: String,
    pub wave: u32,
    pub checked: usize,
    pub violations: Vec<ViolationRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerated: Vec<String>,
}

impl BoundaryReport {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn violation_count(&self) -> usize {
        self.violations.len()
    }
}

/// Validator holding the rules shared by all participants
#[derive(Debug, Clone, Default)]
pub struct BoundaryValidator {
    rules: BoundaryRules,
}

impl BoundaryValidator {
    pub fn new(rules: BoundaryRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &BoundaryRules {
        &self.rules
    }

    pub fn classify(&self, policy: &DomainPolicy, path: &str) -> PathDecision {
        let path = normalize_path(path);

        if let Some(p) = self.rules.shared_forbid.iter().find(|p| p.matches(&path)) {
            return PathDecision::Violation(ViolationReason::SharedForbid {
                pattern: p.to_string(),
            });
        }

        if !policy.has_allow_list() {
            return PathDecision::Allowed;
        }

        if let Some(p) = policy.forbid.iter().find(|p| p.matches(&path)) {
            return PathDecision::Violation(ViolationReason::Forbidden {
                pattern: p.to_string(),
            });
        }

        if policy.allow.iter().any(|p| p.matches(&path)) {
            PathDecision::Allowed
        } else if self.rules.is_tolerated(&path) {
            PathDecision::Tolerated
        } else {
            PathDecision::Violation(ViolationReason::OutsideAllowList)
        }
    }

    /// Pure classification of a whole change set
    pub fn validate(&self, wave: u32, policy: &DomainPolicy, changes: &ChangeSet) -> BoundaryReport {
        let mut violations = Vec::new();
        let mut tolerated = Vec::new();

        for file in changes.files() {
            match self.classify(policy, file) {
                PathDecision::Allowed => {}
                PathDecision::Tolerated => tolerated.push(file.to_string()),
                PathDecision::Violation(reason) => {
                    warn!(participant = %policy.participant, file, %reason, "Boundary violation");
                    violations.push(
                        ViolationRecord::new(&policy.participant, file, reason.to_string())
                            .in_wave(wave),
                    );
                }
            }
        }

        BoundaryReport {
            participant: policy.participant.clone(),
            wave,
            checked: changes.len(),
            violations,
            tolerated,
        }
    }

    /// Append the report's violations to the journal and publish the
    /// participant's `boundary-pass` / `boundary-fail` signal, withdrawing the
    /// opposite one from an earlier run.
    pub fn record(
        &self,
        report: &BoundaryReport,
        journal: &EventLog,
        bus: &SignalBus,
    ) -> CoordinationResult<()> {
        let entries: Vec<JournalEvent> = report
            .violations
            .iter()
            .cloned()
            .map(JournalEvent::Violation)
            .collect();
        journal.append_all(&entries)?;

        let (event, stale) = if report.passed() {
            (events::boundary_pass(report.wave), events::boundary_fail(report.wave))
        } else {
            (events::boundary_fail(report.wave), events::boundary_pass(report.wave))
        };
        bus.publish(
            &report.participant,
            &event,
            serde_json::json!({
                "checked": report.checked,
                "violations": report.violation_count(),
                "files": report.violations.iter().map(|v| v.file.as_str()).collect::<Vec<_>>(),
            }),
        )?;
        bus.store()
            .remove(&SignalKey::new(&report.participant, stale)?)?;

        info!(
            participant = %report.participant,
            wave = report.wave,
            violations = report.violation_count(),
            "Boundary check recorded"
        );
        Ok(())
    }
}
