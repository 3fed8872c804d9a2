//! Gate state machine
//!
//! Gate status is never stored. It is derived on every call from the signals
//! present on the bus, and prerequisite gates are re-evaluated first so a
//! gate can only be `Ready` when every prerequisite is `Ready` too.

use crate::budget::{BudgetLimits, BudgetStatus};
use crate::error::{CoordinationError, CoordinationResult};
use crate::safety::{CancelContext, SafetyCheck};
use crate::signal::names::SignalPattern;
use crate::signal::SignalBus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// At least `min` signals must match `pattern`. `{wave}` is substituted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRequirement {
    pub pattern: String,
    #[serde(default = "default_min")]
    pub min: usize,
}

fn default_min() -> usize {
    1
}

impl SignalRequirement {
    pub fn new(pattern: &str, min: usize) -> Self {
        Self {
            pattern: pattern.to_string(),
            min,
        }
    }
}

fn expand(template: &str, wave: u32) -> String {
    template.replace("{wave}", &wave.to_string())
}

/// One stage of the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDef {
    pub number: u8,
    pub name: String,
    #[serde(default)]
    pub prerequisites: Vec<u8>,
    #[serde(default)]
    pub requires: Vec<SignalRequirement>,
    /// Any matching signal blocks the gate (rejections, failures)
    #[serde(default)]
    pub blocked_by: Vec<String>,
}

impl GateDef {
    fn new(number: u8, name: &str, prerequisites: &[u8]) -> Self {
        Self {
            number,
            name: name.to_string(),
            prerequisites: prerequisites.to_vec(),
            requires: Vec::new(),
            blocked_by: Vec::new(),
        }
    }

    fn requires(mut self, pattern: &str, min: usize) -> Self {
        self.requires.push(SignalRequirement::new(pattern, min));
        self
    }

    fn blocked_by(mut self, pattern: &str) -> Self {
        self.blocked_by.push(pattern.to_string());
        self
    }
}

/// Ordered gate definitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatePipeline {
    pub gates: Vec<GateDef>,
}

impl GatePipeline {
    /// Preflight → dispatch → development → boundary → qa → review → merge
    ///
    /// Development and boundary each need one signal per worker.
    pub fn standard(workers: usize) -> Self {
        let workers = workers.max(1);
        let gates = vec![
            GateDef::new(0, "preflight", &[]).requires("*.wave-{wave}-preflight-go", 1),
            GateDef::new(1, "dispatch", &[0]).requires("coordinator.wave-{wave}-start", 1),
            GateDef::new(2, "development", &[1])
                .requires("*.wave-{wave}-complete", workers),
            GateDef::new(3, "boundary", &[2])
                .requires("*.wave-{wave}-boundary-pass", workers)
                .blocked_by("*.wave-{wave}-boundary-fail"),
            GateDef::new(4, "qa", &[3])
                .requires("*.wave-{wave}-qa-approved", 1)
                .blocked_by("*.wave-{wave}-qa-rejected"),
            GateDef::new(5, "review", &[4])
                .requires("*.wave-{wave}-review-approved", 1)
                .blocked_by("*.wave-{wave}-review-rejected"),
            GateDef::new(6, "merge", &[5])
                .requires("*.wave-{wave}-merge-approved", 1)
                .blocked_by("*.wave-{wave}-merge-rejected"),
        ];
        Self { gates }
    }

    /// Load a pipeline from YAML, falling back to the standard one when absent
    pub fn load_or_standard(path: &Path, workers: usize) -> CoordinationResult<Self> {
        if !path.exists() {
            return Ok(Self::standard(workers));
        }
        let content = std::fs::read_to_string(path)?;
        let pipeline: GatePipeline = serde_yaml::from_str(&content)?;
        pipeline.validate()?;
        debug!(path = %path.display(), gates = pipeline.gates.len(), "Gate pipeline loaded");
        Ok(pipeline)
    }

    /// Gate numbers must be unique and prerequisites must point backwards,
    /// which also rules out cycles
    pub fn validate(&self) -> CoordinationResult<()> {
        let mut seen = std::collections::HashSet::new();
        for gate in &self.gates {
            if !seen.insert(gate.number) {
                return Err(CoordinationError::invocation(format!(
                    "gate {} defined twice",
                    gate.number
                )));
            }
            for prereq in &gate.prerequisites {
                if *prereq >= gate.number {
                    return Err(CoordinationError::invocation(format!(
                        "gate {} lists prerequisite {} that does not precede it",
                        gate.number, prereq
                    )));
                }
            }
        }
        for gate in &self.gates {
            for prereq in &gate.prerequisites {
                if !seen.contains(prereq) {
                    return Err(CoordinationError::UnknownGate {
                        gate: prereq.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, number: u8) -> Option<&GateDef> {
        self.gates.iter().find(|g| g.number == number)
    }

    /// Look a gate up by number or name
    pub fn find(&self, selector: &str) -> CoordinationResult<&GateDef> {
        let by_number = selector.parse::<u8>().ok().and_then(|n| self.get(n));
        by_number
            .or_else(|| self.gates.iter().find(|g| g.name == selector))
            .ok_or_else(|| CoordinationError::UnknownGate {
                gate: selector.to_string(),
            })
    }
}

/// Derived gate status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GateStatus {
    Ready,
    /// Required signals not yet present (`pattern have/need`)
    Pending { missing: Vec<String> },
    /// A blocking signal is present
    Blocked { by: Vec<String> },
    /// Prerequisite gates not ready
    Waiting { on: Vec<u8> },
}

impl GateStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl std::fmt::Display for GateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Pending { missing } => write!(f, "pending ({})", missing.join(", ")),
            Self::Blocked { by } => write!(f, "blocked by {}", by.join(", ")),
            Self::Waiting { on } => {
                let gates: Vec<String> = on.iter().map(|g| format!("gate {}", g)).collect();
                write!(f, "waiting on {}", gates.join(", "))
            }
        }
    }
}

/// Status line for one gate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateState {
    pub number: u8,
    pub name: String,
    pub status: GateStatus,
}

/// Result of waiting for a gate
#[derive(Debug, Clone, PartialEq)]
pub enum GateAwait {
    Ready,
    Timeout { last: GateStatus },
    Aborted { reason: String },
}

/// Evaluates gates against the signal bus
pub struct GateMachine {
    pipeline: GatePipeline,
    bus: SignalBus,
    safety: Option<Arc<dyn SafetyCheck>>,
    budget: Option<BudgetLimits>,
}

impl GateMachine {
    pub fn new(pipeline: GatePipeline, bus: SignalBus) -> Self {
        Self {
            pipeline,
            bus,
            safety: None,
            budget: None,
        }
    }

    pub fn with_safety(mut self, safety: Arc<dyn SafetyCheck>) -> Self {
        self.safety = Some(safety);
        self
    }

    pub fn with_budget(mut self, budget: BudgetLimits) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn pipeline(&self) -> &GatePipeline {
        &self.pipeline
    }

    fn evaluate_one(
        &self,
        gate: &GateDef,
        wave: u32,
        known: &BTreeMap<u8, GateStatus>,
    ) -> CoordinationResult<GateStatus> {
        let waiting: Vec<u8> = gate
            .prerequisites
            .iter()
            .copied()
            .filter(|p| !known.get(p).is_some_and(GateStatus::is_ready))
            .collect();
        if !waiting.is_empty() {
            return Ok(GateStatus::Waiting { on: waiting });
        }

        let mut blockers = Vec::new();
        for template in &gate.blocked_by {
            let pattern = SignalPattern::new(expand(template, wave))?;
            blockers.extend(self.bus.list(&pattern).iter().map(|s| s.key().to_string()));
        }
        if !blockers.is_empty() {
            return Ok(GateStatus::Blocked { by: blockers });
        }

        let mut missing = Vec::new();
        for req in &gate.requires {
            let pattern = SignalPattern::new(expand(&req.pattern, wave))?;
            let have = self.bus.count(&pattern);
            if have < req.min {
                missing.push(format!("{} {}/{}", pattern, have, req.min));
            }
        }
        if !missing.is_empty() {
            return Ok(GateStatus::Pending { missing });
        }
        Ok(GateStatus::Ready)
    }

    /// Status of every gate, in pipeline order
    pub fn evaluate(&self, wave: u32) -> CoordinationResult<Vec<GateState>> {
        let mut gates: Vec<&GateDef> = self.pipeline.gates.iter().collect();
        gates.sort_by_key(|g| g.number);

        let mut known = BTreeMap::new();
        let mut states = Vec::with_capacity(gates.len());
        for gate in gates {
            let status = self.evaluate_one(gate, wave, &known)?;
            known.insert(gate.number, status.clone());
            states.push(GateState {
                number: gate.number,
                name: gate.name.clone(),
                status,
            });
        }
        Ok(states)
    }

    /// Status of one gate; prerequisites are re-evaluated on every call
    pub fn status(&self, wave: u32, gate: u8) -> CoordinationResult<GateStatus> {
        if self.pipeline.get(gate).is_none() {
            return Err(CoordinationError::UnknownGate {
                gate: gate.to_string(),
            });
        }
        self.evaluate(wave)?
            .into_iter()
            .find(|s| s.number == gate)
            .map(|s| s.status)
            .ok_or_else(|| CoordinationError::UnknownGate {
                gate: gate.to_string(),
            })
    }

    /// Whether work for `gate` may start: every prerequisite ready.
    ///
    /// Fails fast when the kill switch is tripped or the wave budget is
    /// exhausted.
    pub fn can_enter(&self, wave: u32, gate: u8) -> CoordinationResult<bool> {
        if let Some(safety) = &self.safety {
            let status = safety.status();
            if !status.is_safe() {
                return Err(CoordinationError::safety(status.to_string()));
            }
        }
        if let Some(budget) = &self.budget {
            let ledger = budget.ledger(&self.bus, wave);
            match ledger.status() {
                BudgetStatus::Exceeded => return ledger.ensure_within_limit().map(|_| false),
                BudgetStatus::Warn => {
                    warn!(wave, spent = %ledger.total(), limit = %ledger.limit(), "Budget warning")
                }
                BudgetStatus::Ok => {}
            }
        }

        let def = self
            .pipeline
            .get(gate)
            .ok_or_else(|| CoordinationError::UnknownGate {
                gate: gate.to_string(),
            })?;
        let states = self.evaluate(wave)?;
        let ready = def.prerequisites.iter().all(|p| {
            states
                .iter()
                .any(|s| s.number == *p && s.status.is_ready())
        });
        debug!(wave, gate, ready, "Gate entry checked");
        Ok(ready)
    }

    /// Poll until the gate is ready, the timeout elapses or the context is
    /// cancelled. Same cancellation semantics as
    /// [`SignalBus::await_signal`].
    pub async fn await_gate(
        &self,
        wave: u32,
        gate: u8,
        timeout: Duration,
        ctx: &CancelContext,
    ) -> CoordinationResult<GateAwait> {
        let deadline = Instant::now() + timeout;
        let poll = self.bus.poll_interval();

        loop {
            if let Some(reason) = ctx.cancel_reason() {
                warn!(wave, gate, %reason, "Gate wait aborted");
                return Ok(GateAwait::Aborted { reason });
            }

            let status = self.status(wave, gate)?;
            if status.is_ready() {
                info!(wave, gate, "Gate ready");
                return Ok(GateAwait::Ready);
            }

            let now = Instant::now();
            if now >= deadline {
                info!(wave, gate, %status, "Gate wait timed out");
                return Ok(GateAwait::Timeout { last: status });
            }

            tokio::select! {
                _ = tokio::time::sleep(poll.min(deadline - now)) => {}
                _ = ctx.token().cancelled() => {}
            }
        }
    }
}
