//! Retry/Escalation Controller
//!
//! Counts retries per story or gate within a wave. Once a scope reaches its
//! maximum it is escalated to a human and stays escalated for the rest of the
//! wave; nothing resets it.

use crate::error::{CoordinationError, CoordinationResult};
use crate::journal::{EventLog, JournalEvent};
use crate::signal::names::{events, SignalKey, SignalPattern, COORDINATOR};
use crate::signal::types::RetryPayload;
use crate::signal::SignalBus;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Default maximum retries per scope
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// What is being retried
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum RetryTarget {
    Story(String),
    Gate(u8),
}

impl RetryTarget {
    /// Parse `gate:N` / `gate-N` as a gate, anything else as a story id
    pub fn parse(raw: &str) -> Self {
        let gate = raw
            .strip_prefix("gate:")
            .or_else(|| raw.strip_prefix("gate-"))
            .and_then(|n| n.parse().ok());
        match gate {
            Some(n) => Self::Gate(n),
            None => Self::Story(raw.strip_prefix("story:").unwrap_or(raw).to_string()),
        }
    }
}

impl std::fmt::Display for RetryTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Story(id) => write!(f, "story:{}", id),
            Self::Gate(n) => write!(f, "gate:{}", n),
        }
    }
}

/// A retry counter's key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RetryScope {
    pub wave: u32,
    pub target: RetryTarget,
}

impl RetryScope {
    pub fn story(wave: u32, id: impl Into<String>) -> Self {
        Self {
            wave,
            target: RetryTarget::Story(id.into()),
        }
    }

    pub fn gate(wave: u32, gate: u8) -> Self {
        Self {
            wave,
            target: RetryTarget::Gate(gate),
        }
    }
}

impl std::fmt::Display for RetryScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "wave-{}/{}", self.wave, self.target)
    }
}

/// Counter for one scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    pub scope: RetryScope,
    pub count: u32,
    pub max: u32,
    pub escalated: bool,
}

impl RetryState {
    fn new(scope: RetryScope, max: u32) -> Self {
        Self {
            scope,
            count: 0,
            max,
            escalated: false,
        }
    }

    pub fn can_retry(&self) -> bool {
        !self.escalated && self.count < self.max
    }

    pub fn remaining(&self) -> u32 {
        if self.escalated {
            0
        } else {
            self.max.saturating_sub(self.count)
        }
    }
}

/// What the caller should do after recording a retry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry permitted; `attempt` is the count just recorded
    Retry { attempt: u32, remaining: u32 },
    /// This retry hit the limit; the scope is now escalated
    Escalate { count: u32 },
}

/// Per-wave retry bookkeeping with optional journal and signal side effects
pub struct RetryController {
    max: u32,
    states: BTreeMap<RetryScope, RetryState>,
    journal: Option<EventLog>,
    bus: Option<SignalBus>,
}

impl RetryController {
    pub fn new(max: u32) -> Self {
        Self {
            max,
            states: BTreeMap::new(),
            journal: None,
            bus: None,
        }
    }

    /// Journal retry and escalation events
    pub fn with_journal(mut self, journal: EventLog) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Publish escalation signals
    pub fn with_bus(mut self, bus: SignalBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Rebuild state for a wave from the journal and any retry signals
    pub fn load(&mut self, wave: u32) -> CoordinationResult<()> {
        if let Some(journal) = &self.journal {
            let history = journal.for_wave(wave)?;
            self.replay(wave, &history);
        }
        if let Some(bus) = self.bus.clone() {
            self.observe_signals(&bus, wave)?;
        }
        debug!(wave, scopes = self.states.len(), "Retry state loaded");
        Ok(())
    }

    /// Apply journaled retry and escalation events without side effects
    pub fn replay(&mut self, wave: u32, history: &[JournalEvent]) {
        for event in history {
            let (scope, count, escalated) = match event {
                JournalEvent::RetryRecorded {
                    wave: w,
                    scope,
                    count,
                    ..
                } if *w == wave => (scope, *count, false),
                JournalEvent::Escalated {
                    wave: w,
                    scope,
                    count,
                    ..
                } if *w == wave => (scope, *count, true),
                _ => continue,
            };
            let state = self.entry(RetryScope {
                wave,
                target: RetryTarget::parse(scope),
            });
            state.count = state.count.max(count);
            state.escalated |= escalated;
        }
    }

    /// Fold `wave-N-retry-*` signals into the counters.
    ///
    /// A signal's `attempt` raises the count to at least that value; reaching
    /// the maximum escalates the scope.
    pub fn observe_signals(&mut self, bus: &SignalBus, wave: u32) -> CoordinationResult<()> {
        let pattern = SignalPattern::new(format!("*.wave-{}-retry-*", wave))?;
        for signal in bus.list(&pattern) {
            let Some(payload) = signal.payload_as::<RetryPayload>() else {
                warn!(signal = %signal.key(), "Ignoring malformed retry signal");
                continue;
            };
            let scope = RetryScope {
                wave,
                target: RetryTarget::parse(&payload.target),
            };
            let max = self.max;
            let state = self.entry(scope.clone());
            if payload.attempt <= state.count {
                continue;
            }
            state.count = payload.attempt;
            if state.count >= max && !state.escalated {
                let reason = payload
                    .reason
                    .unwrap_or_else(|| format!("retry limit {} reached", max));
                self.escalate(&scope, &reason)?;
            }
        }
        Ok(())
    }

    fn entry(&mut self, scope: RetryScope) -> &mut RetryState {
        let max = self.max;
        self.states
            .entry(scope.clone())
            .or_insert_with(|| RetryState::new(scope, max))
    }

    /// Increment the counter for `scope`.
    ///
    /// Fails with `RetryLimitExceeded` if the scope is already escalated; the
    /// retry that reaches the maximum returns [`RetryDecision::Escalate`].
    pub fn record_retry(&mut self, scope: &RetryScope) -> CoordinationResult<RetryDecision> {
        let state = self.entry(scope.clone());
        if state.escalated {
            return Err(CoordinationError::RetryLimitExceeded {
                scope: scope.to_string(),
                count: state.count,
                max: state.max,
            });
        }
        state.count += 1;
        let (count, max) = (state.count, state.max);

        if let Some(journal) = &self.journal {
            journal.append(&JournalEvent::RetryRecorded {
                wave: scope.wave,
                scope: scope.target.to_string(),
                count,
                max,
                timestamp: Utc::now(),
            })?;
        }

        if count >= max {
            self.escalate(scope, &format!("retry limit {} reached", max))?;
            return Ok(RetryDecision::Escalate { count });
        }

        info!(scope = %scope, attempt = count, max, "Retry recorded");
        Ok(RetryDecision::Retry {
            attempt: count,
            remaining: max - count,
        })
    }

    fn escalate(&mut self, scope: &RetryScope, reason: &str) -> CoordinationResult<()> {
        let state = self.entry(scope.clone());
        state.escalated = true;
        let count = state.count;
        warn!(scope = %scope, count, reason, "Scope escalated to human review");

        if let Some(journal) = &self.journal {
            journal.append(&JournalEvent::Escalated {
                wave: scope.wave,
                scope: scope.target.to_string(),
                count,
                reason: reason.to_string(),
                timestamp: Utc::now(),
            })?;
        }

        if let Some(bus) = &self.bus {
            // One escalation record per wave listing every escalated scope.
            let event = events::escalation(scope.wave);
            let key = SignalKey::new(COORDINATOR, &event)?;
            let mut scopes: Vec<String> = bus
                .read(&key)
                .and_then(|s| s.payload.get("scopes").cloned())
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            let label = scope.target.to_string();
            if !scopes.contains(&label) {
                scopes.push(label);
            }
            bus.publish(
                COORDINATOR,
                &event,
                serde_json::json!({
                    "scopes": scopes,
                    "reason": reason,
                    "resolved": false,
                }),
            )?;
        }
        Ok(())
    }

    /// `count < max` and not escalated; unknown scopes can retry
    pub fn can_retry(&self, scope: &RetryScope) -> bool {
        self.states
            .get(scope)
            .map(RetryState::can_retry)
            .unwrap_or(self.max > 0)
    }

    pub fn state(&self, scope: &RetryScope) -> Option<&RetryState> {
        self.states.get(scope)
    }

    /// All counters for a wave
    pub fn states_for_wave(&self, wave: u32) -> Vec<&RetryState> {
        self.states.values().filter(|s| s.scope.wave == wave).collect()
    }

    /// Whether any scope in the wave reached the limit
    pub fn wave_exhausted(&self, wave: u32) -> bool {
        self.states
            .values()
            .any(|s| s.scope.wave == wave && s.escalated)
    }
}

impl Default for RetryController {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::MemorySignalStore;
    use tempfile::tempdir;

    #[test]
    fn test_escalation_is_one_way() {
        let mut controller = RetryController::new(3);
        let scope = RetryScope::story(1, "FE-001");

        assert!(controller.can_retry(&scope));
        controller.record_retry(&scope).unwrap();
        controller.record_retry(&scope).unwrap();
        assert!(controller.can_retry(&scope));

        let decision = controller.record_retry(&scope).unwrap();
        assert_eq!(decision, RetryDecision::Escalate { count: 3 });
        assert!(!controller.can_retry(&scope));
        assert!(!controller.can_retry(&scope));

        let err = controller.record_retry(&scope).unwrap_err();
        assert!(matches!(err, CoordinationError::RetryLimitExceeded { count: 3, .. }));
        assert!(controller.wave_exhausted(1));
        assert!(!controller.wave_exhausted(2));
    }

    #[test]
    fn test_retry_decision_reports_remaining() {
        let mut controller = RetryController::default();
        let decision = controller.record_retry(&RetryScope::gate(1, 4)).unwrap();
        assert_eq!(
            decision,
            RetryDecision::Retry {
                attempt: 1,
                remaining: 2
            }
        );
    }

    #[test]
    fn test_state_survives_reload_from_journal() {
        let dir = tempdir().unwrap();
        let journal = EventLog::new(dir.path().join("journal.jsonl"));
        let bus = SignalBus::new(MemorySignalStore::shared());
        let scope = RetryScope::story(2, "BE-7");

        {
            let mut controller = RetryController::new(2)
                .with_journal(journal.clone())
                .with_bus(bus.clone());
            controller.record_retry(&scope).unwrap();
            controller.record_retry(&scope).unwrap();
        }

        let escalation = SignalKey::new(COORDINATOR, "wave-2-escalation").unwrap();
        let signal = bus.read(&escalation).unwrap();
        assert_eq!(signal.payload["scopes"][0], "story:BE-7");
        assert!(!signal.flag("resolved"));

        let mut reloaded = RetryController::new(2).with_journal(journal);
        reloaded.load(2).unwrap();
        assert!(!reloaded.can_retry(&scope));
        assert_eq!(reloaded.state(&scope).unwrap().count, 2);
    }

    #[test]
    fn test_retry_signals_raise_count() {
        let bus = SignalBus::new(MemorySignalStore::shared());
        bus.publish(
            "fe-1",
            &events::retry(1, "FE-001"),
            serde_json::json!({"target": "FE-001", "attempt": 3, "reason": "tests keep failing"}),
        )
        .unwrap();
        bus.publish(
            "qa",
            &events::retry(1, "gate-4"),
            serde_json::json!({"target": "gate-4", "attempt": 1}),
        )
        .unwrap();

        let mut controller = RetryController::new(3).with_bus(bus.clone());
        controller.load(1).unwrap();

        assert!(!controller.can_retry(&RetryScope::story(1, "FE-001")));
        assert!(controller.can_retry(&RetryScope::gate(1, 4)));
        assert_eq!(controller.state(&RetryScope::gate(1, 4)).unwrap().count, 1);
        assert!(bus
            .read(&SignalKey::new(COORDINATOR, "wave-1-escalation").unwrap())
            .is_some());
    }

    #[test]
    fn test_target_parse() {
        assert_eq!(RetryTarget::parse("gate:3"), RetryTarget::Gate(3));
        assert_eq!(RetryTarget::parse("gate-5"), RetryTarget::Gate(5));
        assert_eq!(RetryTarget::parse("story:A-1"), RetryTarget::Story("A-1".into()));
        assert_eq!(RetryTarget::parse("A-1"), RetryTarget::Story("A-1".into()));
    }
}
