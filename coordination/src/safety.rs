//! Kill switch and cooperative cancellation
//!
//! Two independent stop conditions: a global marker file that halts every
//! participant, and a per-participant `stop` signal. Nothing is preempted;
//! long-running operations observe the switch at their next checkpoint.

use crate::error::{CoordinationError, CoordinationResult};
use crate::signal::names::{events, SignalKey, COORDINATOR};
use crate::signal::store::SharedSignalStore;
use crate::signal::types::Signal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Result of a safety check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SafetyStatus {
    Clear,
    GlobalStop { reason: String },
    ParticipantStop { participant: String, reason: String },
}

impl SafetyStatus {
    pub fn is_safe(&self) -> bool {
        matches!(self, Self::Clear)
    }
}

impl std::fmt::Display for SafetyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Clear => write!(f, "clear"),
            Self::GlobalStop { reason } => write!(f, "global stop: {}", reason),
            Self::ParticipantStop {
                participant,
                reason,
            } => write!(f, "{} stopped: {}", participant, reason),
        }
    }
}

/// Predicate consulted on every iteration of a polling loop
pub trait SafetyCheck: Send + Sync {
    fn status(&self) -> SafetyStatus;

    fn is_safe(&self) -> bool {
        self.status().is_safe()
    }
}

/// Content of the global marker file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopMarker {
    pub reason: String,
    pub tripped_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tripped_by: Option<String>,
}

/// Global + per-participant stop conditions
#[derive(Clone)]
pub struct KillSwitch {
    global_marker: PathBuf,
    store: SharedSignalStore,
    participant: Option<String>,
}

impl KillSwitch {
    pub fn new(global_marker: impl AsRef<Path>, store: SharedSignalStore) -> Self {
        Self {
            global_marker: global_marker.as_ref().to_path_buf(),
            store,
            participant: None,
        }
    }

    /// Also honour the stop signal addressed to this participant
    pub fn for_participant(mut self, participant: impl Into<String>) -> Self {
        self.participant = Some(participant.into());
        self
    }

    pub fn global_marker(&self) -> &Path {
        &self.global_marker
    }

    /// `!global_marker_present && !participant_marker_present`
    pub fn is_safe(&self) -> bool {
        self.status().is_safe()
    }

    fn global_status(&self) -> Option<SafetyStatus> {
        if !self.global_marker.exists() {
            return None;
        }
        // An unreadable marker still means stop.
        let reason = std::fs::read_to_string(&self.global_marker)
            .ok()
            .and_then(|content| serde_json::from_str::<StopMarker>(&content).ok())
            .map(|marker| marker.reason)
            .unwrap_or_else(|| "emergency stop marker present".to_string());
        Some(SafetyStatus::GlobalStop { reason })
    }

    /// Stop status for a specific participant, ignoring the global marker
    pub fn participant_status(&self, participant: &str) -> SafetyStatus {
        let Ok(key) = SignalKey::new(participant, events::STOP) else {
            return SafetyStatus::Clear;
        };
        match self.store.get(&key) {
            Ok(Some(signal)) => SafetyStatus::ParticipantStop {
                participant: participant.to_string(),
                reason: signal
                    .payload
                    .get("reason")
                    .and_then(|r| r.as_str())
                    .unwrap_or("stop requested")
                    .to_string(),
            },
            Ok(None) => SafetyStatus::Clear,
            Err(e) => {
                warn!(participant, "Unreadable stop signal treated as stop: {}", e);
                SafetyStatus::ParticipantStop {
                    participant: participant.to_string(),
                    reason: "unreadable stop signal".to_string(),
                }
            }
        }
    }

    /// Trip the global marker
    pub fn trip_global(&self, reason: &str) -> CoordinationResult<()> {
        if let Some(parent) = self.global_marker.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let marker = StopMarker {
            reason: reason.to_string(),
            tripped_at: Utc::now(),
            tripped_by: self.participant.clone(),
        };
        std::fs::write(&self.global_marker, serde_json::to_string_pretty(&marker)?)?;
        warn!(reason, marker = %self.global_marker.display(), "Global kill switch tripped");
        Ok(())
    }

    /// Remove the global marker; returns whether it was present
    pub fn clear_global(&self) -> CoordinationResult<bool> {
        match std::fs::remove_file(&self.global_marker) {
            Ok(()) => {
                info!("Global kill switch cleared");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Publish a stop signal for one participant
    pub fn stop_participant(&self, participant: &str, reason: &str) -> CoordinationResult<PathBuf> {
        let key = SignalKey::new(participant, events::STOP)?;
        let signal = Signal::new(
            &key,
            serde_json::json!({
                "reason": reason,
                "requested_by": self.participant.as_deref().unwrap_or(COORDINATOR),
            }),
        );
        let path = self.store.put(&signal)?;
        warn!(participant, reason, "Participant stop requested");
        Ok(path)
    }

    /// Withdraw a participant's stop signal
    pub fn resume_participant(&self, participant: &str) -> CoordinationResult<bool> {
        let key = SignalKey::new(participant, events::STOP)?;
        let removed = self.store.remove(&key)?;
        if removed {
            info!(participant, "Participant stop withdrawn");
        }
        Ok(removed)
    }

    /// Fail fast with a `Safety` error if the switch is tripped
    pub fn ensure_safe(&self) -> CoordinationResult<()> {
        match self.status() {
            SafetyStatus::Clear => Ok(()),
            status => Err(CoordinationError::safety(status.to_string())),
        }
    }
}

impl SafetyCheck for KillSwitch {
    fn status(&self) -> SafetyStatus {
        if let Some(global) = self.global_status() {
            return global;
        }
        match &self.participant {
            Some(participant) => self.participant_status(participant),
            None => SafetyStatus::Clear,
        }
    }
}

/// Cancellation context passed into every blocking call.
///
/// Wraps a [`CancellationToken`] with an optional safety predicate; when the
/// predicate reports unsafe the token is cancelled, so clones handed to other
/// tasks observe it too.
#[derive(Clone, Default)]
pub struct CancelContext {
    token: CancellationToken,
    safety: Option<Arc<dyn SafetyCheck>>,
}

impl CancelContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire a safety predicate as the token's cancellation condition
    pub fn with_safety(mut self, check: Arc<dyn SafetyCheck>) -> Self {
        self.safety = Some(check);
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Request cancellation explicitly
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// `Some(reason)` if the operation must stop now
    pub fn cancel_reason(&self) -> Option<String> {
        if self.token.is_cancelled() {
            return Some("cancelled".to_string());
        }
        let check = self.safety.as_ref()?;
        match check.status() {
            SafetyStatus::Clear => None,
            status => {
                self.token.cancel();
                Some(status.to_string())
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_reason().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::store::{FsSignalStore, MemorySignalStore};
    use tempfile::tempdir;

    #[test]
    fn test_clear_by_default() {
        let dir = tempdir().unwrap();
        let switch = KillSwitch::new(dir.path().join("EMERGENCY-STOP"), MemorySignalStore::shared())
            .for_participant("fe-1");
        assert!(switch.is_safe());
    }

    #[test]
    fn test_global_marker_stops_everyone() {
        let dir = tempdir().unwrap();
        let store: SharedSignalStore = Arc::new(FsSignalStore::new(dir.path().join("signals")));
        let switch = KillSwitch::new(dir.path().join("EMERGENCY-STOP"), store);
        switch.trip_global("runaway cost").unwrap();

        let fe = switch.clone().for_participant("fe-1");
        assert_eq!(
            fe.status(),
            SafetyStatus::GlobalStop {
                reason: "runaway cost".into()
            }
        );
        assert!(switch.ensure_safe().is_err());

        assert!(switch.clear_global().unwrap());
        assert!(fe.is_safe());
        assert!(!switch.clear_global().unwrap());
    }

    #[test]
    fn test_participant_stop_is_scoped() {
        let dir = tempdir().unwrap();
        let store = MemorySignalStore::shared();
        let switch = KillSwitch::new(dir.path().join("EMERGENCY-STOP"), store);
        switch.stop_participant("fe-1", "boundary violation").unwrap();

        assert!(!switch.clone().for_participant("fe-1").is_safe());
        assert!(switch.clone().for_participant("fe-2").is_safe());

        assert!(switch.resume_participant("fe-1").unwrap());
        assert!(switch.clone().for_participant("fe-1").is_safe());
    }

    #[test]
    fn test_unparseable_marker_still_stops() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("EMERGENCY-STOP");
        std::fs::write(&marker, "STOP").unwrap();
        let switch = KillSwitch::new(&marker, MemorySignalStore::shared());
        assert!(!switch.is_safe());
    }

    #[test]
    fn test_cancel_context_trips_token_from_predicate() {
        let dir = tempdir().unwrap();
        let switch = KillSwitch::new(dir.path().join("EMERGENCY-STOP"), MemorySignalStore::shared());
        let ctx = CancelContext::new().with_safety(Arc::new(switch.clone()));
        assert!(!ctx.is_cancelled());

        switch.trip_global("halt").unwrap();
        assert!(ctx.cancel_reason().unwrap().contains("halt"));
        assert!(ctx.token().is_cancelled());
    }
}
