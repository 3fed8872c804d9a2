//! Signal record and well-known payloads

use super::names::SignalKey;
use crate::budget::Cost;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A named record in the shared signals directory.
///
/// Signals are never mutated in place: publishing the same key again replaces
/// the whole file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub participant: String,
    pub event: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Signal {
    pub fn new(key: &SignalKey, payload: serde_json::Value) -> Self {
        Self {
            participant: key.participant.clone(),
            event: key.event.clone(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn key(&self) -> SignalKey {
        SignalKey {
            participant: self.participant.clone(),
            event: self.event.clone(),
        }
    }

    /// Decode the payload into a typed shape, `None` if it does not fit
    pub fn payload_as<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.payload.clone()).ok()
    }

    /// Read a boolean flag from the payload, absent means `false`
    pub fn flag(&self, field: &str) -> bool {
        self.payload
            .get(field)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Payload of a `wave-N-complete` signal
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionPayload {
    /// Work items this participant finished (or failed)
    #[serde(default)]
    pub stories: Vec<String>,
    /// `complete` or `failed`
    #[serde(default = "default_completion_status")]
    pub status: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

fn default_completion_status() -> String {
    "complete".to_string()
}

/// Payload of a `wave-N-tokens` signal. Cumulative per participant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsagePayload {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_cost: Option<Cost>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_cost: Option<Cost>,
    /// Combined cost when the producer does not split input/output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<Cost>,
}

/// Payload of a `wave-N-retry-*` signal
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryPayload {
    /// Story id or gate number being retried
    pub target: String,
    /// Attempt number as seen by the producer (1-indexed)
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_serializes_required_fields() {
        let key = SignalKey::new("fe-1", "wave-1-complete").unwrap();
        let signal = Signal::new(&key, serde_json::json!({"stories": ["S-1"]}));
        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["participant"], "fe-1");
        assert_eq!(json["event"], "wave-1-complete");
        assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));
        assert_eq!(json["payload"]["stories"][0], "S-1");
    }

    #[test]
    fn test_completion_payload_defaults() {
        let key = SignalKey::new("be-1", "wave-1-complete").unwrap();
        let signal = Signal::new(&key, serde_json::json!({"stories": ["B-1"]}));
        let payload: CompletionPayload = signal.payload_as().unwrap();
        assert_eq!(payload.status, "complete");
        assert!(payload.artifacts.is_empty());
    }

    #[test]
    fn test_flag_defaults_to_false() {
        let key = SignalKey::new("qa", "wave-1-escalation").unwrap();
        let signal = Signal::new(&key, serde_json::json!({"resolved": true}));
        assert!(signal.flag("resolved"));
        assert!(!signal.flag("missing"));
    }
}
