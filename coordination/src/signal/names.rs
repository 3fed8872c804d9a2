//! Signal names, keys and patterns
//!
//! A signal is addressed by `(participant, event)`. Both halves are restricted
//! to `[a-z0-9][a-z0-9_-]*`, so the file name `signal-{participant}.{event}.json`
//! can never collide across different pairs.

use crate::error::{CoordinationError, CoordinationResult};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};

/// File name prefix for every signal file
pub const SIGNAL_PREFIX: &str = "signal-";

/// File name suffix for every signal file
pub const SIGNAL_SUFFIX: &str = ".json";

/// Participant name used by the coordinator process itself
pub const COORDINATOR: &str = "coordinator";

/// Validate a participant or event identifier
pub fn validate_identifier(name: &str) -> CoordinationResult<()> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(CoordinationError::invalid_name(name, "empty"));
    };
    if !(first.is_ascii_lowercase() || first.is_ascii_digit()) {
        return Err(CoordinationError::invalid_name(
            name,
            "must start with a lowercase letter or digit",
        ));
    }
    if let Some(bad) =
        chars.find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == '_'))
    {
        return Err(CoordinationError::invalid_name(
            name,
            format!("character '{}' is not allowed", bad),
        ));
    }
    Ok(())
}

/// Lowercase an arbitrary id (e.g. a story id like `STORY-12`) into an identifier
pub fn slug(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Address of a signal
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignalKey {
    pub participant: String,
    pub event: String,
}

impl SignalKey {
    /// Create a validated key
    pub fn new(
        participant: impl Into<String>,
        event: impl Into<String>,
    ) -> CoordinationResult<Self> {
        let key = Self {
            participant: participant.into(),
            event: event.into(),
        };
        validate_identifier(&key.participant)?;
        validate_identifier(&key.event)?;
        Ok(key)
    }

    /// File name this key is stored under
    pub fn file_name(&self) -> String {
        format!("{}{}{}", SIGNAL_PREFIX, self, SIGNAL_SUFFIX)
    }

    /// Parse a key back out of a signal file name
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        let stem = file_name
            .strip_prefix(SIGNAL_PREFIX)?
            .strip_suffix(SIGNAL_SUFFIX)?;
        let (participant, event) = stem.split_once('.')?;
        Self::new(participant, event).ok()
    }
}

impl std::fmt::Display for SignalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.participant, self.event)
    }
}

/// Glob pattern over `participant.event`, e.g. `*.wave-1-complete`
#[derive(Debug, Clone)]
pub struct SignalPattern {
    raw: String,
    matcher: Matcher,
}

#[derive(Debug, Clone)]
enum Matcher {
    Exact(SignalKey),
    Glob(GlobMatcher),
}

impl SignalPattern {
    pub fn new(pattern: impl Into<String>) -> CoordinationResult<Self> {
        let raw = pattern.into();
        let matcher = Glob::new(&raw)
            .map_err(|e| CoordinationError::invalid_pattern(&raw, e.to_string()))?
            .compile_matcher();
        Ok(Self {
            raw,
            matcher: Matcher::Glob(matcher),
        })
    }

    /// Pattern matching exactly one key
    pub fn exact(key: &SignalKey) -> Self {
        Self {
            raw: key.to_string(),
            matcher: Matcher::Exact(key.clone()),
        }
    }

    pub fn matches(&self, key: &SignalKey) -> bool {
        match &self.matcher {
            Matcher::Exact(expected) => expected == key,
            Matcher::Glob(glob) => glob.is_match(key.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl std::fmt::Display for SignalPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Well-known event names. Every wave-scoped event is prefixed `wave-{n}-`.
pub mod events {
    use super::slug;

    /// Per-participant stop request (kill switch)
    pub const STOP: &str = "stop";

    pub fn start(wave: u32) -> String {
        format!("wave-{}-start", wave)
    }

    pub fn assign(wave: u32, story_id: &str) -> String {
        format!("wave-{}-assign-{}", wave, slug(story_id))
    }

    pub fn complete(wave: u32) -> String {
        format!("wave-{}-complete", wave)
    }

    pub fn tokens(wave: u32) -> String {
        format!("wave-{}-tokens", wave)
    }

    pub fn retry(wave: u32, target: &str) -> String {
        format!("wave-{}-retry-{}", wave, slug(target))
    }

    pub fn escalation(wave: u32) -> String {
        format!("wave-{}-escalation", wave)
    }

    pub fn escalation_urgent(wave: u32) -> String {
        format!("wave-{}-escalation-urgent", wave)
    }

    pub fn escalation_security(wave: u32) -> String {
        format!("wave-{}-escalation-security", wave)
    }

    pub fn preflight_go(wave: u32) -> String {
        format!("wave-{}-preflight-go", wave)
    }

    pub fn boundary_pass(wave: u32) -> String {
        format!("wave-{}-boundary-pass", wave)
    }

    pub fn boundary_fail(wave: u32) -> String {
        format!("wave-{}-boundary-fail", wave)
    }

    pub fn qa_approved(wave: u32) -> String {
        format!("wave-{}-qa-approved", wave)
    }

    pub fn qa_rejected(wave: u32) -> String {
        format!("wave-{}-qa-rejected", wave)
    }

    pub fn review_approved(wave: u32) -> String {
        format!("wave-{}-review-approved", wave)
    }

    pub fn review_rejected(wave: u32) -> String {
        format!("wave-{}-review-rejected", wave)
    }

    pub fn merge_approved(wave: u32) -> String {
        format!("wave-{}-merge-approved", wave)
    }

    pub fn merge_rejected(wave: u32) -> String {
        format!("wave-{}-merge-rejected", wave)
    }

    /// Pattern matching an event from any participant
    pub fn from_anyone(event: &str) -> String {
        format!("*.{}", event)
    }
}
