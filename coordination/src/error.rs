//! Coordination error types
//!
//! One error enum for every component of the engine. Variants follow the
//! failure classes the CLI distinguishes: invocation problems exit with `2`,
//! everything else with `1`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for coordination operations
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Machine-readable rendering of an error, used by `--json` output.
///
/// ```json
/// {
///   "code": "RESTORE_NOT_FOUND",
///   "message": "No snapshot matching 'pre-qa' for wave 1",
///   "recovery_action": "Run `wave-gate snapshot list` to see available checkpoints",
///   "context": { "wave": 1 }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    /// Machine-readable error code (e.g., "KILL_SWITCH_ACTIVE")
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// What the operator should do next
    pub recovery_action: String,

    /// Relevant context for debugging
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl StructuredError {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        recovery_action: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            recovery_action: recovery_action.into(),
            context: HashMap::new(),
        }
    }

    /// Add context key-value pair
    pub fn with_context(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

impl std::fmt::Display for StructuredError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Errors that can occur during coordination operations
#[derive(Error, Debug)]
pub enum CoordinationError {
    /// Bad arguments or missing required input. Fails before touching state.
    #[error("Invalid invocation: {message}")]
    Invocation { message: String },

    /// An expected directory, file or tool is missing
    #[error("Environment error: {message}")]
    Environment { message: String },

    /// Kill switch is active
    #[error("Kill switch active: {reason}")]
    Safety { reason: String },

    /// Budget ledger reached its limit
    #[error("Budget exceeded: spent {spent} of {limit}")]
    BudgetExceeded { spent: String, limit: String },

    /// A retry scope reached its maximum and was escalated
    #[error("Retry limit reached for {scope} ({count}/{max}); escalated to a human")]
    RetryLimitExceeded { scope: String, count: u32, max: u32 },

    /// No snapshot matched the restore selector
    #[error("No snapshot matching '{selector}' for wave {wave}")]
    RestoreNotFound { wave: u32, selector: String },

    /// Participant or event name is not a valid identifier
    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// Signal or path pattern failed to compile
    #[error("Invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    /// Another process holds the advisory lock
    #[error("Lock held by another process: {path}")]
    LockHeld { path: PathBuf },

    /// A decision lock already exists for this decision point
    #[error("Decision already locked at {path}")]
    DecisionLocked { path: PathBuf },

    /// Path glob failed to compile
    #[error("Invalid glob: {0}")]
    Glob(#[from] globset::Error),

    /// Gate lookup failed
    #[error("Unknown gate: {gate}")]
    UnknownGate { gate: String },

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML roster / gate pipeline error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// TOML config error
    #[error("Config file error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl CoordinationError {
    pub fn invocation(message: impl Into<String>) -> Self {
        Self::Invocation {
            message: message.into(),
        }
    }

    pub fn environment(message: impl Into<String>) -> Self {
        Self::Environment {
            message: message.into(),
        }
    }

    pub fn safety(reason: impl Into<String>) -> Self {
        Self::Safety {
            reason: reason.into(),
        }
    }

    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_pattern(pattern: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            message: message.into(),
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Invocation { .. }
            | Self::InvalidName { .. }
            | Self::InvalidPattern { .. }
            | Self::Glob(_) => 2,
            _ => 1,
        }
    }

    /// Whether this error must abort the current operation immediately
    pub fn is_immediate_abort(&self) -> bool {
        matches!(self, Self::Invocation { .. } | Self::Safety { .. })
    }

    /// Get the error code string
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Invocation { .. } => "INVALID_INVOCATION",
            Self::Environment { .. } => "ENVIRONMENT_ERROR",
            Self::Safety { .. } => "KILL_SWITCH_ACTIVE",
            Self::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            Self::RetryLimitExceeded { .. } => "RETRY_LIMIT_EXCEEDED",
            Self::RestoreNotFound { .. } => "RESTORE_NOT_FOUND",
            Self::InvalidName { .. } => "INVALID_NAME",
            Self::InvalidPattern { .. } | Self::Glob(_) => "INVALID_PATTERN",
            Self::LockHeld { .. } => "LOCK_HELD",
            Self::DecisionLocked { .. } => "DECISION_LOCKED",
            Self::UnknownGate { .. } => "UNKNOWN_GATE",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Yaml(_) => "YAML_ERROR",
            Self::Toml(_) => "CONFIG_ERROR",
        }
    }

    fn recovery_action(&self) -> &'static str {
        match self {
            Self::Invocation { .. } => "Check the command-line flags with --help and retry.",
            Self::Environment { .. } => {
                "Create the missing directory or file, or point --project at the right root."
            }
            Self::Safety { .. } => {
                "Clear the kill switch with `wave-gate resume` once the cause is resolved."
            }
            Self::BudgetExceeded { .. } => {
                "Raise WAVE_BUDGET_LIMIT or stop the wave; running work is not interrupted."
            }
            Self::RetryLimitExceeded { .. } => {
                "A human must review the escalated scope; automatic retries are disabled."
            }
            Self::RestoreNotFound { .. } => {
                "Run `wave-gate snapshot list` to see available checkpoints."
            }
            Self::InvalidName { .. } => {
                "Use lowercase letters, digits, '-' and '_' for participant and event names."
            }
            Self::InvalidPattern { .. } | Self::Glob(_) => "Fix the glob pattern syntax.",
            Self::LockHeld { .. } => "Wait for the other snapshot/restore operation to finish.",
            Self::DecisionLocked { .. } => {
                "The decision is immutable; re-run validation if inputs changed."
            }
            Self::UnknownGate { .. } => "List gates with `wave-gate report`.",
            Self::Io(_) => "Check file permissions and disk space.",
            Self::Json(_) | Self::Yaml(_) | Self::Toml(_) => "Fix the malformed file and retry.",
        }
    }

    /// Convert to a structured error for machine-readable output
    pub fn to_structured(&self) -> StructuredError {
        let structured = StructuredError::new(
            self.error_code(),
            self.to_string(),
            self.recovery_action(),
        );
        match self {
            Self::RestoreNotFound { wave, selector } => structured
                .with_context("wave", *wave)
                .with_context("selector", selector.clone()),
            Self::RetryLimitExceeded { scope, count, max } => structured
                .with_context("scope", scope.clone())
                .with_context("count", *count)
                .with_context("max", *max),
            Self::LockHeld { path } | Self::DecisionLocked { path } => {
                structured.with_context("path", path.display().to_string())
            }
            _ => structured,
        }
    }
}
