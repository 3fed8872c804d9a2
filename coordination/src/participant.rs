//! Participants and the wave roster
//!
//! The roster is a YAML file listing every participant of a wave with its
//! role, domain pool and boundary lists:
//!
//! ```yaml
//! participants:
//!   - name: fe-1
//!     role: frontend-worker
//!     domain: frontend
//!     allow: [src/app, src/components]
//!     forbid: [src/app/api]
//! shared_forbid: [".env", "**/*.pem"]
//! ```

use crate::error::{CoordinationError, CoordinationResult};
use crate::signal::names::validate_identifier;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Role a participant plays in a wave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    FrontendWorker,
    BackendWorker,
    Reviewer,
    Fixer,
    Qa,
    Coordinator,
}

impl Role {
    /// Workers receive dispatched work items; the rest do not
    pub fn is_worker(&self) -> bool {
        matches!(self, Self::FrontendWorker | Self::BackendWorker | Self::Fixer)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::FrontendWorker => "frontend-worker",
            Self::BackendWorker => "backend-worker",
            Self::Reviewer => "reviewer",
            Self::Fixer => "fixer",
            Self::Qa => "qa",
            Self::Coordinator => "coordinator",
        };
        f.write_str(s)
    }
}

/// An isolated worker identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub name: String,
    pub role: Role,
    /// Dispatch pool, e.g. `frontend`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Isolated workspace root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub forbid: Vec<String>,
}

impl Participant {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            role,
            domain: None,
            workspace: None,
            allow: Vec::new(),
            forbid: Vec::new(),
        }
    }

    pub fn in_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    pub fn with_boundary(mut self, allow: &[&str], forbid: &[&str]) -> Self {
        self.allow = allow.iter().map(|s| s.to_string()).collect();
        self.forbid = forbid.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// Every participant of a wave plus the shared boundary lists
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Roster {
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub shared_forbid: Vec<String>,
    #[serde(default)]
    pub tolerated: Vec<String>,
}

impl Roster {
    pub fn new(participants: Vec<Participant>) -> Self {
        Self {
            participants,
            ..Default::default()
        }
    }

    /// Load and validate a roster file
    pub fn load(path: &Path) -> CoordinationResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoordinationError::environment(format!(
                "cannot read roster {}: {}",
                path.display(),
                e
            ))
        })?;
        let roster: Roster = serde_yaml::from_str(&content)?;
        roster.validate()?;
        debug!(path = %path.display(), participants = roster.participants.len(), "Roster loaded");
        Ok(roster)
    }

    /// Names must be valid signal identifiers and unique
    pub fn validate(&self) -> CoordinationResult<()> {
        let mut seen = std::collections::HashSet::new();
        for p in &self.participants {
            validate_identifier(&p.name)?;
            if !seen.insert(p.name.as_str()) {
                return Err(CoordinationError::invocation(format!(
                    "participant '{}' listed twice in roster",
                    p.name
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.name == name)
    }

    /// Workers in a domain pool, in roster order
    pub fn domain_pool(&self, domain: &str) -> Vec<&Participant> {
        self.participants
            .iter()
            .filter(|p| p.role.is_worker() && p.domain.as_deref() == Some(domain))
            .collect()
    }

    pub fn workers(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter().filter(|p| p.role.is_worker())
    }
}
