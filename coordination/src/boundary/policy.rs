//! Path patterns and per-participant domain policies

use crate::error::{CoordinationError, CoordinationResult};
use crate::participant::{Participant, Roster};
use globset::{GlobBuilder, GlobMatcher};
use std::collections::BTreeSet;

/// Shared forbid list applied when the roster does not define one
pub const DEFAULT_SHARED_FORBID: &[&str] = &[".env", ".env.*", "**/*.pem", "**/*.key"];

/// Project-root files any participant may touch
pub const DEFAULT_TOLERATED: &[&str] = &[
    "package.json",
    "package-lock.json",
    "pnpm-lock.yaml",
    "yarn.lock",
    "Cargo.toml",
    "Cargo.lock",
    "go.mod",
    "go.sum",
    "pyproject.toml",
    "poetry.lock",
    "tsconfig.json",
];

/// Normalise a changed path to forward slashes, relative, without `./`
pub fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let mut trimmed = unified.as_str();
    while let Some(rest) = trimmed.strip_prefix("./") {
        trimmed = rest;
    }
    trimmed.trim_start_matches('/').to_string()
}

fn has_glob_meta(raw: &str) -> bool {
    raw.contains(['*', '?', '[', '{'])
}

/// One allow/forbid entry.
///
/// Plain entries are component-aware prefixes: `src/app` matches
/// `src/app` and `src/app/page.tsx` but not `src/application.ts`. Entries
/// with glob metacharacters are matched as globs where `*` stays within one
/// path component and `**` crosses components.
#[derive(Debug, Clone)]
pub enum PathPattern {
    Prefix(String),
    Glob { raw: String, matcher: GlobMatcher },
}

impl PathPattern {
    pub fn parse(raw: &str) -> CoordinationResult<Self> {
        let normalized = normalize_path(raw.trim());
        let normalized = normalized.trim_end_matches('/').to_string();
        if normalized.is_empty() {
            return Err(CoordinationError::invalid_pattern(raw, "empty path pattern"));
        }
        if has_glob_meta(&normalized) {
            let matcher = GlobBuilder::new(&normalized)
                .literal_separator(true)
                .build()?
                .compile_matcher();
            Ok(Self::Glob {
                raw: normalized,
                matcher,
            })
        } else {
            Ok(Self::Prefix(normalized))
        }
    }

    pub fn parse_all<S: AsRef<str>>(raws: &[S]) -> CoordinationResult<Vec<Self>> {
        raws.iter().map(|r| Self::parse(r.as_ref())).collect()
    }

    /// `path` must already be normalised
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Prefix(prefix) => {
                path == prefix
                    || path
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            }
            Self::Glob { matcher, .. } => matcher.is_match(path),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Prefix(p) => p,
            Self::Glob { raw, .. } => raw,
        }
    }
}

impl std::fmt::Display for PathPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A participant's domain boundary
#[derive(Debug, Clone, Default)]
pub struct DomainPolicy {
    pub participant: String,
    pub allow: Vec<PathPattern>,
    pub forbid: Vec<PathPattern>,
}

impl DomainPolicy {
    /// Policy with no restrictions beyond the shared forbid list
    pub fn unrestricted(participant: impl Into<String>) -> Self {
        Self {
            participant: participant.into(),
            ..Default::default()
        }
    }

    pub fn new<S: AsRef<str>>(
        participant: impl Into<String>,
        allow: &[S],
        forbid: &[S],
    ) -> CoordinationResult<Self> {
        Ok(Self {
            participant: participant.into(),
            allow: PathPattern::parse_all(allow)?,
            forbid: PathPattern::parse_all(forbid)?,
        })
    }

    pub fn for_participant(participant: &Participant) -> CoordinationResult<Self> {
        Self::new(&participant.name, &participant.allow, &participant.forbid)
    }

    pub fn has_allow_list(&self) -> bool {
        !self.allow.is_empty()
    }
}

/// Rules shared by every participant
#[derive(Debug, Clone)]
pub struct BoundaryRules {
    pub shared_forbid: Vec<PathPattern>,
    pub tolerated: BTreeSet<String>,
}

impl BoundaryRules {
    pub fn new<S: AsRef<str>>(shared_forbid: &[S], tolerated: &[S]) -> CoordinationResult<Self> {
        Ok(Self {
            shared_forbid: PathPattern::parse_all(shared_forbid)?,
            tolerated: tolerated
                .iter()
                .map(|t| normalize_path(t.as_ref()))
                .collect(),
        })
    }

    /// Roster lists override the defaults when non-empty
    pub fn from_roster(roster: &Roster) -> CoordinationResult<Self> {
        let shared: Vec<String> = if roster.shared_forbid.is_empty() {
            DEFAULT_SHARED_FORBID.iter().map(|s| s.to_string()).collect()
        } else {
            roster.shared_forbid.clone()
        };
        let tolerated: Vec<String> = if roster.tolerated.is_empty() {
            DEFAULT_TOLERATED.iter().map(|s| s.to_string()).collect()
        } else {
            roster.tolerated.clone()
        };
        Self::new(&shared, &tolerated)
    }

    pub fn is_tolerated(&self, path: &str) -> bool {
        !path.contains('/') && self.tolerated.contains(path)
    }
}

impl Default for BoundaryRules {
    fn default() -> Self {
        Self {
            shared_forbid: DEFAULT_SHARED_FORBID
                .iter()
                .filter_map(|p| PathPattern::parse(p).ok())
                .collect(),
            tolerated: DEFAULT_TOLERATED.iter().map(|s| s.to_string()).collect(),
        }
    }
}
