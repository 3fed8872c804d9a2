//! Work items (stories) and the per-wave story directory
//!
//! Each story is one JSON file under `.wave/stories/wave-{N}/`. Loading is
//! lenient: a file that does not parse is returned as a [`StoryLoad::Invalid`]
//! so pre-flight can report every broken file at once.

use crate::error::{CoordinationError, CoordinationResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Lifecycle of a work item
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkItemStatus {
    #[default]
    Pending,
    Assigned,
    InProgress,
    Complete,
    Failed,
}

impl std::fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::InProgress => "in-progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A unit of work
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// Dispatch pool tag, e.g. `frontend`
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Requirement ids this story covers (`REQ-12`, `FR-3`, ...)
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub status: WorkItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_points: Option<u32>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, title: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            domain: domain.into(),
            ..Default::default()
        }
    }

    pub fn with_criteria(mut self, criteria: &[&str]) -> Self {
        self.acceptance_criteria = criteria.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_requirements(mut self, requirements: &[&str]) -> Self {
        self.requirements = requirements.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_points(mut self, points: u32) -> Self {
        self.story_points = Some(points);
        self
    }

    /// Missing required fields; empty when the item is well-formed
    pub fn schema_problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.id.trim().is_empty() {
            problems.push("missing id".to_string());
        }
        if self.title.trim().is_empty() {
            problems.push("missing title".to_string());
        }
        if self.domain.trim().is_empty() {
            problems.push("missing domain".to_string());
        }
        if self.acceptance_criteria.iter().all(|c| c.trim().is_empty()) {
            problems.push("no acceptance criteria".to_string());
        }
        problems
    }

    pub fn is_valid(&self) -> bool {
        self.schema_problems().is_empty()
    }
}

/// Outcome of loading one story file
#[derive(Debug, Clone)]
pub enum StoryLoad {
    Parsed { path: PathBuf, item: WorkItem },
    Invalid { path: PathBuf, error: String },
}

impl StoryLoad {
    pub fn path(&self) -> &Path {
        match self {
            Self::Parsed { path, .. } | Self::Invalid { path, .. } => path,
        }
    }

    pub fn item(&self) -> Option<&WorkItem> {
        match self {
            Self::Parsed { item, .. } => Some(item),
            Self::Invalid { .. } => None,
        }
    }
}

/// Load every `*.json` story in a directory, sorted by file name
pub fn load_story_dir(dir: &Path) -> CoordinationResult<Vec<StoryLoad>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        CoordinationError::environment(format!("story directory {}: {}", dir.display(), e))
    })?;

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    paths.sort();

    let loads: Vec<StoryLoad> = paths
        .into_iter()
        .map(|path| {
            let parsed = std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|content| {
                    serde_json::from_str::<WorkItem>(&content).map_err(|e| e.to_string())
                });
            match parsed {
                Ok(item) => StoryLoad::Parsed { path, item },
                Err(error) => StoryLoad::Invalid { path, error },
            }
        })
        .collect();

    debug!(dir = %dir.display(), stories = loads.len(), "Story directory loaded");
    Ok(loads)
}

/// Only the items that parsed and are schema-valid
pub fn valid_items(loads: &[StoryLoad]) -> Vec<WorkItem> {
    loads
        .iter()
        .filter_map(StoryLoad::item)
        .filter(|item| item.is_valid())
        .cloned()
        .collect()
}

/// Canonical view used for hashing; status is excluded so progress on an
/// approved set does not make its decision lock stale.
#[derive(Serialize)]
struct HashView<'a> {
    id: &'a str,
    title: &'a str,
    domain: &'a str,
    acceptance_criteria: &'a [String],
    requirements: &'a [String],
    story_points: Option<u32>,
}

/// blake3 hex digest of the id-sorted work item set
pub fn content_hash(items: &[WorkItem]) -> String {
    let mut sorted: Vec<&WorkItem> = items.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));

    let mut hasher = blake3::Hasher::new();
    for item in sorted {
        let view = HashView {
            id: &item.id,
            title: &item.title,
            domain: &item.domain,
            acceptance_criteria: &item.acceptance_criteria,
            requirements: &item.requirements,
            story_points: item.story_points,
        };
        // Serialising a borrowed struct of strings cannot fail.
        let bytes = serde_json::to_vec(&view).unwrap_or_default();
        hasher.update(&bytes);
        hasher.update(b"\n");
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn story(id: &str, domain: &str) -> WorkItem {
        WorkItem::new(id, format!("Story {}", id), domain).with_criteria(&["works"])
    }

    #[test]
    fn test_hash_stable_and_order_independent() {
        let a = vec![story("FE-1", "frontend"), story("BE-1", "backend")];
        let b = vec![story("BE-1", "backend"), story("FE-1", "frontend")];
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn test_hash_changes_with_id_but_not_status() {
        let base = vec![story("FE-1", "frontend")];
        let renamed = vec![story("FE-2", "frontend")];
        assert_ne!(content_hash(&base), content_hash(&renamed));

        let mut progressed = base.clone();
        progressed[0].status = WorkItemStatus::Complete;
        assert_eq!(content_hash(&base), content_hash(&progressed));
    }

    #[test]
    fn test_schema_problems() {
        let item = WorkItem::new("", "t", "frontend");
        let problems = item.schema_problems();
        assert!(problems.contains(&"missing id".to_string()));
        assert!(problems.contains(&"no acceptance criteria".to_string()));
        assert!(story("FE-1", "frontend").is_valid());
    }

    #[test]
    fn test_load_story_dir_reports_invalid_files() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("fe-1.json"),
            serde_json::to_string(&story("FE-1", "frontend")).unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();
        std::fs::write(dir.path().join("notes.md"), "# ignored").unwrap();

        let loads = load_story_dir(dir.path()).unwrap();
        assert_eq!(loads.len(), 2);
        assert!(matches!(loads[0], StoryLoad::Invalid { .. }));
        assert_eq!(valid_items(&loads).len(), 1);
    }

    #[test]
    fn test_missing_story_dir_is_environment_error() {
        let dir = tempdir().unwrap();
        let err = load_story_dir(&dir.path().join("wave-9")).unwrap_err();
        assert!(matches!(err, CoordinationError::Environment { .. }));
    }

    #[test]
    fn test_status_serialises_kebab_case() {
        let json = serde_json::to_string(&WorkItemStatus::InProgress).unwrap();
        assert_eq!(json, "\"in-progress\"");
    }
}
