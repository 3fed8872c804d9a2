//! Change sets — the files one participant modified relative to a baseline

use super::policy::normalize_path;
use crate::error::{CoordinationError, CoordinationResult};
use ignore::WalkBuilder;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Changed paths, normalised and relative to the workspace root
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub participant: String,
    files: BTreeSet<String>,
}

impl ChangeSet {
    /// Explicit list, e.g. from a completion signal's artifact list
    pub fn new<I, S>(participant: impl Into<String>, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            participant: participant.into(),
            files: files
                .into_iter()
                .map(|f| normalize_path(f.as_ref()))
                .filter(|f| !f.is_empty())
                .collect(),
        }
    }

    /// Tracked changes since `baseline` plus untracked, non-ignored files
    pub fn from_git(
        participant: impl Into<String>,
        workspace: &Path,
        baseline: &str,
    ) -> CoordinationResult<Self> {
        let diff = run_git(workspace, &["diff", "--name-only", "-z", baseline])?;
        let untracked = run_git(workspace, &["ls-files", "--others", "--exclude-standard", "-z"])?;

        let files: Vec<String> = diff
            .split('\0')
            .chain(untracked.split('\0'))
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect();
        debug!(workspace = %workspace.display(), baseline, changed = files.len(), "Git change set");
        Ok(Self::new(participant, files))
    }

    /// Content comparison of two directory trees (added, modified and deleted files)
    pub fn between_dirs(
        participant: impl Into<String>,
        baseline: &Path,
        workspace: &Path,
    ) -> CoordinationResult<Self> {
        if !workspace.is_dir() {
            return Err(CoordinationError::environment(format!(
                "workspace {} does not exist",
                workspace.display()
            )));
        }
        let before = hash_tree(baseline)?;
        let after = hash_tree(workspace)?;

        let mut files = Vec::new();
        for (path, hash) in &after {
            if before.get(path) != Some(hash) {
                files.push(path.clone());
            }
        }
        files.extend(before.keys().filter(|p| !after.contains_key(*p)).cloned());
        Ok(Self::new(participant, files))
    }

    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn run_git(workspace: &Path, args: &[&str]) -> CoordinationResult<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(workspace)
        .output()
        .map_err(|e| CoordinationError::environment(format!("git unavailable: {}", e)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CoordinationError::environment(format!(
            "git {} failed in {}: {}",
            args.first().copied().unwrap_or_default(),
            workspace.display(),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Relative path -> blake3 hash of every file under `root`. Missing root is empty.
fn hash_tree(root: &Path) -> CoordinationResult<BTreeMap<String, blake3::Hash>> {
    let mut hashes = BTreeMap::new();
    if !root.exists() {
        return Ok(hashes);
    }

    let walker = WalkBuilder::new(root)
        .hidden(false) // dotfiles like .env must be seen
        .git_ignore(true)
        .git_global(false)
        .git_exclude(false)
        .parents(false)
        .require_git(false)
        .filter_entry(|entry| entry.file_name() != ".git")
        .build();

    for entry in walker.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let bytes = std::fs::read(path)?;
        hashes.insert(
            normalize_path(&relative_string(relative)),
            blake3::hash(&bytes),
        );
    }
    Ok(hashes)
}

fn relative_string(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Resolve a participant workspace against the project root
pub fn resolve_workspace(project_root: &Path, workspace: &Path) -> PathBuf {
    if workspace.is_absolute() {
        workspace.to_path_buf()
    } else {
        project_root.join(workspace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_explicit_list_normalised_and_deduplicated() {
        let changes = ChangeSet::new("fe-1", ["./src/a.ts", "src/a.ts", "", "src\\b.ts"]);
        let files: Vec<_> = changes.files().collect();
        assert_eq!(files, vec!["src/a.ts", "src/b.ts"]);
    }

    #[test]
    fn test_between_dirs_detects_add_modify_delete() {
        let base = tempdir().unwrap();
        let work = tempdir().unwrap();
        for root in [base.path(), work.path()] {
            std::fs::create_dir_all(root.join("src")).unwrap();
            std::fs::write(root.join("src/same.ts"), "same").unwrap();
        }
        std::fs::write(base.path().join("src/edit.ts"), "v1").unwrap();
        std::fs::write(work.path().join("src/edit.ts"), "v2").unwrap();
        std::fs::write(base.path().join("src/gone.ts"), "x").unwrap();
        std::fs::write(work.path().join(".env"), "SECRET=1").unwrap();

        let changes = ChangeSet::between_dirs("fe-1", base.path(), work.path()).unwrap();
        let files: Vec<_> = changes.files().collect();
        assert_eq!(files, vec![".env", "src/edit.ts", "src/gone.ts"]);
    }

    #[test]
    fn test_between_dirs_missing_workspace_is_environment_error() {
        let base = tempdir().unwrap();
        let err = ChangeSet::between_dirs("fe-1", base.path(), &base.path().join("nope"))
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Environment { .. }));
    }
}
