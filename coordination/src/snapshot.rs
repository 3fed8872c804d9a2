//! Context snapshot / restore
//!
//! Snapshots are immutable copies of the shared project-state file, tagged
//! with `{checkpoint, wave, created_at}` under the `_snapshot` key. Every
//! operation holds an exclusive lock on `.snapshot.lock` in the snapshots
//! directory; a second caller waits up to the lock timeout, then gets
//! `LockHeld`.

use crate::error::{CoordinationError, CoordinationResult};
use crate::signal::names::validate_identifier;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Metadata key added to snapshot files and stripped on restore
pub const SNAPSHOT_META_KEY: &str = "_snapshot";

/// Snapshots kept per wave when no retention is configured
pub const DEFAULT_RETENTION: usize = 10;

const LOCK_FILE: &str = ".snapshot.lock";
const BACKUP_DIR: &str = "backups";

/// How long an operation waits for another one to release the lock
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(10);
const LOCK_RETRY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub checkpoint: String,
    pub wave: u32,
    pub created_at: DateTime<Utc>,
}

/// A snapshot on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub path: PathBuf,
    #[serde(flatten)]
    pub meta: SnapshotMeta,
}

/// Which snapshot `restore` should use
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreSelector {
    Latest,
    /// Newest snapshot carrying this checkpoint label
    Checkpoint(String),
    /// Explicit snapshot file; relative paths resolve against the snapshots dir
    File(PathBuf),
}

impl std::str::FromStr for RestoreSelector {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if s == "latest" {
            Self::Latest
        } else if s.ends_with(".json") || s.contains('/') {
            Self::File(PathBuf::from(s))
        } else {
            Self::Checkpoint(s.to_string())
        })
    }
}

impl std::fmt::Display for RestoreSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::Checkpoint(c) => write!(f, "{}", c),
            Self::File(p) => write!(f, "{}", p.display()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub restored_from: PathBuf,
    pub state_file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<PathBuf>,
}

/// Exclusive lock released on drop
struct DirLock {
    file: File,
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

pub struct SnapshotManager {
    state_file: PathBuf,
    dir: PathBuf,
    retention: Option<usize>,
    lock_wait: Duration,
}

impl SnapshotManager {
    pub fn new(state_file: impl AsRef<Path>, dir: impl AsRef<Path>) -> Self {
        Self {
            state_file: state_file.as_ref().to_path_buf(),
            dir: dir.as_ref().to_path_buf(),
            retention: None,
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    /// Prune to `keep` snapshots per wave after every new snapshot
    pub fn with_retention(mut self, keep: usize) -> Self {
        self.retention = Some(keep);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    fn lock(&self) -> CoordinationResult<DirLock> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        let deadline = Instant::now() + self.lock_wait;
        while FileExt::try_lock_exclusive(&file).is_err() {
            if Instant::now() >= deadline {
                return Err(CoordinationError::LockHeld { path });
            }
            debug!(lock = %path.display(), "Waiting for snapshot lock");
            std::thread::sleep(LOCK_RETRY);
        }
        Ok(DirLock { file })
    }

    fn read_state(&self) -> CoordinationResult<serde_json::Map<String, serde_json::Value>> {
        let content = match std::fs::read_to_string(&self.state_file) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CoordinationError::environment(format!(
                    "project state file {} does not exist",
                    self.state_file.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&content)? {
            serde_json::Value::Object(map) => Ok(map),
            _ => Err(CoordinationError::environment(format!(
                "project state file {} is not a JSON object",
                self.state_file.display()
            ))),
        }
    }

    /// Copy the live state into a new snapshot file
    pub fn snapshot(&self, wave: u32, checkpoint: &str) -> CoordinationResult<SnapshotInfo> {
        validate_identifier(checkpoint)?;
        let _guard = self.lock()?;

        let mut state = self.read_state()?;
        let meta = SnapshotMeta {
            checkpoint: checkpoint.to_string(),
            wave,
            created_at: Utc::now(),
        };
        state.insert(SNAPSHOT_META_KEY.to_string(), serde_json::to_value(&meta)?);
        let content = serde_json::to_string_pretty(&state)?;

        let stem = format!(
            "wave-{}-{}-{}",
            wave,
            checkpoint,
            meta.created_at.format("%Y%m%dT%H%M%S%.3fZ")
        );
        let path = write_new(&self.dir, &stem, content.as_bytes())?;
        info!(wave, checkpoint, path = %path.display(), "Snapshot written");

        if let Some(keep) = self.retention {
            self.prune_locked(wave, keep)?;
        }
        Ok(SnapshotInfo { path, meta })
    }

    fn list_locked(&self, wave: u32) -> CoordinationResult<Vec<SnapshotInfo>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let prefix = format!("wave-{}-", wave);

        let mut snapshots = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with(&prefix) || !name.ends_with(".json") || !path.is_file() {
                continue;
            }
            match read_meta(&path) {
                Ok(Some(meta)) if meta.wave == wave => snapshots.push(SnapshotInfo { path, meta }),
                Ok(_) => {}
                Err(e) => warn!(file = %name, "Skipping unreadable snapshot: {}", e),
            }
        }
        snapshots.sort_by(|a, b| {
            b.meta
                .created_at
                .cmp(&a.meta.created_at)
                .then_with(|| b.path.cmp(&a.path))
        });
        Ok(snapshots)
    }

    /// Snapshots for a wave, newest first
    pub fn list(&self, wave: u32) -> CoordinationResult<Vec<SnapshotInfo>> {
        let _guard = self.lock()?;
        self.list_locked(wave)
    }

    fn prune_locked(&self, wave: u32, keep: usize) -> CoordinationResult<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for snapshot in self.list_locked(wave)?.into_iter().skip(keep) {
            std::fs::remove_file(&snapshot.path)?;
            debug!(path = %snapshot.path.display(), "Snapshot pruned");
            removed.push(snapshot.path);
        }
        if !removed.is_empty() {
            info!(wave, keep, removed = removed.len(), "Snapshots pruned");
        }
        Ok(removed)
    }

    /// Delete all but the `keep` newest snapshots of a wave
    pub fn prune(&self, wave: u32, keep: usize) -> CoordinationResult<Vec<PathBuf>> {
        let _guard = self.lock()?;
        self.prune_locked(wave, keep)
    }

    fn select(&self, wave: u32, selector: &RestoreSelector) -> CoordinationResult<Option<PathBuf>> {
        Ok(match selector {
            RestoreSelector::Latest => self.list_locked(wave)?.into_iter().next().map(|s| s.path),
            RestoreSelector::Checkpoint(label) => self
                .list_locked(wave)?
                .into_iter()
                .find(|s| &s.meta.checkpoint == label)
                .map(|s| s.path),
            RestoreSelector::File(file) => {
                let path = if file.is_absolute() {
                    file.clone()
                } else {
                    self.dir.join(file)
                };
                // Only a snapshot of the requested wave may replace the live state
                match path.is_file().then(|| read_meta(&path)).transpose() {
                    Ok(Some(Some(meta))) if meta.wave == wave => Some(path),
                    Ok(_) => None,
                    Err(e) => {
                        warn!(file = %path.display(), "Unreadable snapshot: {}", e);
                        None
                    }
                }
            }
        })
    }

    fn select_or_fail(&self, wave: u32, selector: &RestoreSelector) -> CoordinationResult<PathBuf> {
        self.select(wave, selector)?
            .ok_or_else(|| CoordinationError::RestoreNotFound {
                wave,
                selector: selector.to_string(),
            })
    }

    /// Snapshot `restore` would use, without touching the live state
    pub fn find(&self, wave: u32, selector: &RestoreSelector) -> CoordinationResult<PathBuf> {
        let _guard = self.lock()?;
        self.select_or_fail(wave, selector)
    }

    /// Replace the live state with a snapshot.
    ///
    /// With `backup`, the current state is first copied to
    /// `backups/`. Nothing is touched when no snapshot matches.
    pub fn restore(
        &self,
        wave: u32,
        selector: &RestoreSelector,
        backup: bool,
    ) -> CoordinationResult<RestoreOutcome> {
        let _guard = self.lock()?;
        let source = self.select_or_fail(wave, selector)?;

        let mut state: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&source)?)?;
        if let Some(map) = state.as_object_mut() {
            map.remove(SNAPSHOT_META_KEY);
        }
        let content = serde_json::to_string_pretty(&state)?;

        let backup = if backup && self.state_file.exists() {
            let stem = format!("project-state-{}", Utc::now().format("%Y%m%dT%H%M%S%.3fZ"));
            let live = std::fs::read(&self.state_file)?;
            Some(write_new(&self.dir.join(BACKUP_DIR), &stem, &live)?)
        } else {
            None
        };

        replace_file(&self.state_file, content.as_bytes())?;
        info!(
            wave,
            %selector,
            from = %source.display(),
            "Project state restored"
        );
        Ok(RestoreOutcome {
            restored_from: source,
            state_file: self.state_file.clone(),
            backup,
        })
    }
}

fn read_meta(path: &Path) -> CoordinationResult<Option<SnapshotMeta>> {
    let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
    Ok(value
        .get(SNAPSHOT_META_KEY)
        .and_then(|m| serde_json::from_value(m.clone()).ok()))
}

/// Create `{stem}.json` in `dir`, or `{stem}-{n}.json` if taken
fn write_new(dir: &Path, stem: &str, content: &[u8]) -> CoordinationResult<PathBuf> {
    std::fs::create_dir_all(dir)?;
    for n in 0u32.. {
        let name = if n == 0 {
            format!("{}.json", stem)
        } else {
            format!("{}-{}.json", stem, n)
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(content)?;
                file.sync_all()?;
                return Ok(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(CoordinationError::environment(format!(
        "no free snapshot name for {} in {}",
        stem,
        dir.display()
    )))
}

/// Write to a temp sibling, then rename over `path`
fn replace_file(path: &Path, content: &[u8]) -> CoordinationResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = dir.join(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()));
    std::fs::write(&temp, content)?;
    if let Err(e) = std::fs::rename(&temp, path) {
        let _ = std::fs::remove_file(&temp);
        return Err(e.into());
    }
    Ok(())
}
