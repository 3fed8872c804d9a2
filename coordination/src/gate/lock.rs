//! Decision locks — write-once records of a validator verdict
//!
//! A lock stores the content hash of the inputs that produced the verdict.
//! When the inputs change afterwards, [`DecisionLockStore::verify`] reports
//! the lock as stale.

use super::report::{CheckOutcome, ValidationReport, Verdict};
use crate::error::{CoordinationError, CoordinationResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockedCheck {
    pub name: String,
    pub outcome: CheckOutcome,
}

/// Immutable verdict record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionLock {
    pub decision_point: String,
    pub wave: u32,
    pub verdict: Verdict,
    pub input_hash: String,
    pub created_at: DateTime<Utc>,
    pub checks: Vec<LockedCheck>,
    #[serde(default)]
    pub failing: Vec<String>,
}

impl DecisionLock {
    pub fn from_report(report: &ValidationReport, input_hash: impl Into<String>) -> Self {
        Self {
            decision_point: report.kind.decision_point().to_string(),
            wave: report.wave,
            verdict: report.verdict,
            input_hash: input_hash.into(),
            created_at: Utc::now(),
            checks: report
                .checks
                .iter()
                .map(|c| LockedCheck {
                    name: c.name.clone(),
                    outcome: c.outcome,
                })
                .collect(),
            failing: report.failing.clone(),
        }
    }
}

/// State of the lock for one decision point
#[derive(Debug, Clone, PartialEq)]
pub enum LockVerification {
    Missing,
    Valid(DecisionLock),
    Stale {
        lock: DecisionLock,
        current_hash: String,
    },
}

/// Directory of decision locks, one file per `(wave, decision point)`
#[derive(Debug, Clone)]
pub struct DecisionLockStore {
    dir: PathBuf,
}

impl DecisionLockStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self, wave: u32, decision_point: &str) -> PathBuf {
        self.dir
            .join(format!("wave-{}-{}.lock.json", wave, decision_point))
    }

    pub fn read(&self, wave: u32, decision_point: &str) -> CoordinationResult<Option<DecisionLock>> {
        match std::fs::read_to_string(self.path(wave, decision_point)) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write a new lock; fails with `DecisionLocked` if one exists
    pub fn write(&self, lock: &DecisionLock) -> CoordinationResult<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path(lock.wave, &lock.decision_point);
        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(CoordinationError::DecisionLocked { path });
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(serde_json::to_string_pretty(lock)?.as_bytes())?;
        file.sync_all()?;
        info!(
            wave = lock.wave,
            decision = %lock.decision_point,
            verdict = %lock.verdict,
            "Decision locked"
        );
        Ok(path)
    }

    /// Compare the stored hash with the hash of the current inputs.
    ///
    /// A lock that cannot be parsed is reported as stale.
    pub fn verify(
        &self,
        wave: u32,
        decision_point: &str,
        current_hash: &str,
    ) -> CoordinationResult<LockVerification> {
        let lock = match self.read(wave, decision_point) {
            Ok(Some(lock)) => lock,
            Ok(None) => return Ok(LockVerification::Missing),
            Err(CoordinationError::Json(e)) => {
                warn!(wave, decision_point, "Unreadable decision lock: {}", e);
                return Ok(LockVerification::Stale {
                    lock: DecisionLock {
                        decision_point: decision_point.to_string(),
                        wave,
                        verdict: Verdict::NoGo,
                        input_hash: String::new(),
                        created_at: Utc::now(),
                        checks: Vec::new(),
                        failing: Vec::new(),
                    },
                    current_hash: current_hash.to_string(),
                });
            }
            Err(e) => return Err(e),
        };
        if lock.input_hash == current_hash {
            Ok(LockVerification::Valid(lock))
        } else {
            Ok(LockVerification::Stale {
                lock,
                current_hash: current_hash.to_string(),
            })
        }
    }

    /// Move a stale lock aside as `*.stale-<timestamp>`
    pub fn retire(&self, wave: u32, decision_point: &str) -> CoordinationResult<Option<PathBuf>> {
        let path = self.path(wave, decision_point);
        if !path.exists() {
            return Ok(None);
        }
        let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(format!(".stale-{}", Utc::now().format("%Y%m%dT%H%M%S%.3fZ")));
        let retired = path.with_file_name(name);
        std::fs::rename(&path, &retired)?;
        warn!(wave, decision_point, retired = %retired.display(), "Stale decision lock retired");
        Ok(Some(retired))
    }

    /// Write the lock unless an identical-input lock already exists; a stale
    /// lock is retired first. Returns the lock path.
    pub fn commit(&self, lock: &DecisionLock) -> CoordinationResult<PathBuf> {
        match self.verify(lock.wave, &lock.decision_point, &lock.input_hash)? {
            LockVerification::Valid(_) => Ok(self.path(lock.wave, &lock.decision_point)),
            LockVerification::Stale { .. } => {
                self.retire(lock.wave, &lock.decision_point)?;
                self.write(lock)
            }
            LockVerification::Missing => self.write(lock),
        }
    }
}
