//! Event journal — append-only JSONL log of violations, retries and escalations
//!
//! Every line is one [`JournalEvent`], tagged by `kind`. Appends hold an
//! exclusive advisory lock on a sibling `.lock` file so concurrent writers
//! from separate processes never interleave lines.

use crate::error::CoordinationResult;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A file written outside a participant's domain boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub participant: String,
    pub file: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wave: Option<u32>,
}

impl ViolationRecord {
    pub fn new(
        participant: impl Into<String>,
        file: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            participant: participant.into(),
            file: file.into(),
            reason: reason.into(),
            timestamp: Utc::now(),
            wave: None,
        }
    }

    pub fn in_wave(mut self, wave: u32) -> Self {
        self.wave = Some(wave);
        self
    }
}

/// One line of the journal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalEvent {
    Violation(ViolationRecord),
    RetryRecorded {
        wave: u32,
        scope: String,
        count: u32,
        max: u32,
        timestamp: DateTime<Utc>,
    },
    Escalated {
        wave: u32,
        scope: String,
        count: u32,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl JournalEvent {
    pub fn wave(&self) -> Option<u32> {
        match self {
            Self::Violation(v) => v.wave,
            Self::RetryRecorded { wave, .. } | Self::Escalated { wave, .. } => Some(*wave),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Violation(v) => v.timestamp,
            Self::RetryRecorded { timestamp, .. } | Self::Escalated { timestamp, .. } => {
                *timestamp
            }
        }
    }
}

/// Append-only journal file
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    /// Append one event
    pub fn append(&self, event: &JournalEvent) -> CoordinationResult<()> {
        self.append_all(std::slice::from_ref(event))
    }

    /// Append several events under a single lock acquisition
    pub fn append_all(&self, events: &[JournalEvent]) -> CoordinationResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path())?;
        FileExt::lock_exclusive(&lock_file)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        for event in events {
            let line = serde_json::to_string(event)?;
            writeln!(file, "{}", line)?;
        }
        file.sync_all()?;
        FileExt::unlock(&lock_file)?;

        debug!(count = events.len(), path = %self.path.display(), "Journal appended");
        Ok(())
    }

    /// Read every well-formed event, oldest first
    pub fn read_all(&self) -> CoordinationResult<Vec<JournalEvent>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::new();
        for (index, line) in BufReader::new(file).lines().map_while(Result::ok).enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(event) => events.push(event),
                Err(e) => warn!(line = index + 1, "Skipping malformed journal line: {}", e),
            }
        }
        Ok(events)
    }

    /// Violations, optionally restricted to one wave
    pub fn violations(&self, wave: Option<u32>) -> CoordinationResult<Vec<ViolationRecord>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter_map(|event| match event {
                JournalEvent::Violation(v) if wave.is_none() || v.wave == wave => Some(v),
                _ => None,
            })
            .collect())
    }

    /// Violations recorded at or after `since`
    pub fn violations_since(
        &self,
        wave: Option<u32>,
        since: DateTime<Utc>,
    ) -> CoordinationResult<Vec<ViolationRecord>> {
        Ok(self
            .violations(wave)?
            .into_iter()
            .filter(|v| v.timestamp >= since)
            .collect())
    }

    /// Every event for one wave
    pub fn for_wave(&self, wave: u32) -> CoordinationResult<Vec<JournalEvent>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|event| event.wave() == Some(wave))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_append_and_read_tagged_events() {
        let dir = tempdir().unwrap();
        let log = EventLog::new(dir.path().join("journal.jsonl"));

        log.append(&JournalEvent::Violation(
            ViolationRecord::new("fe-1", "src/api/x.ts", "forbidden path").in_wave(1),
        ))
        .unwrap();
        log.append(&JournalEvent::RetryRecorded {
            wave: 1,
            scope: "story:fe-001".into(),
            count: 1,
            max: 3,
            timestamp: Utc::now(),
        })
        .unwrap();

        let raw = std::fs::read_to_string(log.path()).unwrap();
        assert!(raw.lines().next().unwrap().contains("\"kind\":\"violation\""));

        let events = log.read_all().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(log.violations(Some(1)).unwrap().len(), 1);
        assert!(log.violations(Some(2)).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let log = EventLog::new(&path);
        log.append(&JournalEvent::Violation(ViolationRecord::new("be-1", ".env", "shared")))
            .unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "not json at all").unwrap();
        writeln!(file).unwrap();

        assert_eq!(log.read_all().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_journal_is_empty() {
        let dir = tempdir().unwrap();
        let log = EventLog::new(dir.path().join("nested/journal.jsonl"));
        assert!(log.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_violations_since_filters_old_records() {
        let dir = tempdir().unwrap();
        let log = EventLog::new(dir.path().join("journal.jsonl"));
        let mut old = ViolationRecord::new("fe-1", "a", "old").in_wave(1);
        old.timestamp = Utc::now() - chrono::Duration::hours(2);
        let recent = ViolationRecord::new("fe-1", "b", "recent").in_wave(1);
        log.append_all(&[JournalEvent::Violation(old), JournalEvent::Violation(recent)])
            .unwrap();

        let since = Utc::now() - chrono::Duration::minutes(30);
        let found = log.violations_since(Some(1), since).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].file, "b");
    }
}
