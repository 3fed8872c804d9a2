//! Signal storage backends
//!
//! The bus talks to a [`SignalStore`]; the filesystem store is what separate
//! participant processes share, the memory store backs tests.

use super::names::{SignalKey, SignalPattern};
use super::types::Signal;
use crate::error::CoordinationResult;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Shared reference to a signal store
pub type SharedSignalStore = Arc<dyn SignalStore>;

/// Key-value store addressed by [`SignalKey`]
pub trait SignalStore: Send + Sync {
    /// Replace the record stored under the signal's key, returning its location
    fn put(&self, signal: &Signal) -> CoordinationResult<PathBuf>;

    /// Read the record for a key
    fn get(&self, key: &SignalKey) -> CoordinationResult<Option<Signal>>;

    /// All records whose key matches the pattern, ordered by key
    fn list(&self, pattern: &SignalPattern) -> CoordinationResult<Vec<Signal>>;

    /// Remove a record; returns whether one existed
    fn remove(&self, key: &SignalKey) -> CoordinationResult<bool>;

    /// Where a key is (or would be) stored
    fn location(&self, key: &SignalKey) -> PathBuf;
}

/// One JSON file per signal in a shared directory
pub struct FsSignalStore {
    dir: PathBuf,
}

impl FsSignalStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_file(&self, path: &Path) -> CoordinationResult<Option<Signal>> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }
}

impl SignalStore for FsSignalStore {
    fn put(&self, signal: &Signal) -> CoordinationResult<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let key = signal.key();
        let path = self.location(&key);

        // Readers skip dot-files, so a half-written temp file is never observed.
        let temp_path = self
            .dir
            .join(format!(".{}.{}.tmp", key.file_name(), uuid::Uuid::new_v4()));
        let content = serde_json::to_string_pretty(signal)?;
        std::fs::write(&temp_path, content)?;

        if let Err(e) = std::fs::rename(&temp_path, &path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e.into());
        }

        debug!(signal = %key, path = %path.display(), "Signal written");
        Ok(path)
    }

    fn get(&self, key: &SignalKey) -> CoordinationResult<Option<Signal>> {
        self.read_file(&self.location(key))
    }

    fn list(&self, pattern: &SignalPattern) -> CoordinationResult<Vec<Signal>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut matched = BTreeMap::new();
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let Some(key) = SignalKey::from_file_name(name) else {
                continue;
            };
            if !pattern.matches(&key) {
                continue;
            }
            match self.read_file(&entry.path()) {
                Ok(Some(signal)) => {
                    matched.insert(key, signal);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(file = %name, "Skipping unreadable signal: {}", e);
                }
            }
        }

        Ok(matched.into_values().collect())
    }

    fn remove(&self, key: &SignalKey) -> CoordinationResult<bool> {
        match std::fs::remove_file(self.location(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn location(&self, key: &SignalKey) -> PathBuf {
        self.dir.join(key.file_name())
    }
}

/// In-process store for tests and dry runs
#[derive(Default)]
pub struct MemorySignalStore {
    signals: RwLock<BTreeMap<SignalKey, Signal>>,
}

impl MemorySignalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedSignalStore {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.signals.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SignalStore for MemorySignalStore {
    fn put(&self, signal: &Signal) -> CoordinationResult<PathBuf> {
        let key = signal.key();
        let location = self.location(&key);
        if let Ok(mut signals) = self.signals.write() {
            signals.insert(key, signal.clone());
        }
        Ok(location)
    }

    fn get(&self, key: &SignalKey) -> CoordinationResult<Option<Signal>> {
        Ok(self
            .signals
            .read()
            .ok()
            .and_then(|signals| signals.get(key).cloned()))
    }

    fn list(&self, pattern: &SignalPattern) -> CoordinationResult<Vec<Signal>> {
        Ok(self
            .signals
            .read()
            .map(|signals| {
                signals
                    .iter()
                    .filter(|(key, _)| pattern.matches(key))
                    .map(|(_, signal)| signal.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn remove(&self, key: &SignalKey) -> CoordinationResult<bool> {
        Ok(self
            .signals
            .write()
            .map(|mut signals| signals.remove(key).is_some())
            .unwrap_or(false))
    }

    fn location(&self, key: &SignalKey) -> PathBuf {
        PathBuf::from("memory").join(key.file_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn signal(participant: &str, event: &str, payload: serde_json::Value) -> Signal {
        Signal::new(&SignalKey::new(participant, event).unwrap(), payload)
    }

    #[test]
    fn test_fs_put_replaces_not_appends() {
        let dir = tempdir().unwrap();
        let store = FsSignalStore::new(dir.path());

        store.put(&signal("fe-1", "wave-1-complete", serde_json::json!({"n": 1}))).unwrap();
        store.put(&signal("fe-1", "wave-1-complete", serde_json::json!({"n": 2}))).unwrap();

        let key = SignalKey::new("fe-1", "wave-1-complete").unwrap();
        let read = store.get(&key).unwrap().unwrap();
        assert_eq!(read.payload, serde_json::json!({"n": 2}));

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().flatten().collect();
        assert_eq!(files.len(), 1, "no temp files or duplicates left behind");
    }

    #[test]
    fn test_fs_list_skips_temp_and_foreign_files() {
        let dir = tempdir().unwrap();
        let store = FsSignalStore::new(dir.path());
        store.put(&signal("fe-1", "wave-1-complete", serde_json::Value::Null)).unwrap();
        store.put(&signal("be-1", "wave-1-complete", serde_json::Value::Null)).unwrap();
        std::fs::write(dir.path().join(".signal-x.wave-1-complete.json.tmp"), "{").unwrap();
        std::fs::write(dir.path().join("README.md"), "notes").unwrap();
        std::fs::write(dir.path().join("signal-broken.wave-1-complete.json"), "{not json").unwrap();

        let pattern = SignalPattern::new("*.wave-1-complete").unwrap();
        let signals = store.list(&pattern).unwrap();
        let participants: Vec<_> = signals.iter().map(|s| s.participant.as_str()).collect();
        assert_eq!(participants, vec!["be-1", "fe-1"]);
    }

    #[test]
    fn test_fs_list_missing_dir_is_empty() {
        let dir = tempdir().unwrap();
        let store = FsSignalStore::new(dir.path().join("absent"));
        let pattern = SignalPattern::new("*").unwrap();
        assert!(store.list(&pattern).unwrap().is_empty());
    }

    #[test]
    fn test_memory_store_remove() {
        let store = MemorySignalStore::new();
        let s = signal("ops", "stop", serde_json::Value::Null);
        store.put(&s).unwrap();
        assert!(store.remove(&s.key()).unwrap());
        assert!(!store.remove(&s.key()).unwrap());
        assert!(store.is_empty());
    }
}
