//! Project configuration
//!
//! Layering: built-in defaults, then `<project>/.wave/config.toml`, then
//! `WAVE_*` environment variables. Command-line flags are applied by the
//! caller last. Relative paths resolve against the project root.

use crate::budget::{BudgetLimits, Cost, TokenRates};
use crate::error::{CoordinationError, CoordinationResult};
use crate::retry::DEFAULT_MAX_RETRIES;
use crate::snapshot::DEFAULT_RETENTION;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Config file location relative to the project root
pub const CONFIG_FILE: &str = ".wave/config.toml";

/// Placeholder replaced by the wave number in per-wave paths
const WAVE_PLACEHOLDER: &str = "{wave}";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaveConfig {
    pub project_root: PathBuf,
    pub signals_dir: PathBuf,
    pub snapshots_dir: PathBuf,
    pub journal: PathBuf,
    pub locks_dir: PathBuf,
    /// May contain `{wave}`
    pub stories_dir: PathBuf,
    /// May contain `{wave}`
    pub logs_dir: PathBuf,
    pub project_state: PathBuf,
    pub kill_marker: PathBuf,
    pub roster: PathBuf,
    /// Optional gate pipeline override
    pub gates: PathBuf,
    pub reference_doc: Option<PathBuf>,

    pub retry_limit: u32,
    pub budget_limit: Cost,
    pub warn_fraction: Cost,
    pub rates: TokenRates,
    pub cost_per_point: Cost,
    pub max_wave_size: usize,
    pub min_completions: usize,
    pub poll_interval_secs: u64,
    pub await_timeout_secs: u64,
    pub snapshot_retention: usize,
}

impl Default for WaveConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            signals_dir: PathBuf::from(".wave/signals"),
            snapshots_dir: PathBuf::from(".wave/snapshots"),
            journal: PathBuf::from(".wave/journal.jsonl"),
            locks_dir: PathBuf::from(".wave/locks"),
            stories_dir: PathBuf::from(".wave/stories/wave-{wave}"),
            logs_dir: PathBuf::from(".wave/logs/wave-{wave}"),
            project_state: PathBuf::from(".wave/project-state.json"),
            kill_marker: PathBuf::from(".wave/EMERGENCY-STOP"),
            roster: PathBuf::from(".wave/roster.yaml"),
            gates: PathBuf::from(".wave/gates.yaml"),
            reference_doc: None,
            retry_limit: DEFAULT_MAX_RETRIES,
            budget_limit: Cost::from_cents(500),
            warn_fraction: Cost::from_micros(800_000),
            rates: TokenRates::default(),
            cost_per_point: Cost::from_cents(10),
            max_wave_size: 8,
            min_completions: 1,
            poll_interval_secs: 5,
            await_timeout_secs: 300,
            snapshot_retention: DEFAULT_RETENTION,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> CoordinationResult<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| CoordinationError::invocation(format!("{}={}: {}", key, raw, e)))
}

impl WaveConfig {
    /// Defaults rooted at `project_root`
    pub fn for_project(project_root: impl AsRef<Path>) -> Self {
        Self {
            project_root: project_root.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Defaults, then the project's config file, then the environment
    pub fn load(project_root: impl AsRef<Path>) -> CoordinationResult<Self> {
        let root = project_root.as_ref();
        let mut config = Self::from_file_or_default(root)?;
        config.apply_env()?;
        config.resolve_paths();
        config.validate()?;
        Ok(config)
    }

    fn from_file_or_default(root: &Path) -> CoordinationResult<Self> {
        let path = root.join(CONFIG_FILE);
        let mut config = match std::fs::read_to_string(&path) {
            Ok(content) => {
                debug!(path = %path.display(), "Loading config file");
                toml::from_str(&content)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e.into()),
        };
        config.project_root = root.to_path_buf();
        Ok(config)
    }

    /// Apply `WAVE_*` variables from the process environment
    pub fn apply_env(&mut self) -> CoordinationResult<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply `WAVE_*` variables from `lookup`. A value that does not parse is
    /// an invocation error.
    pub fn apply_env_with(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> CoordinationResult<()> {
        if let Some(dir) = lookup("WAVE_SIGNALS_DIR") {
            self.signals_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup("WAVE_RETRY_LIMIT") {
            self.retry_limit = parse_env("WAVE_RETRY_LIMIT", &raw)?;
        }
        if let Some(raw) = lookup("WAVE_BUDGET_LIMIT") {
            self.budget_limit = parse_env("WAVE_BUDGET_LIMIT", &raw)?;
        }
        if let Some(raw) = lookup("WAVE_BUDGET_WARN_FRACTION") {
            self.warn_fraction = parse_env("WAVE_BUDGET_WARN_FRACTION", &raw)?;
        }
        if let Some(raw) = lookup("WAVE_POLL_INTERVAL_SECS") {
            self.poll_interval_secs = parse_env("WAVE_POLL_INTERVAL_SECS", &raw)?;
        }
        if let Some(raw) = lookup("WAVE_MIN_COMPLETIONS") {
            self.min_completions = parse_env("WAVE_MIN_COMPLETIONS", &raw)?;
        }
        Ok(())
    }

    /// Join every relative path onto the project root
    pub fn resolve_paths(&mut self) {
        let root = self.project_root.clone();
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = root.join(&*p);
            }
        };
        resolve(&mut self.signals_dir);
        resolve(&mut self.snapshots_dir);
        resolve(&mut self.journal);
        resolve(&mut self.locks_dir);
        resolve(&mut self.stories_dir);
        resolve(&mut self.logs_dir);
        resolve(&mut self.project_state);
        resolve(&mut self.kill_marker);
        resolve(&mut self.roster);
        resolve(&mut self.gates);
        if let Some(doc) = self.reference_doc.as_mut() {
            resolve(doc);
        }
    }

    pub fn validate(&self) -> CoordinationResult<()> {
        if self.retry_limit == 0 {
            return Err(CoordinationError::invocation("retry_limit must be at least 1"));
        }
        if self.warn_fraction <= Cost::ZERO || self.warn_fraction > Cost::from_cents(100) {
            return Err(CoordinationError::invocation(format!(
                "warn_fraction must be in (0, 1], got {}",
                self.warn_fraction
            )));
        }
        if self.poll_interval_secs == 0 {
            return Err(CoordinationError::invocation("poll_interval_secs must be positive"));
        }
        Ok(())
    }

    pub fn stories_dir(&self, wave: u32) -> PathBuf {
        expand_wave(&self.stories_dir, wave)
    }

    pub fn logs_dir(&self, wave: u32) -> PathBuf {
        expand_wave(&self.logs_dir, wave)
    }

    pub fn budget(&self) -> BudgetLimits {
        BudgetLimits {
            limit: self.budget_limit,
            warn_fraction: self.warn_fraction,
            rates: self.rates,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn await_timeout(&self) -> Duration {
        Duration::from_secs(self.await_timeout_secs)
    }
}

fn expand_wave(template: &Path, wave: u32) -> PathBuf {
    PathBuf::from(
        template
            .to_string_lossy()
            .replace(WAVE_PLACEHOLDER, &wave.to_string()),
    )
}
