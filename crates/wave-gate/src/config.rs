//! Resolve flags, environment and the project config file into one context

use crate::cli::GlobalArgs;
use anyhow::{Context as _, Result};
use coordination::error::CoordinationError;
use coordination::gate::{DecisionLockStore, GatePipeline};
use coordination::signal::names::validate_identifier;
use coordination::signal::{FsSignalStore, SharedSignalStore, SignalBus};
use coordination::{EventLog, KillSwitch, Roster, SnapshotManager, WaveConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Everything a command needs, resolved once per invocation
#[derive(Debug, Clone)]
pub struct Context {
    pub config: WaveConfig,
    pub wave: u32,
    pub participant: Option<String>,
    pub dry_run: bool,
    pub json: bool,
}

impl Context {
    /// Defaults, then `.wave/config.toml`, then `WAVE_*`, then flags
    pub fn resolve(args: &GlobalArgs) -> Result<Self> {
        let root = match &args.project {
            Some(root) => root.clone(),
            None => std::env::current_dir().context("Cannot determine current directory")?,
        };
        if !root.is_dir() {
            return Err(CoordinationError::invocation(format!(
                "project root {} is not a directory",
                root.display()
            ))
            .into());
        }
        if let Some(name) = &args.participant {
            validate_identifier(name)?;
        }

        let mut config = WaveConfig::load(&root)?;
        if let Some(dir) = &args.signals_dir {
            config.signals_dir = dir.clone();
        }
        if let Some(limit) = args.retry_limit {
            config.retry_limit = limit;
        }
        if let Some(limit) = &args.budget_limit {
            config.budget_limit = limit.parse()?;
        }
        config.resolve_paths();
        config.validate()?;
        debug!(root = %root.display(), signals = %config.signals_dir.display(), "Configuration resolved");

        Ok(Self {
            config,
            wave: args.wave,
            participant: args.participant.clone(),
            dry_run: args.dry_run,
            json: args.json,
        })
    }

    pub fn store(&self) -> SharedSignalStore {
        Arc::new(FsSignalStore::new(&self.config.signals_dir))
    }

    pub fn bus(&self) -> SignalBus {
        SignalBus::new(self.store()).with_poll_interval(self.config.poll_interval())
    }

    /// Kill switch that also honours the selected participant's stop signal
    pub fn kill_switch(&self) -> KillSwitch {
        let switch = KillSwitch::new(&self.config.kill_marker, self.store());
        match &self.participant {
            Some(name) => switch.for_participant(name.clone()),
            None => switch,
        }
    }

    pub fn journal(&self) -> EventLog {
        EventLog::new(&self.config.journal)
    }

    pub fn locks(&self) -> DecisionLockStore {
        DecisionLockStore::new(&self.config.locks_dir)
    }

    pub fn roster(&self) -> Result<Roster> {
        Ok(Roster::load(&self.config.roster)?)
    }

    /// Gate pipeline, sized to the roster's workers when a roster exists
    pub fn pipeline(&self) -> Result<GatePipeline> {
        let workers = if self.config.roster.exists() {
            self.roster()?.workers().count()
        } else {
            0
        };
        Ok(GatePipeline::load_or_standard(
            &self.config.gates,
            workers.max(self.config.min_completions),
        )?)
    }

    pub fn snapshots(&self) -> SnapshotManager {
        SnapshotManager::new(&self.config.project_state, &self.config.snapshots_dir)
            .with_retention(self.config.snapshot_retention)
    }

    pub fn require_participant(&self) -> Result<&str> {
        self.participant.as_deref().ok_or_else(|| {
            CoordinationError::invocation("this command needs --participant").into()
        })
    }

    pub fn project_root(&self) -> &PathBuf {
        &self.config.project_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn args(root: &std::path::Path) -> GlobalArgs {
        GlobalArgs {
            project: Some(root.to_path_buf()),
            wave: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_flags_override_config() {
        let dir = tempdir().unwrap();
        let mut args = args(dir.path());
        args.signals_dir = Some(PathBuf::from("shared/signals"));
        args.retry_limit = Some(5);
        args.budget_limit = Some("9.75".to_string());

        let ctx = Context::resolve(&args).unwrap();
        assert_eq!(ctx.config.signals_dir, dir.path().join("shared/signals"));
        assert_eq!(ctx.config.retry_limit, 5);
        assert_eq!(ctx.config.budget_limit, "9.75".parse().unwrap());
        assert_eq!(ctx.wave, 2);
    }

    #[test]
    fn test_missing_project_root_is_invocation_error() {
        let dir = tempdir().unwrap();
        let err = Context::resolve(&args(&dir.path().join("nope"))).unwrap_err();
        let err = err.downcast_ref::<CoordinationError>().unwrap();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_bad_participant_name_is_rejected() {
        let dir = tempdir().unwrap();
        let mut args = args(dir.path());
        args.participant = Some("FE 1".to_string());
        let err = Context::resolve(&args).unwrap_err();
        assert_eq!(
            err.downcast_ref::<CoordinationError>().unwrap().exit_code(),
            2
        );
    }
}
