//! Wave coordination library
//!
//! Deterministic core for running a batch ("wave") of work items across
//! several isolated participants that share nothing but a signals directory.
//!
//! # Components
//!
//! - [`signal`]: named JSON records, the only channel between participants
//! - [`safety`]: global and per-participant kill switch, cooperative cancellation
//! - [`budget`]: fixed-point cost ledger built from token-usage signals
//! - [`boundary`]: allow/forbid path policies and the domain boundary validator
//! - [`retry`]: per-story / per-gate retry counters with one-way escalation
//! - [`gate`]: gate state machine, pre-flight and pre-merge validators,
//!   decision locks
//! - [`dispatch`]: round-robin assignment of work items within domain pools
//! - [`snapshot`]: project-state snapshots and restore
//!
//! Supporting modules: [`config`], [`journal`], [`participant`],
//! [`work_item`] and [`error`].
//!
//! # Example
//!
//! ```no_run
//! use coordination::{FsSignalStore, SignalBus};
//! use std::sync::Arc;
//!
//! let bus = SignalBus::new(Arc::new(FsSignalStore::new(".wave/signals")));
//! bus.publish("fe-1", "wave-1-complete", serde_json::json!({"stories": ["FE-1"]}))?;
//! # Ok::<(), coordination::CoordinationError>(())
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod boundary;
pub mod budget;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod journal;
pub mod participant;
pub mod retry;
pub mod safety;
pub mod signal;
pub mod snapshot;
pub mod work_item;

pub use boundary::{BoundaryReport, BoundaryRules, BoundaryValidator, ChangeSet, DomainPolicy};
pub use budget::{BudgetLedger, BudgetLimits, BudgetStatus, Cost};
pub use config::WaveConfig;
pub use dispatch::{DispatchPlan, WorkDispatcher};
pub use error::{CoordinationError, CoordinationResult, StructuredError};
pub use gate::{
    DecisionLockStore, GateMachine, GatePipeline, GateStatus, PreflightInput, PreflightValidator,
    PremergeInput, PremergeValidator, ValidationReport, Verdict,
};
pub use journal::{EventLog, JournalEvent, ViolationRecord};
pub use participant::{Participant, Role, Roster};
pub use retry::{RetryController, RetryDecision, RetryScope};
pub use safety::{CancelContext, KillSwitch, SafetyCheck, SafetyStatus};
pub use signal::{
    AwaitOutcome, FsSignalStore, MemorySignalStore, Signal, SignalBus, SignalKey, SignalPattern,
};
pub use snapshot::{RestoreSelector, SnapshotManager};
pub use work_item::{WorkItem, WorkItemStatus};
