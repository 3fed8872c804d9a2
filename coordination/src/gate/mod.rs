//! Gates and validators
//!
//! - [`pipeline`]: ordered gates whose status is derived from signals
//! - [`preflight`]: GO / CONDITIONAL-GO / NO-GO before dispatch
//! - [`premerge`]: APPROVED / REJECTED after development
//! - [`lock`]: write-once decision records with input hashes

pub mod lock;
pub mod pipeline;
pub mod preflight;
pub mod premerge;
pub mod report;

pub use lock::{DecisionLock, DecisionLockStore, LockVerification};
pub use pipeline::{GateAwait, GateDef, GateMachine, GatePipeline, GateState, GateStatus};
pub use preflight::{PreflightInput, PreflightValidator};
pub use premerge::{PremergeInput, PremergeValidator};
pub use report::{CheckOutcome, CheckResult, ValidationKind, ValidationReport, Verdict};
