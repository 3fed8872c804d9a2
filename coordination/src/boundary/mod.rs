//! Domain boundary enforcement
//!
//! Each participant may only modify files inside its own domain. The
//! validator compares a participant's [`ChangeSet`] against its
//! [`DomainPolicy`] and the shared [`BoundaryRules`], producing
//! [`ViolationRecord`](crate::journal::ViolationRecord)s for the journal.

pub mod changes;
pub mod policy;
pub mod validator;

pub use changes::{resolve_workspace, ChangeSet};
pub use policy::{
    normalize_path, BoundaryRules, DomainPolicy, PathPattern, DEFAULT_SHARED_FORBID,
    DEFAULT_TOLERATED,
};
pub use validator::{BoundaryReport, BoundaryValidator, PathDecision, ViolationReason};
