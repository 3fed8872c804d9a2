//! Signal Bus
//!
//! Named JSON records in a shared directory are the only channel between
//! participants. See [`bus::SignalBus`] for the operations.

pub mod bus;
pub mod names;
pub mod store;
pub mod types;

pub use bus::{AwaitOutcome, SignalBus, DEFAULT_POLL_INTERVAL};
pub use names::{events, slug, SignalKey, SignalPattern, COORDINATOR};
pub use store::{FsSignalStore, MemorySignalStore, SharedSignalStore, SignalStore};
pub use types::{CompletionPayload, RetryPayload, Signal, TokenUsagePayload};
