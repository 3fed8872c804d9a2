//! Signal Bus — publish, detect, read and await named records
//!
//! Reads never fail past this boundary: an unreadable or corrupt signal is
//! logged and treated as absent, and consumers must tolerate signals that
//! never arrive.

use super::names::{SignalKey, SignalPattern};
use super::store::SharedSignalStore;
use super::types::Signal;
use crate::error::CoordinationResult;
use crate::safety::CancelContext;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default poll interval for [`SignalBus::await_signal`]
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of waiting for a signal
#[derive(Debug, Clone, PartialEq)]
pub enum AwaitOutcome {
    Found(Signal),
    Timeout,
    Aborted { reason: String },
}

impl AwaitOutcome {
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }
}

/// Typed front-end over a [`SignalStore`](super::store::SignalStore)
#[derive(Clone)]
pub struct SignalBus {
    store: SharedSignalStore,
    poll_interval: Duration,
}

impl SignalBus {
    pub fn new(store: SharedSignalStore) -> Self {
        Self {
            store,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn store(&self) -> &SharedSignalStore {
        &self.store
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Write (or fully replace) the record for `(participant, event)`
    pub fn publish(
        &self,
        participant: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> CoordinationResult<PathBuf> {
        let key = SignalKey::new(participant, event)?;
        let path = self.store.put(&Signal::new(&key, payload))?;
        info!(signal = %key, "Signal published");
        Ok(path)
    }

    /// Location of the first signal matching the pattern, if any
    pub fn exists(&self, pattern: &SignalPattern) -> Option<PathBuf> {
        self.list(pattern)
            .first()
            .map(|signal| self.store.location(&signal.key()))
    }

    /// Read a single record; `None` when absent or unreadable
    pub fn read(&self, key: &SignalKey) -> Option<Signal> {
        match self.store.get(key) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(signal = %key, "Unreadable signal treated as absent: {}", e);
                None
            }
        }
    }

    /// Payload of a record, `Value::Null` when absent
    pub fn read_payload(&self, key: &SignalKey) -> serde_json::Value {
        self.read(key)
            .map(|signal| signal.payload)
            .unwrap_or(serde_json::Value::Null)
    }

    /// All records matching a pattern; empty on any store failure
    pub fn list(&self, pattern: &SignalPattern) -> Vec<Signal> {
        match self.store.list(pattern) {
            Ok(signals) => signals,
            Err(e) => {
                warn!(pattern = %pattern, "Signal scan failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Number of records matching a pattern
    pub fn count(&self, pattern: &SignalPattern) -> usize {
        self.list(pattern).len()
    }

    /// Poll until a matching signal appears, the timeout elapses, or the
    /// context is cancelled.
    ///
    /// The context is re-evaluated at the top of every iteration, so a
    /// tripped kill switch is observed within one poll interval regardless
    /// of how much of the timeout remains.
    pub async fn await_signal(
        &self,
        pattern: &SignalPattern,
        timeout: Duration,
        ctx: &CancelContext,
    ) -> AwaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut polls = 0u32;

        loop {
            if let Some(reason) = ctx.cancel_reason() {
                warn!(pattern = %pattern, %reason, polls, "Await aborted");
                return AwaitOutcome::Aborted { reason };
            }

            if let Some(signal) = self.list(pattern).into_iter().next() {
                debug!(pattern = %pattern, polls, "Await satisfied");
                return AwaitOutcome::Found(signal);
            }

            let now = Instant::now();
            if now >= deadline {
                info!(pattern = %pattern, polls, "Await timed out");
                return AwaitOutcome::Timeout;
            }

            let wait = self.poll_interval.min(deadline - now);
            polls += 1;
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = ctx.token().cancelled() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::{SafetyCheck, SafetyStatus};
    use crate::signal::store::{FsSignalStore, MemorySignalStore};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    struct Flag(AtomicBool);

    impl SafetyCheck for Flag {
        fn status(&self) -> SafetyStatus {
            if self.0.load(Ordering::SeqCst) {
                SafetyStatus::GlobalStop {
                    reason: "test".into(),
                }
            } else {
                SafetyStatus::Clear
            }
        }
    }

    fn bus() -> SignalBus {
        SignalBus::new(MemorySignalStore::shared())
    }

    #[test]
    fn test_publish_then_read_returns_latest_payload() {
        let dir = tempdir().unwrap();
        let bus = SignalBus::new(Arc::new(FsSignalStore::new(dir.path())));
        bus.publish("fe-1", "wave-1-complete", serde_json::json!({"v": 1})).unwrap();
        let path = bus.publish("fe-1", "wave-1-complete", serde_json::json!({"v": 2})).unwrap();

        let key = SignalKey::new("fe-1", "wave-1-complete").unwrap();
        assert_eq!(bus.read_payload(&key), serde_json::json!({"v": 2}));
        assert_eq!(path, dir.path().join("signal-fe-1.wave-1-complete.json"));
    }

    #[test]
    fn test_same_event_different_participants_distinct_locations() {
        let bus = bus();
        let a = bus.publish("fe-1", "wave-1-complete", serde_json::Value::Null).unwrap();
        let b = bus.publish("fe-2", "wave-1-complete", serde_json::Value::Null).unwrap();
        assert_ne!(a, b);
        assert_eq!(bus.count(&SignalPattern::new("*.wave-1-complete").unwrap()), 2);
    }

    #[test]
    fn test_read_missing_is_empty() {
        let bus = bus();
        let key = SignalKey::new("fe-1", "wave-9-complete").unwrap();
        assert!(bus.read(&key).is_none());
        assert!(bus.read_payload(&key).is_null());
        assert!(bus.exists(&SignalPattern::exact(&key)).is_none());
    }

    #[test]
    fn test_corrupt_signal_reads_as_absent() {
        let dir = tempdir().unwrap();
        let bus = SignalBus::new(Arc::new(FsSignalStore::new(dir.path())));
        std::fs::write(dir.path().join("signal-qa.wave-1-qa-approved.json"), "{oops").unwrap();
        let key = SignalKey::new("qa", "wave-1-qa-approved").unwrap();
        assert!(bus.read(&key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_finds_signal_published_later() {
        let bus = bus().with_poll_interval(Duration::from_secs(5));
        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            publisher
                .publish("be-1", "wave-1-complete", serde_json::Value::Null)
                .unwrap();
        });

        let pattern = SignalPattern::new("*.wave-1-complete").unwrap();
        let outcome = bus
            .await_signal(&pattern, Duration::from_secs(300), &CancelContext::new())
            .await;
        assert!(outcome.is_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_times_out() {
        let bus = bus().with_poll_interval(Duration::from_secs(5));
        let pattern = SignalPattern::new("*.wave-1-complete").unwrap();
        let start = Instant::now();
        let outcome = bus
            .await_signal(&pattern, Duration::from_secs(12), &CancelContext::new())
            .await;
        assert_eq!(outcome, AwaitOutcome::Timeout);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(12));
        assert!(elapsed < Duration::from_secs(13));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_switch_aborts_within_one_poll_interval() {
        let bus = bus().with_poll_interval(Duration::from_secs(5));
        let flag = Arc::new(Flag(AtomicBool::new(false)));
        let ctx = CancelContext::new().with_safety(flag.clone());

        let trip = flag.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            trip.0.store(true, Ordering::SeqCst);
        });

        let pattern = SignalPattern::new("*.wave-1-complete").unwrap();
        let start = Instant::now();
        let outcome = bus
            .await_signal(&pattern, Duration::from_secs(300), &ctx)
            .await;

        assert!(matches!(outcome, AwaitOutcome::Aborted { .. }));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(7));
        assert!(
            elapsed <= Duration::from_millis(10_050),
            "aborted after {:?}",
            elapsed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_cancel_interrupts_sleep() {
        let bus = bus().with_poll_interval(Duration::from_secs(60));
        let ctx = CancelContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let pattern = SignalPattern::new("*.never").unwrap();
        let start = Instant::now();
        let outcome = bus
            .await_signal(&pattern, Duration::from_secs(300), &ctx)
            .await;
        assert!(matches!(outcome, AwaitOutcome::Aborted { .. }));
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tripped_switch_aborts_before_first_scan() {
        let bus = bus();
        bus.publish("fe-1", "wave-1-complete", serde_json::Value::Null).unwrap();
        let ctx = CancelContext::new().with_safety(Arc::new(Flag(AtomicBool::new(true))));
        let pattern = SignalPattern::new("*.wave-1-complete").unwrap();
        let outcome = bus
            .await_signal(&pattern, Duration::from_secs(300), &ctx)
            .await;
        assert!(matches!(outcome, AwaitOutcome::Aborted { .. }));
    }
}
