//! In-flight push tracking and per-map push state.
//!
//! The tracker caps concurrent pushes per destination endpoint and bounds
//! how long the producer waits for capacity. Entries are guarded: a dropped
//! push (cancelled future, transport teardown) always removes its slot, and
//! the limit loops additionally prune entries older than the push timeout
//! so a wedged destination cannot park the producer forever.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{error, warn};

use rss_common::config::ClientConfig;
use rss_common::{Result, RssError};

/// Re-create an error value so the first failure can be rethrown to every
/// later caller.
pub(crate) fn replicate_error(e: &RssError) -> RssError {
    match e {
        RssError::PushDataWriteFailPrimary(m) => RssError::PushDataWriteFailPrimary(m.clone()),
        RssError::PushDataWriteFailReplica(m) => RssError::PushDataWriteFailReplica(m.clone()),
        RssError::PushDataConnectionFail(m) => RssError::PushDataConnectionFail(m.clone()),
        RssError::PushDataTimeout(m) => RssError::PushDataTimeout(m.clone()),
        RssError::PushDataCongestControl(m) => RssError::PushDataCongestControl(m.clone()),
        RssError::SoftSplit(m) => RssError::SoftSplit(m.clone()),
        RssError::HardSplit(m) => RssError::HardSplit(m.clone()),
        RssError::StageEnd(m) => RssError::StageEnd(m.clone()),
        RssError::FetchFail(m) => RssError::FetchFail(m.clone()),
        RssError::IntegrityMismatch(m) => RssError::IntegrityMismatch(m.clone()),
        RssError::IntegrityIncomplete(m) => RssError::IntegrityIncomplete(m.clone()),
        RssError::BufferExhausted(m) => RssError::BufferExhausted(m.clone()),
        RssError::FlusherBackPressure(m) => RssError::FlusherBackPressure(m.clone()),
        RssError::WriterAborted(m) => RssError::WriterAborted(m.clone()),
        RssError::WorkerBusy(m) => RssError::WorkerBusy(m.clone()),
        RssError::ReplicaUnavailable(m) => RssError::ReplicaUnavailable(m.clone()),
        RssError::InvalidConfig(m) => RssError::InvalidConfig(m.clone()),
        RssError::Unsupported(m) => RssError::Unsupported(m.clone()),
        RssError::Io(io) => RssError::Io(std::io::Error::new(io.kind(), io.to_string())),
    }
}

struct BatchInfo {
    pushed_at: Instant,
}

/// Tracks `{endpoint -> {batch_id -> info}}` for one map attempt.
pub struct InFlightRequestTracker {
    next_batch_id: AtomicU32,
    batches: Mutex<HashMap<String, HashMap<u32, BatchInfo>>>,
    limit_timeout: Duration,
    push_timeout: Duration,
    sleep_delta: Duration,
}

impl InFlightRequestTracker {
    /// Tracker with the client's timeout settings.
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            next_batch_id: AtomicU32::new(0),
            batches: Mutex::new(HashMap::new()),
            limit_timeout: Duration::from_millis(config.in_flight_limit_timeout_ms),
            push_timeout: Duration::from_millis(config.push_data_timeout_ms),
            sleep_delta: Duration::from_millis(config.in_flight_sleep_delta_ms.max(1)),
        }
    }

    /// Allocate the next batch id for this map attempt.
    pub fn next_batch_id(&self) -> u32 {
        self.next_batch_id.fetch_add(1, Ordering::AcqRel)
    }

    /// Register one in-flight batch; the guard removes it on drop.
    pub fn track(self: &Arc<Self>, endpoint: &str, batch_id: u32) -> InFlightGuard {
        self.batches
            .lock()
            .expect("tracker lock")
            .entry(endpoint.to_string())
            .or_default()
            .insert(
                batch_id,
                BatchInfo {
                    pushed_at: Instant::now(),
                },
            );
        InFlightGuard {
            tracker: Arc::clone(self),
            endpoint: endpoint.to_string(),
            batch_id,
        }
    }

    fn remove(&self, endpoint: &str, batch_id: u32) {
        let mut batches = self.batches.lock().expect("tracker lock");
        if let Some(per_endpoint) = batches.get_mut(endpoint) {
            per_endpoint.remove(&batch_id);
            if per_endpoint.is_empty() {
                batches.remove(endpoint);
            }
        }
    }

    /// Batches currently in flight toward one endpoint.
    pub fn in_flight(&self, endpoint: &str) -> usize {
        self.batches
            .lock()
            .expect("tracker lock")
            .get(endpoint)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Batches in flight across all endpoints.
    pub fn total_in_flight(&self) -> usize {
        self.batches
            .lock()
            .expect("tracker lock")
            .values()
            .map(|m| m.len())
            .sum()
    }

    /// Prune entries older than the push timeout; the owning futures have
    /// been failed by their own deadline and must not pin the limit loops.
    pub fn fail_expired(&self) -> usize {
        let mut pruned = 0;
        let mut batches = self.batches.lock().expect("tracker lock");
        batches.retain(|endpoint, per_endpoint| {
            per_endpoint.retain(|batch_id, info| {
                let expired = info.pushed_at.elapsed() > self.push_timeout;
                if expired {
                    warn!(endpoint = %endpoint, batch_id, "expiring in-flight batch");
                    pruned += 1;
                }
                !expired
            });
            !per_endpoint.is_empty()
        });
        pruned
    }

    /// Wait until the endpoint's in-flight count is at or under `max`.
    /// Returns true when the limit timeout elapsed first.
    pub async fn limit_max_in_flight(
        &self,
        endpoint: &str,
        max: usize,
        state: &PushState,
    ) -> Result<bool> {
        let deadline = Instant::now() + self.limit_timeout;
        loop {
            state.check()?;
            if self.in_flight(endpoint) <= max {
                return Ok(false);
            }
            self.fail_expired();
            if Instant::now() >= deadline {
                warn!(
                    endpoint = %endpoint,
                    in_flight = self.in_flight(endpoint),
                    max,
                    "in-flight limit wait timed out"
                );
                return Ok(true);
            }
            tokio::time::sleep(self.sleep_delta).await;
        }
    }

    /// Wait until nothing is in flight anywhere. Returns true when the
    /// limit timeout elapsed first.
    pub async fn limit_zero_in_flight(&self, state: &PushState) -> Result<bool> {
        let deadline = Instant::now() + self.limit_timeout;
        loop {
            state.check()?;
            if self.total_in_flight() == 0 {
                return Ok(false);
            }
            self.fail_expired();
            if Instant::now() >= deadline {
                error!(
                    in_flight = self.total_in_flight(),
                    "expected zero in-flight batches before map end"
                );
                return Ok(true);
            }
            tokio::time::sleep(self.sleep_delta).await;
        }
    }

    /// Drop every tracked batch.
    pub fn cleanup(&self) {
        self.batches.lock().expect("tracker lock").clear();
    }
}

/// Removes its in-flight entry on drop.
pub struct InFlightGuard {
    tracker: Arc<InFlightRequestTracker>,
    endpoint: String,
    batch_id: u32,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tracker.remove(&self.endpoint, self.batch_id);
    }
}

/// Shared failure state for one map attempt's pushes.
pub struct PushState {
    error: Mutex<Option<RssError>>,
    /// In-flight accounting for this attempt.
    pub tracker: Arc<InFlightRequestTracker>,
}

impl PushState {
    /// Fresh state with its own tracker.
    pub fn new(config: &ClientConfig) -> Arc<Self> {
        Arc::new(Self {
            error: Mutex::new(None),
            tracker: Arc::new(InFlightRequestTracker::new(config)),
        })
    }

    /// Record the first push failure.
    pub fn record_error(&self, e: RssError) {
        let mut slot = self.error.lock().expect("push state lock");
        if slot.is_none() {
            *slot = Some(e);
        }
    }

    /// Rethrow the captured failure, if any.
    pub fn check(&self) -> Result<()> {
        match self.error.lock().expect("push state lock").as_ref() {
            Some(e) => Err(replicate_error(e)),
            None => Ok(()),
        }
    }

    /// Whether a failure was captured.
    pub fn has_error(&self) -> bool {
        self.error.lock().expect("push state lock").is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClientConfig {
        ClientConfig {
            in_flight_limit_timeout_ms: 300,
            in_flight_sleep_delta_ms: 10,
            push_data_timeout_ms: 10_000,
            ..ClientConfig::default()
        }
    }

    #[tokio::test]
    async fn guard_removes_entry_on_drop() {
        let state = PushState::new(&config());
        let tracker = Arc::clone(&state.tracker);

        let guard = tracker.track("w1:9001", tracker.next_batch_id());
        assert_eq!(tracker.in_flight("w1:9001"), 1);
        assert_eq!(tracker.total_in_flight(), 1);
        drop(guard);
        assert_eq!(tracker.in_flight("w1:9001"), 0);
        assert_eq!(tracker.total_in_flight(), 0);
    }

    #[tokio::test]
    async fn in_flight_cap_is_enforced_per_endpoint() {
        let state = PushState::new(&config());
        let tracker = Arc::clone(&state.tracker);

        let _g1 = tracker.track("w1:9001", 0);
        let _g2 = tracker.track("w1:9001", 1);
        let _g3 = tracker.track("w2:9001", 2);

        assert_eq!(tracker.in_flight("w1:9001"), 2);
        assert_eq!(tracker.in_flight("w2:9001"), 1);

        // Capacity available under the cap: returns immediately.
        assert!(!tracker.limit_max_in_flight("w1:9001", 2, &state).await.unwrap());
        // Over the cap with nothing draining: times out.
        assert!(tracker.limit_max_in_flight("w1:9001", 1, &state).await.unwrap());
    }

    #[tokio::test]
    async fn limit_zero_waits_for_drain() {
        let state = PushState::new(&config());
        let tracker = Arc::clone(&state.tracker);

        let guard = tracker.track("w1:9001", 0);
        let waiter = {
            let state = Arc::clone(&state);
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.limit_zero_in_flight(&state).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(guard);
        assert!(!waiter.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn expired_batches_are_pruned() {
        let mut cfg = config();
        cfg.push_data_timeout_ms = 10;
        let state = PushState::new(&cfg);
        let tracker = Arc::clone(&state.tracker);

        let guard = tracker.track("w1:9001", 0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(tracker.fail_expired(), 1);
        assert_eq!(tracker.total_in_flight(), 0);
        drop(guard);
    }

    #[tokio::test]
    async fn captured_error_is_rethrown_to_every_caller() {
        let state = PushState::new(&config());
        state.record_error(RssError::PushDataTimeout("w1 timed out".to_string()));
        state.record_error(RssError::StageEnd("late".to_string()));

        for _ in 0..2 {
            let err = state.check().unwrap_err();
            assert!(matches!(err, RssError::PushDataTimeout(_)));
        }
        let err = state
            .tracker
            .limit_zero_in_flight(&state)
            .await
            .unwrap_err();
        assert!(matches!(err, RssError::PushDataTimeout(_)));
    }
}
