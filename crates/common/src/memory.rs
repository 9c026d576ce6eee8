//! Process-wide direct-memory accounting.
//!
//! The tracker aggregates three counters (network buffers, disk buffers in
//! flight, sort memory) against one budget and publishes edge-triggered
//! pause/resume transitions through a watch channel. Listeners react to a
//! transition by draining buffered data; spurious wakeups are safe because
//! every consumer re-reads the current state before acting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::MemoryConfig;

/// Worker-wide admission state derived from direct-memory usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryState {
    /// Usage under all thresholds.
    Normal,
    /// Usage passed the pause-push ratio: refuse new pushes.
    PausePush,
    /// Usage passed the pause-replicate ratio: also stop forking to replicas.
    PauseReplicate,
}

impl MemoryState {
    /// Whether new producer pushes are admitted in this state.
    pub fn admits_push(self) -> bool {
        matches!(self, MemoryState::Normal)
    }

    /// Whether replication forking is admitted in this state.
    pub fn admits_replicate(self) -> bool {
        !matches!(self, MemoryState::PauseReplicate)
    }
}

/// Process-wide gauge of direct-memory usage.
#[derive(Debug)]
pub struct MemoryTracker {
    config: MemoryConfig,
    network_bytes: AtomicUsize,
    disk_buffer_bytes: AtomicUsize,
    sort_bytes: AtomicUsize,
    state_tx: watch::Sender<MemoryState>,
}

impl MemoryTracker {
    /// Build a tracker with the given thresholds.
    pub fn new(config: MemoryConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(MemoryState::Normal);
        Arc::new(Self {
            config,
            network_bytes: AtomicUsize::new(0),
            disk_buffer_bytes: AtomicUsize::new(0),
            sort_bytes: AtomicUsize::new(0),
            state_tx,
        })
    }

    /// Subscribe to edge-triggered state transitions.
    pub fn watch(&self) -> watch::Receiver<MemoryState> {
        self.state_tx.subscribe()
    }

    /// Current admission state.
    pub fn current_state(&self) -> MemoryState {
        *self.state_tx.borrow()
    }

    /// Total tracked bytes across all counters.
    pub fn total_used(&self) -> usize {
        self.network_bytes.load(Ordering::Acquire)
            + self.disk_buffer_bytes.load(Ordering::Acquire)
            + self.sort_bytes.load(Ordering::Acquire)
    }

    /// Bytes buffered but not yet flushed to disk, consumed by the
    /// congestion controller as its pending-bytes input.
    pub fn pending_flush_bytes(&self) -> u64 {
        self.disk_buffer_bytes.load(Ordering::Acquire) as u64
    }

    /// Account bytes received from the network.
    pub fn reserve_network(&self, bytes: usize) {
        self.network_bytes.fetch_add(bytes, Ordering::AcqRel);
        self.evaluate();
    }

    /// Credit bytes released back by the network layer.
    pub fn release_network(&self, bytes: usize) {
        saturating_sub(&self.network_bytes, bytes);
        self.evaluate();
    }

    /// Account bytes entering a writer buffer awaiting flush.
    pub fn reserve_disk_buffer(&self, bytes: usize) {
        self.disk_buffer_bytes.fetch_add(bytes, Ordering::AcqRel);
        self.evaluate();
    }

    /// Credit bytes whose flush completed or whose buffer was released.
    pub fn release_disk_buffer(&self, bytes: usize) {
        saturating_sub(&self.disk_buffer_bytes, bytes);
        self.evaluate();
    }

    /// Account sort/merge working memory.
    pub fn reserve_sort(&self, bytes: usize) {
        self.sort_bytes.fetch_add(bytes, Ordering::AcqRel);
        self.evaluate();
    }

    /// Credit sort/merge working memory.
    pub fn release_sort(&self, bytes: usize) {
        saturating_sub(&self.sort_bytes, bytes);
        self.evaluate();
    }

    /// Re-evaluate thresholds and publish a transition if the state changed.
    ///
    /// Called on every accounting change; also run on a timer so a state
    /// change is never missed when accounting happens on a foreign thread.
    pub fn evaluate(&self) {
        let used = self.total_used() as f64;
        let max = self.config.max_direct_memory.max(1) as f64;
        let ratio = used / max;
        let current = self.current_state();

        let next = match current {
            MemoryState::Normal => {
                if ratio > self.config.pause_replicate_ratio {
                    MemoryState::PauseReplicate
                } else if ratio > self.config.pause_push_ratio {
                    MemoryState::PausePush
                } else {
                    MemoryState::Normal
                }
            }
            MemoryState::PausePush | MemoryState::PauseReplicate => {
                if ratio > self.config.pause_replicate_ratio {
                    MemoryState::PauseReplicate
                } else if ratio < self.config.resume_ratio {
                    MemoryState::Normal
                } else if ratio > self.config.pause_push_ratio {
                    MemoryState::PausePush
                } else {
                    current
                }
            }
        };

        if next != current {
            match next {
                MemoryState::Normal => debug!(ratio, "memory pressure resumed"),
                MemoryState::PausePush => warn!(ratio, "pausing pushes under memory pressure"),
                MemoryState::PauseReplicate => {
                    warn!(ratio, "pausing pushes and replication under memory pressure")
                }
            }
            self.state_tx.send_replace(next);
        }
    }

    /// Spawn the periodic threshold re-evaluation tick.
    pub fn spawn_sampler(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let tracker = Arc::clone(self);
        let interval = std::time::Duration::from_millis(tracker.config.check_interval_ms.max(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                tracker.evaluate();
            }
        })
    }
}

fn saturating_sub(counter: &AtomicUsize, bytes: usize) {
    let mut current = counter.load(Ordering::Acquire);
    loop {
        let next = current.saturating_sub(bytes);
        match counter.compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max: usize) -> MemoryConfig {
        MemoryConfig {
            max_direct_memory: max,
            pause_push_ratio: 0.8,
            pause_replicate_ratio: 0.9,
            resume_ratio: 0.5,
            check_interval_ms: 1000,
        }
    }

    #[test]
    fn transitions_are_edge_triggered() {
        let tracker = MemoryTracker::new(config(1000));
        let mut rx = tracker.watch();
        assert_eq!(tracker.current_state(), MemoryState::Normal);

        tracker.reserve_disk_buffer(850);
        assert_eq!(tracker.current_state(), MemoryState::PausePush);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), MemoryState::PausePush);

        tracker.reserve_disk_buffer(100);
        assert_eq!(tracker.current_state(), MemoryState::PauseReplicate);

        tracker.release_disk_buffer(700);
        assert_eq!(tracker.current_state(), MemoryState::Normal);
        assert!(tracker.current_state().admits_push());
    }

    #[test]
    fn paused_state_holds_until_resume_ratio() {
        let tracker = MemoryTracker::new(config(1000));
        tracker.reserve_sort(850);
        assert_eq!(tracker.current_state(), MemoryState::PausePush);

        // Between resume and pause ratios the pause latches.
        tracker.release_sort(200);
        assert_eq!(tracker.current_state(), MemoryState::PausePush);

        tracker.release_sort(200);
        assert_eq!(tracker.current_state(), MemoryState::Normal);
    }

    #[test]
    fn release_never_underflows() {
        let tracker = MemoryTracker::new(config(1000));
        tracker.release_network(100);
        assert_eq!(tracker.total_used(), 0);
    }
}
