//! Per-user congestion control.
//!
//! A sliding window of per-second buckets tracks produce rates for each user
//! and for the worker as a whole. When pending bytes cross the high
//! watermark the worker enters the congested state and flags every user
//! producing at or above the average rate; the state clears once pending
//! bytes fall under the low watermark. Independently of the watermarks, hard
//! per-user and per-worker rate caps congest heavy producers with
//! high/low-threshold hysteresis.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use rss_common::config::CongestionConfig;
use rss_common::metrics::global_metrics;
use rss_common::UserIdentifier;

/// Source of the worker's pending (buffered, unflushed) byte count.
pub trait PendingBytes: Send + Sync {
    /// Bytes buffered in memory awaiting flush.
    fn total_pending_bytes(&self) -> u64;
}

impl PendingBytes for rss_common::MemoryTracker {
    fn total_pending_bytes(&self) -> u64 {
        self.pending_flush_bytes()
    }
}

/// Sliding-window accumulator of bytes per second.
#[derive(Debug)]
pub struct BufferStatusWindow {
    window: Duration,
    epoch: Instant,
    buckets: Mutex<VecDeque<(u64, u64)>>,
}

impl BufferStatusWindow {
    /// Window spanning `window_secs` one-second buckets.
    pub fn new(window_secs: u64) -> Self {
        Self {
            window: Duration::from_secs(window_secs.max(1)),
            epoch: Instant::now(),
            buckets: Mutex::new(VecDeque::new()),
        }
    }

    fn now_sec(&self) -> u64 {
        self.epoch.elapsed().as_secs()
    }

    /// Fold `bytes` into the current second.
    pub fn add(&self, bytes: u64) {
        let sec = self.now_sec();
        let mut buckets = self.buckets.lock().expect("window lock");
        match buckets.back_mut() {
            Some((bucket_sec, total)) if *bucket_sec == sec => *total += bytes,
            _ => buckets.push_back((sec, bytes)),
        }
        self.prune(&mut buckets, sec);
    }

    /// Total bytes inside the window.
    pub fn sum(&self) -> u64 {
        let sec = self.now_sec();
        let mut buckets = self.buckets.lock().expect("window lock");
        self.prune(&mut buckets, sec);
        buckets.iter().map(|(_, b)| b).sum()
    }

    /// Average produce rate over the seconds the window actually spans.
    pub fn bytes_per_sec(&self) -> u64 {
        let sec = self.now_sec();
        let mut buckets = self.buckets.lock().expect("window lock");
        self.prune(&mut buckets, sec);
        let Some((oldest, _)) = buckets.front() else {
            return 0;
        };
        let spanned = (sec - *oldest + 1).min(self.window.as_secs()).max(1);
        buckets.iter().map(|(_, b)| b).sum::<u64>() / spanned
    }

    fn prune(&self, buckets: &mut VecDeque<(u64, u64)>, now_sec: u64) {
        let horizon = now_sec.saturating_sub(self.window.as_secs().saturating_sub(1));
        while buckets.front().map(|(s, _)| *s < horizon).unwrap_or(false) {
            buckets.pop_front();
        }
    }
}

struct UserBufferInfo {
    window: BufferStatusWindow,
    last_active: Mutex<Instant>,
    quota_congested: AtomicBool,
}

/// Per-user producer-speed tracking and throttling decisions.
pub struct CongestionController {
    config: CongestionConfig,
    pending: Arc<dyn PendingBytes>,
    users: Mutex<HashMap<UserIdentifier, Arc<UserBufferInfo>>>,
    produced: BufferStatusWindow,
    consumed: BufferStatusWindow,
    watermark_congested: AtomicBool,
    worker_capped: AtomicBool,
    flagged: Mutex<HashSet<UserIdentifier>>,
}

impl CongestionController {
    /// Build a controller reading pending bytes from `pending`.
    pub fn new(config: CongestionConfig, pending: Arc<dyn PendingBytes>) -> Arc<Self> {
        let window = config.sample_window_secs;
        Arc::new(Self {
            config,
            pending,
            users: Mutex::new(HashMap::new()),
            produced: BufferStatusWindow::new(window),
            consumed: BufferStatusWindow::new(window),
            watermark_congested: AtomicBool::new(false),
            worker_capped: AtomicBool::new(false),
            flagged: Mutex::new(HashSet::new()),
        })
    }

    /// Record bytes produced by one user.
    pub fn produce_bytes(&self, user: &UserIdentifier, bytes: u64) {
        let info = self.user_info(user);
        info.window.add(bytes);
        *info.last_active.lock().expect("last active lock") = Instant::now();
        self.produced.add(bytes);
        global_metrics().set_user_produce_rate(&user.to_string(), info.window.bytes_per_sec());
    }

    /// Record bytes flushed to disk or shipped to readers.
    pub fn consume_bytes(&self, bytes: u64) {
        self.consumed.add(bytes);
    }

    /// Whether pushes for this user should currently be refused.
    pub fn is_user_congested(&self, user: &UserIdentifier) -> bool {
        let info = self.user_info(user);
        let rate = info.window.bytes_per_sec();

        // Hard per-user cap with hysteresis, independent of watermarks.
        if info.quota_congested.load(Ordering::Acquire) {
            if rate < self.config.user_inflow_low {
                info.quota_congested.store(false, Ordering::Release);
            } else {
                return true;
            }
        } else if rate > self.config.user_inflow_high {
            info.quota_congested.store(true, Ordering::Release);
            return true;
        }

        // Worker-wide cap: heavy users are congested while the worker total
        // stays over its inflow cap.
        if self.worker_capped.load(Ordering::Acquire) && self.above_average(rate) {
            return true;
        }

        // Watermark congestion: only users flagged at check time.
        if self.watermark_congested.load(Ordering::Acquire) {
            return self.flagged.lock().expect("flag lock").contains(user);
        }
        false
    }

    /// Run one congestion evaluation tick.
    pub fn check_congestion(&self) {
        let pending = self.pending.total_pending_bytes();
        let was_congested = self.watermark_congested.load(Ordering::Acquire);

        if was_congested && pending < self.config.low_watermark {
            info!(pending, "pending bytes under low watermark, clearing congestion");
            self.watermark_congested.store(false, Ordering::Release);
            self.flagged.lock().expect("flag lock").clear();
        } else if !was_congested && pending > self.config.high_watermark {
            info!(pending, "pending bytes over high watermark, entering congestion");
            self.watermark_congested.store(true, Ordering::Release);
        }

        if self.watermark_congested.load(Ordering::Acquire) {
            // Snapshot rates first; the flag set and the user map are never
            // locked together.
            let rates: Vec<(UserIdentifier, u64)> = {
                let users = self.users.lock().expect("user lock");
                users
                    .iter()
                    .map(|(user, info)| (user.clone(), info.window.bytes_per_sec()))
                    .collect()
            };
            let user_count = rates.len().max(1) as u64;
            let average = (self.produced.bytes_per_sec() / user_count).max(1);
            let mut flagged = self.flagged.lock().expect("flag lock");
            flagged.clear();
            for (user, rate) in rates {
                if rate >= average {
                    debug!(user = %user, rate, average, "flagging user over average produce rate");
                    flagged.insert(user);
                }
            }
            global_metrics().set_congested_users(flagged.len() as u64);
        } else {
            global_metrics().set_congested_users(0);
        }

        // Worker inflow cap with hysteresis.
        let worker_rate = self.produced.bytes_per_sec();
        if self.worker_capped.load(Ordering::Acquire) {
            if worker_rate < self.config.worker_inflow_low {
                self.worker_capped.store(false, Ordering::Release);
            }
        } else if worker_rate > self.config.worker_inflow_high {
            info!(worker_rate, "worker produce rate over inflow cap");
            self.worker_capped.store(true, Ordering::Release);
        }

        self.evict_inactive();
    }

    /// Drop windows for users idle past the inactive threshold.
    pub fn evict_inactive(&self) {
        let threshold = Duration::from_millis(self.config.user_inactive_ms);
        let expired: Vec<UserIdentifier> = {
            let users = self.users.lock().expect("user lock");
            users
                .iter()
                .filter(|(_, info)| {
                    info.last_active.lock().expect("last active lock").elapsed() > threshold
                })
                .map(|(user, _)| user.clone())
                .collect()
        };
        for user in expired {
            self.users.lock().expect("user lock").remove(&user);
            self.flagged.lock().expect("flag lock").remove(&user);
            global_metrics().remove_user_produce_rate(&user.to_string());
            debug!(user = %user, "evicted inactive user window");
        }
    }

    /// Number of users currently tracked.
    pub fn tracked_users(&self) -> usize {
        self.users.lock().expect("user lock").len()
    }

    /// Observed worker-wide consume rate, for diagnostics.
    pub fn consume_bytes_per_sec(&self) -> u64 {
        self.consumed.bytes_per_sec()
    }

    /// Spawn the periodic check tick.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let controller = Arc::clone(self);
        let interval = Duration::from_millis(controller.config.check_interval_ms.max(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                controller.check_congestion();
            }
        })
    }

    fn user_info(&self, user: &UserIdentifier) -> Arc<UserBufferInfo> {
        let mut users = self.users.lock().expect("user lock");
        Arc::clone(users.entry(user.clone()).or_insert_with(|| {
            Arc::new(UserBufferInfo {
                window: BufferStatusWindow::new(self.config.sample_window_secs),
                last_active: Mutex::new(Instant::now()),
                quota_congested: AtomicBool::new(false),
            })
        }))
    }

    /// Whether `rate` is at or above the average per-user produce rate.
    fn above_average(&self, rate: u64) -> bool {
        let users = self.users.lock().expect("user lock").len().max(1) as u64;
        let average = self.produced.bytes_per_sec() / users;
        rate >= average.max(1)
    }
}
