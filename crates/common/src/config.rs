use serde::{Deserialize, Serialize};

/// Behavior when a partition file grows past the split threshold.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PartitionSplitMode {
    /// The current epoch keeps accepting pushes until the control plane
    /// assigns a new epoch.
    Soft,
    /// The current epoch rejects further pushes immediately.
    Hard,
}

impl Default for PartitionSplitMode {
    fn default() -> Self {
        Self::Soft
    }
}

/// Storage-plane configuration shared by flushers, writers, and the worker
/// storage manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Mount points available for shuffle data.
    pub mounts: Vec<String>,
    /// In-memory buffer size that triggers a flush schedule.
    pub flush_buffer_size: usize,
    /// Target chunk size recorded in the chunk-offset index.
    pub chunk_size: u64,
    /// Partition file size that triggers a split request.
    pub split_threshold: u64,
    /// Soft or hard split behavior at the threshold.
    #[serde(default)]
    pub split_mode: PartitionSplitMode,
    /// Bounded flusher work-queue capacity per mount.
    pub flusher_queue_capacity: usize,
    /// Writer threads per mount.
    pub flusher_threads: usize,
    /// Timeout for submitting one flush task before back-pressure.
    pub flush_submit_timeout_ms: u64,
    /// Timeout for draining pending flushes on writer close.
    pub flush_drain_timeout_ms: u64,
    /// Flush duration past which the mount is quarantined.
    pub slow_flush_threshold_ms: u64,
    /// Device monitor probe interval.
    pub device_probe_interval_ms: u64,
    /// Disk usage ratio that soft-isolates a mount.
    pub high_disk_usage_ratio: f64,
    /// Number of reusable composite buffers in the pool.
    pub buffer_pool_capacity: usize,
    /// Slab size used when gathering pushed bodies into a composite buffer.
    pub buffer_slab_size: usize,
    /// Timeout for acquiring a pool buffer.
    pub buffer_acquire_timeout_ms: u64,
    /// Age after which finalized shuffle directories are deleted.
    pub shuffle_ttl_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mounts: vec!["/tmp/rss".to_string()],
            flush_buffer_size: 256 * 1024,
            chunk_size: 8 * 1024 * 1024,
            split_threshold: 1024 * 1024 * 1024,
            split_mode: PartitionSplitMode::default(),
            flusher_queue_capacity: 1024,
            flusher_threads: 2,
            flush_submit_timeout_ms: 5_000,
            flush_drain_timeout_ms: 120_000,
            slow_flush_threshold_ms: 30_000,
            device_probe_interval_ms: 60_000,
            high_disk_usage_ratio: 0.95,
            buffer_pool_capacity: 512,
            buffer_slab_size: 64 * 1024,
            buffer_acquire_timeout_ms: 10_000,
            shuffle_ttl_ms: 24 * 3600 * 1000,
        }
    }
}

/// Direct-memory tracker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Maximum direct memory the tracker budgets against.
    pub max_direct_memory: usize,
    /// Ratio above which new pushes are refused.
    pub pause_push_ratio: f64,
    /// Ratio above which replication forking also stops.
    pub pause_replicate_ratio: f64,
    /// Ratio below which a paused worker resumes.
    pub resume_ratio: f64,
    /// Timer interval for re-evaluating thresholds.
    pub check_interval_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_direct_memory: 1024 * 1024 * 1024,
            pause_push_ratio: 0.85,
            pause_replicate_ratio: 0.95,
            resume_ratio: 0.7,
            check_interval_ms: 10,
        }
    }
}

/// Congestion controller watermarks and rate caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CongestionConfig {
    /// Sliding-window length for produce/consume rate sampling, in seconds.
    pub sample_window_secs: u64,
    /// Pending bytes above which the worker enters the congested state.
    pub high_watermark: u64,
    /// Pending bytes below which the congested state clears.
    pub low_watermark: u64,
    /// Per-user produce rate (bytes/s) above which the user is congested.
    pub user_inflow_high: u64,
    /// Per-user produce rate below which a capped user recovers.
    pub user_inflow_low: u64,
    /// Worker-wide produce rate cap in bytes/s.
    pub worker_inflow_high: u64,
    /// Worker-wide produce rate below which the worker cap clears.
    pub worker_inflow_low: u64,
    /// Idle time after which a user's window is evicted.
    pub user_inactive_ms: u64,
    /// Interval between congestion checks.
    pub check_interval_ms: u64,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            sample_window_secs: 10,
            high_watermark: 6 * 1024 * 1024 * 1024,
            low_watermark: 4 * 1024 * 1024 * 1024,
            user_inflow_high: u64::MAX,
            user_inflow_low: u64::MAX,
            worker_inflow_high: u64::MAX,
            worker_inflow_low: u64::MAX,
            user_inactive_ms: 10 * 60 * 1000,
            check_interval_ms: 1_000,
        }
    }
}

/// Producer/consumer client tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Number of pre-allocated push task slots per map task.
    pub push_queue_capacity: usize,
    /// Maximum payload carried by one push task.
    pub push_buffer_max_size: usize,
    /// In-flight request cap per destination worker.
    pub max_in_flight_per_worker: usize,
    /// Age past which an in-flight batch is failed with a timeout.
    pub push_data_timeout_ms: u64,
    /// Total time to wait for in-flight counts to fall under their limit.
    pub in_flight_limit_timeout_ms: u64,
    /// Poll interval while waiting on in-flight limits.
    pub in_flight_sleep_delta_ms: u64,
    /// Sleep when no working-queue task has destination capacity.
    pub take_task_wait_ms: u64,
    /// Retries for one batch before the push fails hard.
    pub push_max_retries: u32,
    /// Fetch retries per replica before a read fails.
    pub fetch_max_retries_per_replica: u32,
    /// Sleep between fetch retries against the same location pair.
    pub retry_wait_ms: u64,
    /// Expiry for entries in the fetch-excluded worker set.
    pub fetch_excluded_expire_ms: u64,
    /// Credits granted when opening a chunk stream.
    pub fetch_initial_credit: u32,
    /// Whether pushes replicate to a peer location.
    pub replicate_enabled: bool,
    /// Whether end-to-end commit metadata verification runs on close.
    pub integrity_check_enabled: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            push_queue_capacity: 512,
            push_buffer_max_size: 64 * 1024,
            max_in_flight_per_worker: 32,
            push_data_timeout_ms: 120_000,
            in_flight_limit_timeout_ms: 240_000,
            in_flight_sleep_delta_ms: 50,
            take_task_wait_ms: 50,
            push_max_retries: 3,
            fetch_max_retries_per_replica: 3,
            retry_wait_ms: 500,
            fetch_excluded_expire_ms: 30_000,
            fetch_initial_credit: 8,
            replicate_enabled: true,
            integrity_check_enabled: true,
        }
    }
}
