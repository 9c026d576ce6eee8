//! Worker runtime.
//!
//! Assembles the data-plane services (registry, storage manager, congestion
//! controller, memory tracker, push handler, chunk streams), spawns the
//! background loops, and exposes the control operations the lifecycle
//! manager drives: reserve partitions, stage end, unregister, graceful
//! shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use rss_common::config::{CongestionConfig, MemoryConfig, StorageConfig};
use rss_common::protocol::PartitionLocation;
use rss_common::{MemoryTracker, Result, RssError, ShuffleKey};
use rss_shuffle::device::DeviceMonitor;

use crate::congestion::CongestionController;
use crate::fetch::{ChunkStreamRegistry, StreamHandle};
use crate::handler::{PushHandler, ReplicateForwarder};
use crate::registry::PartitionRegistry;
use crate::storage::{FinalizedFile, StorageManager};

/// Worker resource and endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Stable worker id used in logs.
    pub worker_id: String,
    /// Storage-plane tunables.
    pub storage: StorageConfig,
    /// Direct-memory thresholds.
    pub memory: MemoryConfig,
    /// Congestion watermarks and caps.
    pub congestion: CongestionConfig,
    /// Retries when forking a push to the replica.
    pub replicate_retries: u32,
    /// Credit-wait timeout before an idle chunk stream is released.
    pub fetch_stream_idle_timeout_ms: u64,
    /// Interval of the expired-shuffle cleaner.
    pub cleaner_interval_ms: u64,
    /// Bound on draining partitions during graceful shutdown.
    pub shutdown_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-1".to_string(),
            storage: StorageConfig::default(),
            memory: MemoryConfig::default(),
            congestion: CongestionConfig::default(),
            replicate_retries: 2,
            fetch_stream_idle_timeout_ms: 60_000,
            cleaner_interval_ms: 60_000,
            shutdown_timeout_ms: 30_000,
        }
    }
}

/// One worker process's data plane.
pub struct Worker {
    config: WorkerConfig,
    registry: Arc<PartitionRegistry>,
    storage: Arc<StorageManager>,
    congestion: Arc<CongestionController>,
    tracker: Arc<MemoryTracker>,
    handler: Arc<PushHandler>,
    streams: Arc<ChunkStreamRegistry>,
    device_monitor: Arc<DeviceMonitor>,
    shutting_down: AtomicBool,
}

impl Worker {
    /// Build the worker and wire its subsystems together. Background loops
    /// are started separately by [`spawn_background`](Self::spawn_background).
    pub fn new(config: WorkerConfig, forwarder: Option<Arc<dyn ReplicateForwarder>>) -> Arc<Self> {
        let tracker = MemoryTracker::new(config.memory.clone());
        let mounts: Vec<std::path::PathBuf> =
            config.storage.mounts.iter().map(Into::into).collect();
        let device_monitor = DeviceMonitor::new(
            &mounts,
            Duration::from_millis(config.storage.device_probe_interval_ms),
        );
        let storage = StorageManager::new(
            config.storage.clone(),
            Arc::clone(&tracker),
            Arc::clone(&device_monitor),
        );
        let congestion = CongestionController::new(
            config.congestion.clone(),
            Arc::clone(&tracker) as Arc<dyn crate::congestion::PendingBytes>,
        );
        let registry = Arc::new(PartitionRegistry::new());
        let handler = PushHandler::new(
            Arc::clone(&registry),
            Arc::clone(&storage),
            Arc::clone(&congestion),
            Arc::clone(&tracker),
            forwarder,
            config.replicate_retries,
        );
        let streams =
            ChunkStreamRegistry::new(Duration::from_millis(config.fetch_stream_idle_timeout_ms));

        Arc::new(Self {
            config,
            registry,
            storage,
            congestion,
            tracker,
            handler,
            streams,
            device_monitor,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Start the periodic loops: memory sampler, congestion ticks, device
    /// probes, memory-pressure drain, shuffle cleaner.
    pub fn spawn_background(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            self.tracker.spawn_sampler(),
            self.congestion.spawn(),
            self.device_monitor.spawn(),
            self.storage.spawn_memory_pressure_listener(),
            self.storage
                .spawn_cleaner(Duration::from_millis(self.config.cleaner_interval_ms)),
        ]
    }

    /// Worker id for logs.
    pub fn id(&self) -> &str {
        &self.config.worker_id
    }

    /// Push decision pipeline.
    pub fn handler(&self) -> &Arc<PushHandler> {
        &self.handler
    }

    /// Partition registry.
    pub fn registry(&self) -> &Arc<PartitionRegistry> {
        &self.registry
    }

    /// Storage manager.
    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    /// Congestion controller.
    pub fn congestion(&self) -> &Arc<CongestionController> {
        &self.congestion
    }

    /// Memory tracker.
    pub fn tracker(&self) -> &Arc<MemoryTracker> {
        &self.tracker
    }

    /// Chunk stream registry.
    pub fn streams(&self) -> &Arc<ChunkStreamRegistry> {
        &self.streams
    }

    /// Whether graceful shutdown started; new control operations are
    /// refused once set.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Register partition locations this worker serves.
    pub fn reserve_partitions(
        &self,
        key: &ShuffleKey,
        locations: Vec<PartitionLocation>,
    ) -> Result<()> {
        if self.is_shutting_down() {
            return Err(RssError::WorkerBusy("worker is shutting down".to_string()));
        }
        info!(worker = %self.config.worker_id, %key, count = locations.len(), "reserving partitions");
        self.registry.reserve(key, locations);
        Ok(())
    }

    /// Finalize a shuffle: close writers, publish chunk indexes, mark the
    /// registry so later pushes get `STAGE_END`.
    pub async fn stage_end(&self, key: &ShuffleKey) -> Result<Vec<(String, Vec<u64>)>> {
        self.registry.mark_stage_end(key);
        self.storage.stage_end(key).await
    }

    /// Drop one shuffle's registry entries, writers, and files.
    pub async fn unregister_shuffle(&self, key: &ShuffleKey) -> Result<()> {
        self.registry.unregister(key);
        self.storage.unregister_shuffle(key).await
    }

    /// Open a chunk stream over a finalized file.
    pub async fn open_stream(
        &self,
        key: &ShuffleKey,
        file_name: &str,
        start_map: u32,
        end_map: u32,
        initial_credit: u32,
    ) -> Result<Arc<StreamHandle>> {
        let file: FinalizedFile = self.storage.open_finalized(key, file_name).await?;
        self.streams
            .open_stream(key.to_string(), &file, start_map, end_map, initial_credit)
    }

    /// Graceful shutdown: stop accepting work, then wait for registered
    /// partitions to drain or for the shutdown timeout.
    pub async fn graceful_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let deadline = Instant::now() + Duration::from_millis(self.config.shutdown_timeout_ms);
        while self.registry.registered_partitions() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let remaining = self.registry.registered_partitions();
        if remaining > 0 {
            warn!(remaining, "shutdown timeout reached with partitions still registered");
        }
        self.storage.shutdown().await;
        info!(worker = %self.config.worker_id, "worker shut down");
    }
}
