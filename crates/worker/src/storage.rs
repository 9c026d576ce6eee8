//! Worker storage manager.
//!
//! Owns the mounts, their flushers, the buffer pool, and every live
//! partition file writer. New writers land on a healthy mount chosen round
//! robin; device errors abort all writers on the failing mount; stage end
//! finalizes a shuffle's writers and records their chunk-offset indexes for
//! the fetch server. A cleaner deletes finalized shuffles past their TTL.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use roaring::RoaringBitmap;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use rss_common::config::StorageConfig;
use rss_common::metrics::global_metrics;
use rss_common::protocol::Role;
use rss_common::{MemoryTracker, Result, RssError, ShuffleKey};
use rss_shuffle::buffer::BufferPool;
use rss_shuffle::device::{DeviceErrorKind, DeviceMonitor, DeviceObserver};
use rss_shuffle::flusher::DiskFlusher;
use rss_shuffle::layout;
use rss_shuffle::writer::{PartitionFileWriter, WriterOptions};

type WriterKey = (ShuffleKey, u32, u32, Role);

/// A finalized partition file ready to serve chunk fetches.
#[derive(Debug, Clone)]
pub struct FinalizedFile {
    /// Absolute path of the append-only file.
    pub path: PathBuf,
    /// Chunk-offset index captured at close.
    pub chunk_offsets: Vec<u64>,
    /// Map ids present in the file, for range-read filtering.
    pub map_ids: RoaringBitmap,
    /// When the file was finalized, for TTL cleanup.
    pub finalized_at: Instant,
}

struct WriterEntry {
    writer: Arc<PartitionFileWriter>,
    mount: PathBuf,
}

/// Mount/flusher/writer owner for one worker process.
pub struct StorageManager {
    config: StorageConfig,
    mounts: Vec<PathBuf>,
    flushers: HashMap<PathBuf, Arc<DiskFlusher>>,
    pool: Arc<BufferPool>,
    tracker: Arc<MemoryTracker>,
    device_monitor: Arc<DeviceMonitor>,
    next_mount: AtomicUsize,
    writers: Mutex<HashMap<WriterKey, WriterEntry>>,
    finalized: Mutex<HashMap<ShuffleKey, HashMap<String, FinalizedFile>>>,
}

impl StorageManager {
    /// Build flushers for every configured mount and start the device
    /// observer bridge.
    pub fn new(
        config: StorageConfig,
        tracker: Arc<MemoryTracker>,
        device_monitor: Arc<DeviceMonitor>,
    ) -> Arc<Self> {
        let mounts: Vec<PathBuf> = config.mounts.iter().map(PathBuf::from).collect();
        let pool = BufferPool::new(
            config.buffer_pool_capacity,
            16,
            Duration::from_millis(config.buffer_acquire_timeout_ms),
            Arc::clone(&tracker),
        );
        let flushers = mounts
            .iter()
            .map(|mount| {
                let flusher = DiskFlusher::new(
                    mount.clone(),
                    config.flusher_queue_capacity,
                    config.flusher_threads,
                    Duration::from_millis(config.flush_submit_timeout_ms),
                    Duration::from_millis(config.slow_flush_threshold_ms),
                    Arc::clone(&pool),
                    Arc::clone(&device_monitor),
                );
                (mount.clone(), flusher)
            })
            .collect();

        let manager = Arc::new(Self {
            config,
            mounts,
            flushers,
            pool,
            tracker,
            device_monitor: Arc::clone(&device_monitor),
            next_mount: AtomicUsize::new(0),
            writers: Mutex::new(HashMap::new()),
            finalized: Mutex::new(HashMap::new()),
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        device_monitor.register_observer(Arc::new(DeviceEventBridge { events: events_tx }));
        manager.spawn_device_event_task(events_rx);
        manager
    }

    /// Buffer pool shared by every writer.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Look up or create the writer for one partition incarnation.
    pub async fn get_or_create_writer(
        &self,
        key: &ShuffleKey,
        partition_id: u32,
        epoch: u32,
        role: Role,
    ) -> Result<Arc<PartitionFileWriter>> {
        let writer_key = (key.clone(), partition_id, epoch, role);
        let mut writers = self.writers.lock().await;
        if let Some(entry) = writers.get(&writer_key) {
            return Ok(Arc::clone(&entry.writer));
        }

        let mount = self.pick_mount()?;
        let path = layout::partition_file_path(&mount, key, partition_id, epoch, role);
        let flusher = self
            .flushers
            .get(&mount)
            .ok_or_else(|| RssError::WorkerBusy(format!("no flusher for {}", mount.display())))?;
        let writer = PartitionFileWriter::create(
            path,
            Arc::clone(flusher),
            Arc::clone(&self.pool),
            Arc::clone(&self.tracker),
            WriterOptions {
                flush_buffer_size: self.config.flush_buffer_size,
                chunk_size: self.config.chunk_size,
                split_threshold: self.config.split_threshold,
                split_mode: self.config.split_mode,
                flush_drain_timeout: Duration::from_millis(self.config.flush_drain_timeout_ms),
            },
        )?;
        writers.insert(
            writer_key,
            WriterEntry {
                writer: Arc::clone(&writer),
                mount,
            },
        );
        global_metrics().set_active_writers(writers.len() as u64);
        Ok(writer)
    }

    /// Number of live writers.
    pub async fn active_writers(&self) -> usize {
        self.writers.lock().await.len()
    }

    /// Close every writer of the shuffle and record the finalized files.
    /// Returns `(file_name, chunk_offsets)` for each committed file.
    pub async fn stage_end(&self, key: &ShuffleKey) -> Result<Vec<(String, Vec<u64>)>> {
        let drained: Vec<(WriterKey, WriterEntry)> = {
            let mut writers = self.writers.lock().await;
            let keys: Vec<WriterKey> = writers
                .keys()
                .filter(|(k, _, _, _)| k == key)
                .cloned()
                .collect();
            let drained = keys
                .into_iter()
                .filter_map(|k| writers.remove_entry(&k))
                .collect();
            global_metrics().set_active_writers(writers.len() as u64);
            drained
        };

        let mut committed = Vec::with_capacity(drained.len());
        let mut finalized = self.finalized.lock().await;
        let files = finalized.entry(key.clone()).or_default();
        for ((_, partition_id, epoch, role), entry) in drained {
            let offsets = entry.writer.close().await?;
            let map_ids = entry.writer.map_id_bitmap().await;
            let file_name = layout::partition_file_name(partition_id, epoch, role);
            files.insert(
                file_name.clone(),
                FinalizedFile {
                    path: entry.writer.path().to_path_buf(),
                    chunk_offsets: offsets.clone(),
                    map_ids,
                    finalized_at: Instant::now(),
                },
            );
            committed.push((file_name, offsets));
        }
        info!(%key, files = committed.len(), "stage end committed files");
        Ok(committed)
    }

    /// Resolve a finalized file for the fetch server.
    pub async fn open_finalized(&self, key: &ShuffleKey, file_name: &str) -> Result<FinalizedFile> {
        self.finalized
            .lock()
            .await
            .get(key)
            .and_then(|files| files.get(file_name))
            .cloned()
            .ok_or_else(|| {
                RssError::FetchFail(format!("no finalized file {file_name} for shuffle {key}"))
            })
    }

    /// Drop one shuffle entirely: abort live writers, forget finalized
    /// files, and delete its directories on every mount.
    pub async fn unregister_shuffle(&self, key: &ShuffleKey) -> Result<()> {
        let drained: Vec<WriterEntry> = {
            let mut writers = self.writers.lock().await;
            let keys: Vec<WriterKey> = writers
                .keys()
                .filter(|(k, _, _, _)| k == key)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|k| writers.remove(&k))
                .collect()
        };
        for entry in drained {
            entry.writer.abort("shuffle unregistered".to_string()).await;
        }
        self.finalized.lock().await.remove(key);

        for mount in &self.mounts {
            let dir = layout::shuffle_dir(mount, key);
            if dir.exists() {
                tokio::task::spawn_blocking(move || std::fs::remove_dir_all(dir))
                    .await
                    .map_err(|e| RssError::Io(std::io::Error::other(e)))??;
            }
        }
        info!(%key, "shuffle unregistered");
        Ok(())
    }

    /// Delete finalized shuffles older than the configured TTL. Returns the
    /// keys removed.
    pub async fn cleanup_expired(&self) -> Result<Vec<ShuffleKey>> {
        let ttl = Duration::from_millis(self.config.shuffle_ttl_ms);
        let expired: Vec<ShuffleKey> = {
            let finalized = self.finalized.lock().await;
            finalized
                .iter()
                .filter(|(_, files)| {
                    !files.is_empty()
                        && files.values().all(|f| f.finalized_at.elapsed() > ttl)
                })
                .map(|(key, _)| key.clone())
                .collect()
        };
        for key in &expired {
            self.unregister_shuffle(key).await?;
        }
        Ok(expired)
    }

    /// Watch the memory tracker and force writers to drain on pressure.
    pub fn spawn_memory_pressure_listener(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut rx = manager.tracker.watch();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = *rx.borrow();
                if state.admits_push() {
                    continue;
                }
                let writers: Vec<Arc<PartitionFileWriter>> = {
                    let guard = manager.writers.lock().await;
                    guard.values().map(|e| Arc::clone(&e.writer)).collect()
                };
                info!(count = writers.len(), "memory pressure: draining writer buffers");
                for writer in writers {
                    if let Err(e) = writer.flush_on_memory_pressure().await {
                        warn!(error = %e, "pressure flush failed");
                    }
                }
            }
        })
    }

    /// Spawn the periodic TTL cleaner.
    pub fn spawn_cleaner(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                match manager.cleanup_expired().await {
                    Ok(removed) if !removed.is_empty() => {
                        info!(count = removed.len(), "cleaned expired shuffles")
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "shuffle cleanup failed"),
                }
            }
        })
    }

    fn pick_mount(&self) -> Result<PathBuf> {
        let count = self.mounts.len();
        for _ in 0..count {
            let index = self.next_mount.fetch_add(1, Ordering::AcqRel) % count;
            let mount = &self.mounts[index];
            if self.device_monitor.accepts_new_writers(mount) {
                return Ok(mount.clone());
            }
        }
        Err(RssError::WorkerBusy(
            "no healthy mount accepts new writers".to_string(),
        ))
    }

    fn spawn_device_event_task(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<DeviceEvent>,
    ) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    DeviceEvent::Error { mount, kind } => {
                        manager.abort_writers_on_mount(&mount, kind).await;
                        global_metrics()
                            .set_isolated_mounts(manager.device_monitor.isolated_count() as u64);
                    }
                    DeviceEvent::Healthy { mount } => {
                        info!(mount = %mount.display(), "mount re-admitted for new writers");
                        global_metrics()
                            .set_isolated_mounts(manager.device_monitor.isolated_count() as u64);
                    }
                }
            }
        });
    }

    async fn abort_writers_on_mount(&self, mount: &Path, kind: DeviceErrorKind) {
        let victims: Vec<Arc<PartitionFileWriter>> = {
            let writers = self.writers.lock().await;
            writers
                .values()
                .filter(|e| e.mount == mount)
                .map(|e| Arc::clone(&e.writer))
                .collect()
        };
        if victims.is_empty() {
            return;
        }
        warn!(
            mount = %mount.display(),
            ?kind,
            count = victims.len(),
            "aborting writers on failed mount"
        );
        for writer in victims {
            writer
                .abort(format!("mount {} failed: {:?}", mount.display(), kind))
                .await;
        }
    }

    /// Stop flushers and drop writers; used by graceful shutdown.
    pub async fn shutdown(&self) {
        let drained: Vec<WriterEntry> = {
            let mut writers = self.writers.lock().await;
            writers.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            let _ = entry.writer.close().await;
        }
        for flusher in self.flushers.values() {
            flusher.shutdown();
        }
    }
}

enum DeviceEvent {
    Error { mount: PathBuf, kind: DeviceErrorKind },
    Healthy { mount: PathBuf },
}

/// Forwards device callbacks from flusher threads onto the async side.
struct DeviceEventBridge {
    events: mpsc::UnboundedSender<DeviceEvent>,
}

impl DeviceObserver for DeviceEventBridge {
    fn on_error(&self, mount: &Path, kind: DeviceErrorKind) {
        let _ = self.events.send(DeviceEvent::Error {
            mount: mount.to_path_buf(),
            kind,
        });
    }

    fn on_healthy(&self, mount: &Path) {
        let _ = self.events.send(DeviceEvent::Healthy {
            mount: mount.to_path_buf(),
        });
    }
}
