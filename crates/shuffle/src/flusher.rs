//! Per-mount disk flushers.
//!
//! Each mount owns one flusher: a bounded work queue drained by a small set
//! of writer threads issuing sequential gathered writes. A flush that fails
//! latches the flusher stopped and reports the mount to the device monitor;
//! a flush that merely takes too long quarantines the mount with
//! `FlushTimeout` so subsequent submissions fail fast.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use rss_common::metrics::global_metrics;
use rss_common::{Result, RssError};

use crate::buffer::{BufferPool, CompositeBuffer};
use crate::device::{DeviceErrorKind, DeviceMonitor};

/// Completion tracking shared between one writer and its flush tasks.
///
/// The first error wins and is observable before every subsequent ack.
#[derive(Debug)]
pub struct FlushNotifier {
    pending: AtomicU32,
    flushed_bytes: AtomicU64,
    failed: AtomicBool,
    error: Mutex<Option<String>>,
    drained: Notify,
}

impl FlushNotifier {
    /// Fresh notifier with nothing in flight.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: AtomicU32::new(0),
            flushed_bytes: AtomicU64::new(0),
            failed: AtomicBool::new(false),
            error: Mutex::new(None),
            drained: Notify::new(),
        })
    }

    /// Account one scheduled flush.
    pub fn begin(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Account one completed flush of `bytes`.
    pub fn finish(&self, bytes: u64) {
        self.flushed_bytes.fetch_add(bytes, Ordering::AcqRel);
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Record a failure; the first message is kept.
    pub fn fail(&self, message: String) {
        {
            let mut slot = self.error.lock().expect("notifier error lock");
            if slot.is_none() {
                *slot = Some(message);
            }
        }
        self.failed.store(true, Ordering::Release);
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
        // Wake close() even when other tasks remain pending.
        self.drained.notify_waiters();
    }

    /// Record a failure without a matching `begin` (used when a device error
    /// aborts a writer between flushes).
    pub fn fail_external(&self, message: String) {
        {
            let mut slot = self.error.lock().expect("notifier error lock");
            if slot.is_none() {
                *slot = Some(message);
            }
        }
        self.failed.store(true, Ordering::Release);
        self.drained.notify_waiters();
    }

    /// Flush tasks still outstanding.
    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    /// Bytes confirmed on disk.
    pub fn flushed_bytes(&self) -> u64 {
        self.flushed_bytes.load(Ordering::Acquire)
    }

    /// First recorded error, if any.
    pub fn first_error(&self) -> Option<String> {
        if !self.failed.load(Ordering::Acquire) {
            return None;
        }
        self.error.lock().expect("notifier error lock").clone()
    }

    /// Wait until every scheduled flush finished or failed, bounded by
    /// `timeout`.
    pub async fn wait_drained(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.first_error() {
                return Err(RssError::PushDataWriteFailPrimary(message));
            }
            if self.pending() == 0 {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RssError::FlusherBackPressure(format!(
                    "flush drain timed out with {} tasks pending",
                    self.pending()
                )));
            }
            let _ = tokio::time::timeout(remaining, self.drained.notified()).await;
        }
    }
}

/// One unit of flusher work: gather a composite buffer into a file.
pub struct FlushTask {
    /// Buffer whose components are written sequentially.
    pub buffer: CompositeBuffer,
    /// Destination file, opened for append by the owning writer.
    pub file: Arc<File>,
    /// Completion tracking for the owning writer.
    pub notifier: Arc<FlushNotifier>,
}

enum FlushMessage {
    Task(FlushTask),
    Shutdown,
}

/// Per-mount flusher with bounded per-thread queues.
///
/// Every writer is pinned to one worker thread so its tasks execute in
/// submission order; a file never has two in-flight writes racing.
pub struct DiskFlusher {
    mount: PathBuf,
    senders: Vec<Sender<FlushMessage>>,
    next_worker: AtomicU32,
    stopped: Arc<AtomicBool>,
    submit_timeout: Duration,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl DiskFlusher {
    /// Start `threads` writer threads for one mount.
    pub fn new(
        mount: PathBuf,
        queue_capacity: usize,
        threads: usize,
        submit_timeout: Duration,
        slow_flush_threshold: Duration,
        pool: Arc<BufferPool>,
        device_monitor: Arc<DeviceMonitor>,
    ) -> Arc<Self> {
        let stopped = Arc::new(AtomicBool::new(false));
        let mut senders = Vec::with_capacity(threads.max(1));
        let mut handles = Vec::with_capacity(threads.max(1));
        for index in 0..threads.max(1) {
            let (sender, receiver) = bounded(queue_capacity.max(1));
            senders.push(sender);
            let receiver: Receiver<FlushMessage> = receiver;
            let pool = Arc::clone(&pool);
            let device_monitor = Arc::clone(&device_monitor);
            let stopped = Arc::clone(&stopped);
            let mount = mount.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("rss-flusher-{}-{}", mount.display(), index))
                    .spawn(move || {
                        flush_loop(
                            receiver,
                            pool,
                            device_monitor,
                            stopped,
                            mount,
                            slow_flush_threshold,
                        )
                    })
                    .expect("spawn flusher thread"),
            );
        }
        Arc::new(Self {
            mount,
            senders,
            next_worker: AtomicU32::new(0),
            stopped,
            submit_timeout,
            threads: Mutex::new(handles),
        })
    }

    /// Mount this flusher owns.
    pub fn mount(&self) -> &PathBuf {
        &self.mount
    }

    /// Whether the flusher latched a fatal error.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Pick a worker thread for a new writer, round robin.
    pub fn assign_worker(&self) -> usize {
        self.next_worker.fetch_add(1, Ordering::AcqRel) as usize % self.senders.len()
    }

    /// Enqueue one flush task on the given worker queue, polling until the
    /// submit timeout. The task's `begin` must already be accounted on its
    /// notifier; on rejection the task is handed back to the caller.
    pub async fn submit(
        &self,
        worker: usize,
        task: FlushTask,
    ) -> std::result::Result<(), (RssError, FlushTask)> {
        let sender = &self.senders[worker % self.senders.len()];
        let deadline = Instant::now() + self.submit_timeout;
        let mut task = task;
        loop {
            if self.is_stopped() {
                return Err((
                    RssError::FlusherBackPressure(format!(
                        "flusher stopped for mount {}",
                        self.mount.display()
                    )),
                    task,
                ));
            }
            match sender.try_send(FlushMessage::Task(task)) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(FlushMessage::Task(returned))) => {
                    task = returned;
                    if Instant::now() >= deadline {
                        return Err((
                            RssError::FlusherBackPressure(format!(
                                "flush queue full for mount {}",
                                self.mount.display()
                            )),
                            task,
                        ));
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                Err(TrySendError::Disconnected(FlushMessage::Task(returned))) => {
                    return Err((
                        RssError::FlusherBackPressure(format!(
                            "flusher shut down for mount {}",
                            self.mount.display()
                        )),
                        returned,
                    ));
                }
                Err(_) => unreachable!("only tasks are submitted"),
            }
        }
    }

    /// Stop accepting work and join the writer threads.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        let handles = {
            let mut guard = self.threads.lock().expect("flusher thread lock");
            for sender in &self.senders {
                let _ = sender.send(FlushMessage::Shutdown);
            }
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn flush_loop(
    receiver: Receiver<FlushMessage>,
    pool: Arc<BufferPool>,
    device_monitor: Arc<DeviceMonitor>,
    stopped: Arc<AtomicBool>,
    mount: PathBuf,
    slow_flush_threshold: Duration,
) {
    let mount_label = mount.display().to_string();
    while let Ok(message) = receiver.recv() {
        let task = match message {
            FlushMessage::Task(task) => task,
            FlushMessage::Shutdown => break,
        };
        if stopped.load(Ordering::Acquire) {
            task.notifier
                .fail(format!("flusher stopped for mount {mount_label}"));
            pool.release(task.buffer);
            continue;
        }

        let bytes = task.buffer.len() as u64;
        let started = Instant::now();
        let result = write_task(&task);
        let elapsed = started.elapsed();

        match result {
            Ok(()) => {
                global_metrics().record_flush(&mount_label, bytes, elapsed.as_secs_f64());
                debug!(mount = %mount_label, bytes, ?elapsed, "flushed buffer");
                task.notifier.finish(bytes);
                if elapsed > slow_flush_threshold {
                    warn!(mount = %mount_label, ?elapsed, "slow flush, quarantining mount");
                    stopped.store(true, Ordering::Release);
                    device_monitor.report_error(&mount, DeviceErrorKind::FlushTimeout);
                }
            }
            Err(e) => {
                global_metrics().record_flush_failure(&mount_label);
                error!(mount = %mount_label, error = %e, "flush failed, stopping flusher");
                stopped.store(true, Ordering::Release);
                task.notifier.fail(format!("flush failed: {e}"));
                let kind = if e.kind() == std::io::ErrorKind::StorageFull {
                    DeviceErrorKind::InsufficientDiskSpace
                } else {
                    DeviceErrorKind::ReadWriteFailure
                };
                device_monitor.report_error(&mount, kind);
            }
        }
        pool.release(task.buffer);
    }
}

fn write_task(task: &FlushTask) -> std::io::Result<()> {
    let mut file = &*task.file;
    task.buffer.write_to(&mut file)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rss_common::config::MemoryConfig;
    use rss_common::MemoryTracker;
    use std::io::Read;

    fn fixture(dir: &std::path::Path) -> (Arc<BufferPool>, Arc<DeviceMonitor>) {
        let tracker = MemoryTracker::new(MemoryConfig::default());
        let pool = BufferPool::new(4, 4, Duration::from_millis(100), tracker);
        let monitor = DeviceMonitor::new(&[dir.to_path_buf()], Duration::from_secs(3600));
        (pool, monitor)
    }

    #[tokio::test]
    async fn flush_writes_components_sequentially() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, monitor) = fixture(dir.path());
        let flusher = DiskFlusher::new(
            dir.path().to_path_buf(),
            16,
            1,
            Duration::from_millis(500),
            Duration::from_secs(60),
            Arc::clone(&pool),
            monitor,
        );

        let path = dir.path().join("data");
        let file = Arc::new(File::create(&path).unwrap());
        let notifier = FlushNotifier::new();
        let mut buffer = pool.acquire().await.unwrap();
        buffer.push(Bytes::from_static(b"hello "));
        buffer.push(Bytes::from_static(b"world"));

        notifier.begin();
        let worker = flusher.assign_worker();
        flusher
            .submit(worker, FlushTask {
                buffer,
                file,
                notifier: Arc::clone(&notifier),
            })
            .await
            .map_err(|(e, _)| e)
            .unwrap();
        notifier.wait_drained(Duration::from_secs(5)).await.unwrap();

        assert_eq!(notifier.flushed_bytes(), 11);
        let mut contents = String::new();
        File::open(&path)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "hello world");
        flusher.shutdown();
    }

    #[tokio::test]
    async fn stopped_flusher_rejects_fast() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, monitor) = fixture(dir.path());
        let flusher = DiskFlusher::new(
            dir.path().to_path_buf(),
            1,
            1,
            Duration::from_millis(50),
            Duration::from_secs(60),
            Arc::clone(&pool),
            monitor,
        );
        flusher.shutdown();

        let file = Arc::new(File::create(dir.path().join("data")).unwrap());
        let notifier = FlushNotifier::new();
        notifier.begin();
        let err = flusher
            .submit(0, FlushTask {
                buffer: pool.acquire().await.unwrap(),
                file,
                notifier,
            })
            .await
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err.0, RssError::FlusherBackPressure(_)));
    }

    #[tokio::test]
    async fn notifier_surfaces_first_error() {
        let notifier = FlushNotifier::new();
        notifier.begin();
        notifier.fail("disk gone".to_string());
        let err = notifier
            .wait_drained(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, RssError::PushDataWriteFailPrimary(_)));
        assert_eq!(notifier.first_error().unwrap(), "disk gone");
    }
}
