//! Per-partition append-only file writers.
//!
//! A writer owns its file exclusively. Pushed bodies accumulate in a pooled
//! composite buffer; once the buffer passes the flush threshold a task is
//! scheduled on the writer's pinned flusher thread and a fresh buffer is
//! taken. Chunk boundaries are sealed whenever appending a body would grow
//! the current chunk past the target size, so the chunk-offset index is
//! strictly increasing, starts at zero, and ends at the file length after
//! close.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use roaring::RoaringBitmap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use rss_common::config::PartitionSplitMode;
use rss_common::{MemoryTracker, Result, RssError};

use crate::buffer::{BufferPool, CompositeBuffer};
use crate::flusher::{DiskFlusher, FlushNotifier, FlushTask};

/// Writer lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// Accepting pushes.
    Accepting,
    /// Close requested; draining pending flushes.
    Closing,
    /// Finalized; chunk offsets are fixed.
    Closed,
    /// A flush or device failure killed the writer.
    Aborted,
}

/// Writer tunables taken from [`rss_common::StorageConfig`].
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Buffered bytes that trigger a flush schedule.
    pub flush_buffer_size: usize,
    /// Target chunk size for the offset index.
    pub chunk_size: u64,
    /// File size past which a split is requested.
    pub split_threshold: u64,
    /// Soft or hard split behavior.
    pub split_mode: PartitionSplitMode,
    /// Bound on draining pending flushes during close.
    pub flush_drain_timeout: Duration,
}

struct WriterInner {
    state: WriterState,
    buffer: Option<CompositeBuffer>,
    chunk_offsets: Vec<u64>,
    total_appended: u64,
    map_ids: RoaringBitmap,
    split_requested: bool,
}

/// Append log for one partition incarnation.
pub struct PartitionFileWriter {
    path: PathBuf,
    file: Arc<std::fs::File>,
    flusher: Arc<DiskFlusher>,
    flusher_worker: usize,
    pool: Arc<BufferPool>,
    tracker: Arc<MemoryTracker>,
    notifier: Arc<FlushNotifier>,
    options: WriterOptions,
    inner: Mutex<WriterInner>,
}

impl PartitionFileWriter {
    /// Create the partition file and its writer.
    pub fn create(
        path: PathBuf,
        flusher: Arc<DiskFlusher>,
        pool: Arc<BufferPool>,
        tracker: Arc<MemoryTracker>,
        options: WriterOptions,
    ) -> Result<Arc<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let flusher_worker = flusher.assign_worker();
        Ok(Arc::new(Self {
            path,
            file: Arc::new(file),
            flusher,
            flusher_worker,
            pool,
            tracker,
            notifier: FlushNotifier::new(),
            options,
            inner: Mutex::new(WriterInner {
                state: WriterState::Accepting,
                buffer: None,
                chunk_offsets: vec![0],
                total_appended: 0,
                map_ids: RoaringBitmap::new(),
                split_requested: false,
            }),
        }))
    }

    /// Path of the owned file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Completion tracking shared with the flusher.
    pub fn notifier(&self) -> &Arc<FlushNotifier> {
        &self.notifier
    }

    /// Bytes accepted so far (buffered plus flushed).
    pub async fn size(&self) -> u64 {
        self.inner.lock().await.total_appended
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> WriterState {
        self.inner.lock().await.state
    }

    /// Map ids observed in accepted batches, for range-read filtering.
    pub async fn map_id_bitmap(&self) -> RoaringBitmap {
        self.inner.lock().await.map_ids.clone()
    }

    /// Append one framed batch body.
    ///
    /// In hard split mode a writer past the split threshold rejects the
    /// write; in soft mode it keeps accepting while
    /// [`split_if_needed`](Self::split_if_needed) reports the request.
    pub async fn write(&self, body: Bytes, map_id: u32) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.check_writable(&inner)?;

        if self.options.split_mode == PartitionSplitMode::Hard
            && inner.total_appended >= self.options.split_threshold
        {
            inner.split_requested = true;
            return Err(RssError::HardSplit(format!(
                "partition file {} reached {} bytes",
                self.path.display(),
                inner.total_appended
            )));
        }

        let len = body.len() as u64;
        // Seal the current chunk when this body would overgrow it.
        let last_offset = *inner.chunk_offsets.last().expect("index never empty");
        let current_chunk = inner.total_appended - last_offset;
        if current_chunk > 0 && current_chunk + len > self.options.chunk_size {
            let boundary = inner.total_appended;
            inner.chunk_offsets.push(boundary);
        }

        if inner.buffer.is_none() {
            inner.buffer = Some(self.pool.acquire().await?);
        }
        let buffer = inner.buffer.as_mut().expect("just ensured");
        buffer.push(body);
        inner.total_appended += len;
        inner.map_ids.insert(map_id);
        self.tracker.reserve_disk_buffer(len as usize);

        if inner
            .buffer
            .as_ref()
            .map(|b| b.len() >= self.options.flush_buffer_size)
            .unwrap_or(false)
        {
            self.schedule_flush(&mut inner).await?;
        }
        Ok(())
    }

    /// Force-schedule the current buffer regardless of size; called when the
    /// memory tracker signals pressure.
    pub async fn flush_on_memory_pressure(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != WriterState::Accepting {
            return Ok(());
        }
        if inner.buffer.as_ref().map(|b| !b.is_empty()).unwrap_or(false) {
            self.schedule_flush(&mut inner).await?;
        }
        Ok(())
    }

    /// Report a pending split request once the size threshold is crossed.
    pub async fn split_if_needed(&self) -> Option<PartitionSplitMode> {
        let mut inner = self.inner.lock().await;
        if inner.split_requested {
            return None;
        }
        if inner.total_appended > self.options.split_threshold {
            inner.split_requested = true;
            return Some(self.options.split_mode);
        }
        None
    }

    /// Drain pending flushes and finalize the chunk-offset index.
    ///
    /// An aborted writer still returns the index covering the bytes that
    /// reached disk, so the reader can decide whether to fail over to the
    /// replica.
    pub async fn close(&self) -> Result<Vec<u64>> {
        {
            let mut inner = self.inner.lock().await;
            match inner.state {
                WriterState::Closed => return Ok(self.finalized_offsets(&inner)),
                WriterState::Closing => {
                    return Err(RssError::WriterAborted(format!(
                        "writer for {} already closing",
                        self.path.display()
                    )))
                }
                WriterState::Accepting | WriterState::Aborted => {}
            }
            if inner.state == WriterState::Accepting {
                inner.state = WriterState::Closing;
                if inner.buffer.as_ref().map(|b| !b.is_empty()).unwrap_or(false) {
                    if let Err(e) = self.schedule_flush(&mut inner).await {
                        warn!(path = %self.path.display(), error = %e, "final flush schedule failed");
                        inner.state = WriterState::Aborted;
                    }
                }
                if let Some(buffer) = inner.buffer.take() {
                    self.pool.release(buffer);
                }
            }
        }

        let drain = self
            .notifier
            .wait_drained(self.options.flush_drain_timeout)
            .await;

        let mut inner = self.inner.lock().await;
        match drain {
            Ok(()) => {
                let file = Arc::clone(&self.file);
                tokio::task::spawn_blocking(move || file.sync_all())
                    .await
                    .map_err(|e| RssError::Io(std::io::Error::other(e)))??;
                if inner.state != WriterState::Aborted {
                    inner.state = WriterState::Closed;
                }
                debug!(
                    path = %self.path.display(),
                    bytes = inner.total_appended,
                    chunks = inner.chunk_offsets.len(),
                    "writer closed"
                );
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "writer aborted during close");
                inner.state = WriterState::Aborted;
            }
        }
        Ok(self.finalized_offsets(&inner))
    }

    /// Kill the writer; subsequent writes fail with `WriterAborted`.
    pub async fn abort(&self, reason: String) {
        let mut inner = self.inner.lock().await;
        if matches!(inner.state, WriterState::Closed) {
            return;
        }
        inner.state = WriterState::Aborted;
        if let Some(buffer) = inner.buffer.take() {
            self.pool.release(buffer);
        }
        self.notifier.fail_external(reason);
    }

    fn check_writable(&self, inner: &WriterInner) -> Result<()> {
        if let Some(message) = self.notifier.first_error() {
            return Err(RssError::WriterAborted(message));
        }
        match inner.state {
            WriterState::Accepting => Ok(()),
            WriterState::Aborted => Err(RssError::WriterAborted(format!(
                "writer for {} aborted",
                self.path.display()
            ))),
            WriterState::Closing | WriterState::Closed => Err(RssError::WriterAborted(format!(
                "writer for {} already closed",
                self.path.display()
            ))),
        }
    }

    async fn schedule_flush(&self, inner: &mut WriterInner) -> Result<()> {
        let Some(buffer) = inner.buffer.take() else {
            return Ok(());
        };
        if buffer.is_empty() {
            inner.buffer = Some(buffer);
            return Ok(());
        }
        self.notifier.begin();
        let task = FlushTask {
            buffer,
            file: Arc::clone(&self.file),
            notifier: Arc::clone(&self.notifier),
        };
        match self.flusher.submit(self.flusher_worker, task).await {
            Ok(()) => Ok(()),
            Err((e, task)) => {
                task.notifier.fail(format!("flush submit rejected: {e}"));
                self.pool.release(task.buffer);
                inner.state = WriterState::Aborted;
                Err(e)
            }
        }
    }

    /// Offsets truncated to what actually reached disk, terminated by the
    /// flushed length.
    fn finalized_offsets(&self, inner: &WriterInner) -> Vec<u64> {
        let flushed = self.notifier.flushed_bytes();
        let mut offsets: Vec<u64> = inner
            .chunk_offsets
            .iter()
            .copied()
            .filter(|&o| o <= flushed)
            .collect();
        if offsets.is_empty() {
            offsets.push(0);
        }
        if *offsets.last().expect("non-empty") < flushed {
            offsets.push(flushed);
        }
        offsets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceMonitor;
    use rss_common::config::MemoryConfig;

    fn options() -> WriterOptions {
        WriterOptions {
            flush_buffer_size: 64,
            chunk_size: 256,
            split_threshold: 10 * 1024,
            split_mode: PartitionSplitMode::Soft,
            flush_drain_timeout: Duration::from_secs(5),
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        pool: Arc<BufferPool>,
        flusher: Arc<DiskFlusher>,
        tracker: Arc<MemoryTracker>,
        mount: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mount = dir.path().to_path_buf();
        let tracker = MemoryTracker::new(MemoryConfig::default());
        let pool = BufferPool::new(8, 8, Duration::from_millis(200), Arc::clone(&tracker));
        let monitor = DeviceMonitor::new(&[mount.clone()], Duration::from_secs(3600));
        let flusher = DiskFlusher::new(
            mount.clone(),
            64,
            2,
            Duration::from_millis(500),
            Duration::from_secs(60),
            Arc::clone(&pool),
            monitor,
        );
        Fixture {
            _dir: dir,
            pool,
            flusher,
            tracker,
            mount,
        }
    }

    fn writer(fx: &Fixture, opts: WriterOptions) -> Arc<PartitionFileWriter> {
        PartitionFileWriter::create(
            fx.mount.join("0-0-0"),
            Arc::clone(&fx.flusher),
            Arc::clone(&fx.pool),
            Arc::clone(&fx.tracker),
            opts,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn chunk_offsets_are_strictly_increasing_and_cover_file() {
        let fx = fixture();
        let w = writer(&fx, options());

        // 10 bodies of 100 bytes with a 256-byte chunk target.
        for i in 0..10u32 {
            w.write(Bytes::from(vec![i as u8; 100]), i % 3).await.unwrap();
        }
        let offsets = w.close().await.unwrap();

        assert_eq!(offsets[0], 0);
        assert_eq!(*offsets.last().unwrap(), 1000);
        assert!(offsets.windows(2).all(|p| p[0] < p[1]));
        // Every chunk except possibly the last fits under the target plus one
        // body.
        for pair in offsets.windows(2) {
            assert!(pair[1] - pair[0] <= 300);
        }

        let disk_len = std::fs::metadata(w.path()).unwrap().len();
        assert_eq!(disk_len, 1000);
    }

    #[tokio::test]
    async fn bitmap_records_map_ids() {
        let fx = fixture();
        let w = writer(&fx, options());
        w.write(Bytes::from_static(b"a"), 4).await.unwrap();
        w.write(Bytes::from_static(b"b"), 9).await.unwrap();
        let bitmap = w.map_id_bitmap().await;
        assert!(bitmap.contains(4) && bitmap.contains(9));
        assert!(!bitmap.contains(5));
        w.close().await.unwrap();
    }

    #[tokio::test]
    async fn writes_after_close_fail() {
        let fx = fixture();
        let w = writer(&fx, options());
        w.write(Bytes::from_static(b"x"), 0).await.unwrap();
        w.close().await.unwrap();
        let err = w.write(Bytes::from_static(b"y"), 0).await.unwrap_err();
        assert!(matches!(err, RssError::WriterAborted(_)));
    }

    #[tokio::test]
    async fn aborted_writer_rejects_and_reports() {
        let fx = fixture();
        let w = writer(&fx, options());
        w.write(Bytes::from_static(b"x"), 0).await.unwrap();
        w.abort("disk failed".to_string()).await;
        let err = w.write(Bytes::from_static(b"y"), 0).await.unwrap_err();
        assert!(matches!(err, RssError::WriterAborted(_)));
        assert_eq!(w.state().await, WriterState::Aborted);
    }

    #[tokio::test]
    async fn hard_split_rejects_past_threshold() {
        let fx = fixture();
        let mut opts = options();
        opts.split_threshold = 150;
        opts.split_mode = PartitionSplitMode::Hard;
        let w = writer(&fx, opts);

        w.write(Bytes::from(vec![0u8; 100]), 0).await.unwrap();
        w.write(Bytes::from(vec![0u8; 100]), 0).await.unwrap();
        let err = w.write(Bytes::from(vec![0u8; 100]), 0).await.unwrap_err();
        assert!(matches!(err, RssError::HardSplit(_)));
        w.close().await.unwrap();
    }

    #[tokio::test]
    async fn soft_split_requests_once_and_keeps_accepting() {
        let fx = fixture();
        let mut opts = options();
        opts.split_threshold = 150;
        let w = writer(&fx, opts);

        w.write(Bytes::from(vec![0u8; 200]), 0).await.unwrap();
        assert_eq!(w.split_if_needed().await, Some(PartitionSplitMode::Soft));
        assert_eq!(w.split_if_needed().await, None);
        w.write(Bytes::from(vec![0u8; 100]), 0).await.unwrap();
        let offsets = w.close().await.unwrap();
        assert_eq!(*offsets.last().unwrap(), 300);
    }

    #[tokio::test]
    async fn close_is_idempotent_for_offsets() {
        let fx = fixture();
        let w = writer(&fx, options());
        w.write(Bytes::from(vec![0u8; 10]), 0).await.unwrap();
        let first = w.close().await.unwrap();
        let second = w.close().await.unwrap();
        assert_eq!(first, second);
    }
}
