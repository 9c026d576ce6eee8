//! Credit-based chunk streaming.
//!
//! `open_stream` snapshots a finalized file's chunk-offset index into a
//! registered stream handle. A later `StreamChunks` call drives the
//! transfer: every inbound message adds credit, every outbound chunk spends
//! one, and the sender parks whenever credit reaches zero, so a slow reader
//! never forces unbounded buffering on the worker. Dropping the stream or
//! exceeding the idle timeout releases the handle.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use roaring::RoaringBitmap;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use rss_common::metrics::global_metrics;
use rss_common::{Result, RssError};

use crate::storage::FinalizedFile;

/// One open chunk stream.
pub struct StreamHandle {
    /// Stream id the reader uses to address credit grants.
    pub stream_id: u64,
    /// Shuffle key label for metrics.
    pub shuffle_key: String,
    /// Path of the finalized file being served.
    pub path: PathBuf,
    /// Snapshot of the chunk-offset index at open time.
    pub chunk_offsets: Vec<u64>,
    /// Credits available to the sender.
    pub credits: Arc<Semaphore>,
}

impl StreamHandle {
    /// Number of chunks the snapshot covers.
    pub fn num_chunks(&self) -> u32 {
        self.chunk_offsets.len().saturating_sub(1) as u32
    }
}

/// Registry of open chunk streams.
pub struct ChunkStreamRegistry {
    next_stream_id: AtomicU64,
    streams: Mutex<HashMap<u64, Arc<StreamHandle>>>,
    idle_timeout: Duration,
}

impl ChunkStreamRegistry {
    /// Registry with the given per-chunk credit-wait timeout.
    pub fn new(idle_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            next_stream_id: AtomicU64::new(1),
            streams: Mutex::new(HashMap::new()),
            idle_timeout,
        })
    }

    /// Register a stream over a finalized file, pre-filtered by the map-id
    /// range: a file whose bitmap misses `[start_map, end_map)` entirely is
    /// served as an empty stream so the reader skips it without burning a
    /// retry.
    pub fn open_stream(
        &self,
        shuffle_key: String,
        file: &FinalizedFile,
        start_map: u32,
        end_map: u32,
        initial_credit: u32,
    ) -> Result<Arc<StreamHandle>> {
        let chunk_offsets = if bitmap_intersects(&file.map_ids, start_map, end_map) {
            file.chunk_offsets.clone()
        } else {
            debug!(
                file = %file.path.display(),
                start_map,
                end_map,
                "map range misses file bitmap, serving empty stream"
            );
            vec![0]
        };
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::AcqRel);
        let handle = Arc::new(StreamHandle {
            stream_id,
            shuffle_key,
            path: file.path.clone(),
            chunk_offsets,
            credits: Arc::new(Semaphore::new(initial_credit as usize)),
        });
        let mut streams = self.streams.lock().expect("stream lock");
        streams.insert(stream_id, Arc::clone(&handle));
        global_metrics().set_open_streams(streams.len() as u64);
        debug!(stream_id, chunks = handle.num_chunks(), "opened chunk stream");
        Ok(handle)
    }

    /// Resolve a registered stream.
    pub fn get(&self, stream_id: u64) -> Result<Arc<StreamHandle>> {
        self.streams
            .lock()
            .expect("stream lock")
            .get(&stream_id)
            .cloned()
            .ok_or_else(|| RssError::FetchFail(format!("unknown stream id {stream_id}")))
    }

    /// Add credit to a stream. Unknown ids are ignored: the stream may have
    /// completed while the grant was in flight.
    pub fn add_credit(&self, stream_id: u64, credit: u32) {
        if let Ok(handle) = self.get(stream_id) {
            handle.credits.add_permits(credit as usize);
        }
    }

    /// Release a stream handle and its file descriptor budget.
    pub fn release(&self, stream_id: u64) {
        let mut streams = self.streams.lock().expect("stream lock");
        if streams.remove(&stream_id).is_some() {
            global_metrics().set_open_streams(streams.len() as u64);
            debug!(stream_id, "released chunk stream");
        }
    }

    /// Streams currently open.
    pub fn open_count(&self) -> usize {
        self.streams.lock().expect("stream lock").len()
    }

    /// Wait for one credit on the stream, bounded by the idle timeout.
    pub async fn wait_credit(&self, handle: &StreamHandle) -> Result<()> {
        match tokio::time::timeout(self.idle_timeout, handle.credits.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                Ok(())
            }
            Ok(Err(_)) => Err(RssError::FetchFail("stream credits closed".to_string())),
            Err(_) => {
                warn!(stream_id = handle.stream_id, "credit wait timed out, releasing stream");
                Err(RssError::FetchFail(format!(
                    "no credit within {:?} on stream {}",
                    self.idle_timeout, handle.stream_id
                )))
            }
        }
    }
}

/// Read one chunk's byte range. Blocking IO; callers wrap in
/// `spawn_blocking`.
pub fn read_chunk(path: &PathBuf, offsets: &[u64], chunk_index: u32) -> Result<Vec<u8>> {
    let index = chunk_index as usize;
    if index + 1 >= offsets.len() {
        return Err(RssError::FetchFail(format!(
            "chunk index {chunk_index} out of range ({} chunks)",
            offsets.len().saturating_sub(1)
        )));
    }
    let start = offsets[index];
    let len = (offsets[index + 1] - start) as usize;
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(start))?;
    let mut payload = vec![0u8; len];
    file.read_exact(&mut payload)?;
    Ok(payload)
}

fn bitmap_intersects(bitmap: &RoaringBitmap, start_map: u32, end_map: u32) -> bool {
    if start_map == 0 && end_map == u32::MAX {
        return true;
    }
    bitmap.range_cardinality(start_map..end_map) > 0
}
