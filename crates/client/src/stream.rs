//! Deduplicating, integrity-checked input stream over one reduce partition.
//!
//! The stream walks partition locations in order, pulling chunks through a
//! [`PartitionReader`](crate::reader::PartitionReader) with replica failover,
//! and parses batches out of each chunk. A batch is delivered at most once:
//! stale attempts and repeated `(map, batch)` pairs are skipped, which makes
//! replica overlap and retried pushes invisible to the consumer. Commit
//! metadata batches feed the expected digest; delivered payloads feed the
//! actual digest; close compares the two.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use rss_common::compress::CompressionCodec;
use rss_common::config::ClientConfig;
use rss_common::protocol::{
    BatchHeader, CommitMetadata, PartitionLocation, BATCH_HEADER_LEN, METADATA_BATCH_ID,
};
use rss_common::{Result, RssError, ShuffleKey};

use crate::client::FetchExcludedSet;
use crate::reader::{initial_location, peer_of, PartitionReader, PartitionReaderFactory};

/// Consumer-side stream of deduplicated, decompressed batch payloads.
pub struct ShuffleInputStream {
    config: ClientConfig,
    codec: CompressionCodec,
    key: ShuffleKey,
    partition_id: u32,
    locations: Vec<PartitionLocation>,
    attempts: Vec<u32>,
    attempt_number: u32,
    start_map: u32,
    end_map: u32,
    factory: Arc<dyn PartitionReaderFactory>,
    excluded: Arc<FetchExcludedSet>,

    batches_read: HashMap<u32, HashSet<u32>>,
    current_reader: Option<Box<dyn PartitionReader>>,
    current_chunk: Bytes,
    file_index: usize,
    retry_count: u32,
    max_retry: u32,

    expected: HashMap<String, CommitMetadata>,
    agg_expected: CommitMetadata,
    agg_actual: CommitMetadata,
    finished: bool,
}

impl ShuffleInputStream {
    /// Assemble a stream; no IO happens until the first read.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ClientConfig,
        codec: CompressionCodec,
        key: ShuffleKey,
        partition_id: u32,
        locations: Vec<PartitionLocation>,
        attempts: Vec<u32>,
        attempt_number: u32,
        start_map: u32,
        end_map: u32,
        factory: Arc<dyn PartitionReaderFactory>,
        excluded: Arc<FetchExcludedSet>,
    ) -> Self {
        let max_retry = if config.replicate_enabled {
            config.fetch_max_retries_per_replica * 2
        } else {
            config.fetch_max_retries_per_replica
        };
        Self {
            config,
            codec,
            key,
            partition_id,
            locations,
            attempts,
            attempt_number,
            start_map,
            end_map,
            factory,
            excluded,
            batches_read: HashMap::new(),
            current_reader: None,
            current_chunk: Bytes::new(),
            file_index: 0,
            retry_count: 0,
            max_retry: max_retry.max(1),
            expected: HashMap::new(),
            agg_expected: CommitMetadata::default(),
            agg_actual: CommitMetadata::default(),
            finished: false,
        }
    }

    /// Locations this stream may read.
    pub fn total_partitions_to_read(&self) -> usize {
        self.locations.len()
    }

    /// Locations consumed so far.
    pub fn partitions_read(&self) -> usize {
        self.file_index
    }

    /// Per-map expected commit metadata observed so far.
    pub fn expected_commit_metadata(&self) -> &HashMap<String, CommitMetadata> {
        &self.expected
    }

    /// Next deduplicated batch payload, or `None` once every location is
    /// exhausted and integrity verification passed.
    pub async fn next_batch(&mut self) -> Result<Option<Bytes>> {
        if self.finished {
            return Ok(None);
        }
        loop {
            if self.current_chunk.is_empty() && !self.advance_chunk().await? {
                self.finish()?;
                return Ok(None);
            }
            if self.current_chunk.len() < BATCH_HEADER_LEN {
                return Err(RssError::FetchFail(format!(
                    "chunk ends with {} trailing bytes, shorter than a batch header",
                    self.current_chunk.len()
                )));
            }
            let header = BatchHeader::decode(&self.current_chunk)?;
            let frame_len = BATCH_HEADER_LEN + header.size as usize;
            if self.current_chunk.len() < frame_len {
                return Err(RssError::FetchFail(format!(
                    "chunk truncated inside batch {} of map {}",
                    header.batch_id, header.map_id
                )));
            }
            let body = self.current_chunk.slice(BATCH_HEADER_LEN..frame_len);
            self.current_chunk = self.current_chunk.slice(frame_len..);

            let Some(&current_attempt) = self.attempts.get(header.map_id as usize) else {
                warn!(map_id = header.map_id, "batch from unknown map, skipping");
                continue;
            };
            if header.attempt_id != current_attempt {
                continue;
            }
            let seen = self.batches_read.entry(header.map_id).or_default();
            if !seen.insert(header.batch_id) {
                debug!(
                    map_id = header.map_id,
                    attempt_id = header.attempt_id,
                    batch_id = header.batch_id,
                    "skipping duplicated batch"
                );
                continue;
            }

            if header.batch_id == METADATA_BATCH_ID {
                let raw = self.codec.decompress(&body)?;
                let metadata = CommitMetadata::decode(&raw)?;
                let map_key = self.key.map_key(header.map_id, header.attempt_id);
                debug!(
                    partition = self.partition_id,
                    map_key = %map_key,
                    %metadata,
                    "recorded expected commit metadata"
                );
                self.agg_expected.merge(&metadata);
                self.expected.insert(map_key, metadata);
                continue;
            }

            let payload = self.codec.decompress(&body)?;
            self.agg_actual.add_batch(&payload);
            return Ok(Some(Bytes::from(payload)));
        }
    }

    /// Drain the stream into one buffer.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(batch) = self.next_batch().await? {
            out.extend_from_slice(&batch);
        }
        Ok(out)
    }

    /// Release the reader and verify integrity if the stream was not
    /// already finished.
    pub fn close(&mut self) -> Result<()> {
        self.current_reader = None;
        self.current_chunk = Bytes::new();
        if self.finished {
            return Ok(());
        }
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        self.current_reader = None;
        if !self.config.integrity_check_enabled {
            return Ok(());
        }

        if self.agg_expected != self.agg_actual {
            return Err(RssError::IntegrityMismatch(format!(
                "partition {}: expected {} but delivered {}",
                self.partition_id, self.agg_expected, self.agg_actual
            )));
        }

        // Every map that delivered data must also have delivered its
        // metadata batch.
        let mut missing = Vec::new();
        for (map_id, seen) in &self.batches_read {
            let delivered_data = seen.iter().any(|&b| b != METADATA_BATCH_ID);
            if !delivered_data {
                continue;
            }
            let attempt = self.attempts.get(*map_id as usize).copied().unwrap_or(0);
            let map_key = self.key.map_key(*map_id, attempt);
            if !self.expected.contains_key(&map_key) {
                missing.push(map_key);
            }
        }
        if !missing.is_empty() {
            return Err(RssError::IntegrityIncomplete(format!(
                "partition {}: missing commit metadata for {} of {} map attempts: {:?}",
                self.partition_id,
                missing.len(),
                self.batches_read.len(),
                missing
            )));
        }
        debug!(
            partition = self.partition_id,
            expected = %self.agg_expected,
            "integrity verification passed"
        );
        Ok(())
    }

    /// Pull the next non-empty chunk, moving across readers as files are
    /// exhausted. Returns false once every location is consumed.
    async fn advance_chunk(&mut self) -> Result<bool> {
        loop {
            let has_next = self
                .current_reader
                .as_ref()
                .map(|r| r.has_next())
                .unwrap_or(false);
            if has_next {
                let chunk = self.next_chunk_with_retry().await?;
                if chunk.is_empty() {
                    continue;
                }
                self.current_chunk = chunk;
                return Ok(true);
            }
            if !self.move_to_next_reader().await? {
                return Ok(false);
            }
        }
    }

    async fn move_to_next_reader(&mut self) -> Result<bool> {
        self.current_reader = None;
        while self.file_index < self.locations.len() {
            let location = self.locations[self.file_index].clone();
            self.file_index += 1;
            self.retry_count = 0;
            let reader = self.create_reader_with_retry(location).await?;
            if reader.has_next() {
                self.current_reader = Some(reader);
                return Ok(true);
            }
            // Empty stream: the file holds no maps in range, skip it.
        }
        Ok(false)
    }

    async fn create_reader_with_retry(
        &mut self,
        location: PartitionLocation,
    ) -> Result<Box<dyn PartitionReader>> {
        // The first open spreads retried consumers across the replica pair.
        let mut location = if self.retry_count == 0 {
            initial_location(&location, self.attempt_number)
        } else {
            location
        };

        let mut last_error: Option<RssError> = None;
        while self.retry_count < self.max_retry {
            if self.excluded.is_excluded(&location) {
                last_error = Some(RssError::FetchFail(format!(
                    "location {} is excluded for fetch",
                    location
                )));
            } else {
                match self
                    .factory
                    .create(&self.key, &location, self.start_map, self.end_map)
                    .await
                {
                    Ok(reader) => return Ok(reader),
                    Err(e) => {
                        self.excluded.exclude(&location.host_and_fetch_port());
                        last_error = Some(e);
                    }
                }
            }
            self.retry_count += 1;
            match peer_of(&location) {
                Some(peer) => {
                    warn!(
                        retry = self.retry_count,
                        max = self.max_retry,
                        location = %location,
                        "reader open failed, switching to peer"
                    );
                    // An even retry count means both replicas were tried.
                    if self.retry_count % 2 == 0 {
                        tokio::time::sleep(Duration::from_millis(self.config.retry_wait_ms)).await;
                    }
                    location = peer;
                }
                None => {
                    warn!(
                        retry = self.retry_count,
                        max = self.max_retry,
                        location = %location,
                        "reader open failed, retrying same location"
                    );
                    tokio::time::sleep(Duration::from_millis(self.config.retry_wait_ms)).await;
                }
            }
        }
        Err(RssError::FetchFail(format!(
            "creating partition reader failed after {} retries: {}",
            self.max_retry,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        )))
    }

    async fn next_chunk_with_retry(&mut self) -> Result<Bytes> {
        loop {
            let reader = self
                .current_reader
                .as_mut()
                .expect("advance_chunk checked reader presence");
            if self.excluded.is_excluded(reader.location()) {
                return Err(RssError::FetchFail(format!(
                    "location {} became excluded mid-read",
                    reader.location()
                )));
            }
            match reader.next_chunk().await {
                Ok(chunk) => return Ok(chunk),
                Err(e) => {
                    let location = reader.location().clone();
                    self.excluded.exclude(&location.host_and_fetch_port());
                    self.retry_count += 1;
                    if self.retry_count >= self.max_retry {
                        warn!(error = %e, "chunk fetch exhausted retries");
                        return Err(RssError::FetchFail(format!(
                            "fetching chunks failed {} times for location {}: {}",
                            self.retry_count, location, e
                        )));
                    }
                    // Re-open on the peer when one exists; the dedup layer
                    // absorbs the chunks replayed by the restarted reader.
                    let retry_location = peer_of(&location).unwrap_or_else(|| location.clone());
                    if location.peer().is_none() || self.retry_count % 2 == 0 {
                        tokio::time::sleep(Duration::from_millis(self.config.retry_wait_ms)).await;
                    }
                    warn!(
                        retry = self.retry_count,
                        max = self.max_retry,
                        location = %retry_location,
                        "chunk fetch failed, re-opening reader"
                    );
                    let reader = self.create_reader_with_retry(retry_location).await?;
                    self.current_reader = Some(reader);
                    self.current_chunk = Bytes::new();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{LocalPartitionReader, PartitionReaderFactory};
    use rss_common::protocol::{frame_batch, Role, StorageHint};
    use std::io::Write;
    use std::path::PathBuf;
    use tonic::async_trait;

    struct LocalFactory {
        // fetch endpoint -> (path, chunk offsets)
        files: HashMap<String, (PathBuf, Vec<u64>)>,
    }

    #[async_trait]
    impl PartitionReaderFactory for LocalFactory {
        async fn create(
            &self,
            _key: &ShuffleKey,
            location: &PartitionLocation,
            _start_map: u32,
            _end_map: u32,
        ) -> Result<Box<dyn crate::reader::PartitionReader>> {
            let (path, offsets) = self
                .files
                .get(&location.host_and_fetch_port())
                .ok_or_else(|| RssError::FetchFail("no file for location".to_string()))?;
            Ok(Box::new(LocalPartitionReader::new(
                location.clone(),
                path.clone(),
                offsets.clone(),
            )))
        }
    }

    fn location(host: &str, fetch_port: u16) -> PartitionLocation {
        PartitionLocation {
            partition_id: 0,
            epoch: 0,
            host: host.to_string(),
            rpc_port: 1,
            push_port: 2,
            fetch_port,
            replicate_port: 4,
            role: Role::Primary,
            peer: None,
            storage: StorageHint::Hdd,
            disk_mount: "/tmp".to_string(),
        }
    }

    fn config() -> ClientConfig {
        ClientConfig {
            replicate_enabled: false,
            fetch_max_retries_per_replica: 1,
            retry_wait_ms: 10,
            ..ClientConfig::default()
        }
    }

    struct FileSpec {
        batches: Vec<(u32, u32, u32, Vec<u8>)>,
    }

    fn write_partition_file(
        dir: &std::path::Path,
        name: &str,
        codec: CompressionCodec,
        spec: &FileSpec,
    ) -> (PathBuf, Vec<u64>) {
        let path = dir.join(name);
        let mut contents = Vec::new();
        for (map_id, attempt_id, batch_id, payload) in &spec.batches {
            let body = codec.compress(payload).unwrap();
            contents.extend_from_slice(&frame_batch(*map_id, *attempt_id, *batch_id, &body));
        }
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&contents)
            .unwrap();
        (path, vec![0, contents.len() as u64])
    }

    fn metadata_payload(payloads: &[&[u8]]) -> Vec<u8> {
        let mut digest = CommitMetadata::default();
        for payload in payloads {
            digest.add_batch(payload);
        }
        digest.encode().to_vec()
    }

    fn stream_over(
        files: HashMap<String, (PathBuf, Vec<u64>)>,
        locations: Vec<PartitionLocation>,
        attempts: Vec<u32>,
    ) -> ShuffleInputStream {
        ShuffleInputStream::new(
            config(),
            CompressionCodec::Lz4,
            ShuffleKey::new("app", 0),
            0,
            locations,
            attempts,
            0,
            0,
            u32::MAX,
            Arc::new(LocalFactory { files }),
            FetchExcludedSet::new(std::time::Duration::from_secs(60)),
        )
    }

    #[tokio::test]
    async fn duplicated_batches_are_delivered_once() {
        let dir = tempfile::tempdir().unwrap();
        let codec = CompressionCodec::Lz4;
        let a = b"batch zero".to_vec();
        let b = b"batch one".to_vec();
        let meta = metadata_payload(&[&a, &b]);
        let spec = FileSpec {
            // Batch 1 was retried: it appears twice in the file.
            batches: vec![
                (0, 0, 0, a.clone()),
                (0, 0, 1, b.clone()),
                (0, 0, 1, b.clone()),
                (0, 0, METADATA_BATCH_ID, meta),
            ],
        };
        let (path, offsets) = write_partition_file(dir.path(), "0-0-0", codec, &spec);
        let mut files = HashMap::new();
        files.insert("h1:3".to_string(), (path, offsets));

        let mut stream = stream_over(files, vec![location("h1", 3)], vec![0]);
        let delivered = stream.read_to_end().await.unwrap();
        assert_eq!(delivered.len(), a.len() + b.len());
        stream.close().unwrap();
    }

    #[tokio::test]
    async fn stale_attempts_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let codec = CompressionCodec::Lz4;
        let stale = b"stale attempt output".to_vec();
        let fresh = b"fresh attempt output".to_vec();
        let meta = metadata_payload(&[&fresh]);
        let spec = FileSpec {
            batches: vec![
                (0, 0, 0, stale),
                (0, 1, 0, fresh.clone()),
                (0, 1, METADATA_BATCH_ID, meta),
            ],
        };
        let (path, offsets) = write_partition_file(dir.path(), "0-0-0", codec, &spec);
        let mut files = HashMap::new();
        files.insert("h1:3".to_string(), (path, offsets));

        // attempts[0] == 1: only the second attempt's output counts.
        let mut stream = stream_over(files, vec![location("h1", 3)], vec![1]);
        let delivered = stream.read_to_end().await.unwrap();
        assert_eq!(delivered, fresh);
    }

    #[tokio::test]
    async fn missing_commit_metadata_is_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let codec = CompressionCodec::Lz4;
        let spec = FileSpec {
            batches: vec![(0, 0, 0, b"data without metadata".to_vec())],
        };
        let (path, offsets) = write_partition_file(dir.path(), "0-0-0", codec, &spec);
        let mut files = HashMap::new();
        files.insert("h1:3".to_string(), (path, offsets));

        let mut stream = stream_over(files, vec![location("h1", 3)], vec![0]);
        let err = stream.read_to_end().await.unwrap_err();
        assert!(matches!(err, RssError::IntegrityIncomplete(_)));
    }

    #[tokio::test]
    async fn unreadable_location_fails_after_retries() {
        let mut stream = stream_over(HashMap::new(), vec![location("gone", 3)], vec![0]);
        let err = stream.read_to_end().await.unwrap_err();
        assert!(matches!(err, RssError::FetchFail(_)));
    }
}
