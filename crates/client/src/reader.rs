//! Partition readers.
//!
//! A reader yields the chunks of one partition file in index order. The
//! worker variant drives the credit-gated gRPC stream; the local variant
//! reads a file directly and exists for co-located reads and in-process
//! tests. DFS-backed storage hints are declared in the data model but not
//! served by this build.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::async_trait;
use tracing::debug;

use rss_common::protocol::PartitionLocation;
use rss_common::{Result, RssError, ShuffleKey};
use rss_shuffle::layout;
use rss_worker::grpc::v1;

use crate::client::ShuffleClient;

/// Sequential chunk access over one partition location.
#[async_trait]
pub trait PartitionReader: Send {
    /// Location this reader serves.
    fn location(&self) -> &PartitionLocation;

    /// Whether more chunks remain.
    fn has_next(&self) -> bool;

    /// Fetch the next chunk.
    async fn next_chunk(&mut self) -> Result<Bytes>;
}

/// Builds readers for locations; swapped out in tests for in-process reads.
#[async_trait]
pub trait PartitionReaderFactory: Send + Sync {
    /// Create a reader over `location` restricted to `[start_map, end_map)`.
    async fn create(
        &self,
        key: &ShuffleKey,
        location: &PartitionLocation,
        start_map: u32,
        end_map: u32,
    ) -> Result<Box<dyn PartitionReader>>;
}

/// Reader over the worker fetch service.
pub struct WorkerPartitionReader {
    location: PartitionLocation,
    stream_id: u64,
    num_chunks: u32,
    received: u32,
    inbound: tonic::Streaming<v1::ChunkData>,
    credit_tx: mpsc::Sender<v1::ReadAddCredit>,
}

impl WorkerPartitionReader {
    /// Open the stream and start the credit-gated transfer.
    pub async fn open(
        client: &Arc<ShuffleClient>,
        key: &ShuffleKey,
        location: &PartitionLocation,
        start_map: u32,
        end_map: u32,
    ) -> Result<Self> {
        let endpoint = location.host_and_fetch_port();
        let mut fetch = client.fetch_client(&endpoint).await?;
        let file_name =
            layout::partition_file_name(location.partition_id, location.epoch, location.role);
        let initial_credit = client.config().fetch_initial_credit;

        let handle = fetch
            .open_stream(v1::OpenStreamRequest {
                shuffle_key: key.to_string(),
                file_name,
                start_map,
                end_map,
                initial_credit,
            })
            .await
            .map_err(|e| RssError::FetchFail(format!("open stream at {endpoint}: {e}")))?
            .into_inner();

        let (credit_tx, credit_rx) = mpsc::channel::<v1::ReadAddCredit>(8);
        credit_tx
            .send(v1::ReadAddCredit {
                stream_id: handle.stream_id,
                credit: 0,
            })
            .await
            .map_err(|_| RssError::FetchFail("credit channel closed".to_string()))?;

        let inbound = fetch
            .stream_chunks(ReceiverStream::new(credit_rx))
            .await
            .map_err(|e| RssError::FetchFail(format!("chunk stream at {endpoint}: {e}")))?
            .into_inner();

        debug!(
            stream_id = handle.stream_id,
            chunks = handle.num_chunks,
            endpoint = %endpoint,
            "opened worker partition reader"
        );
        Ok(Self {
            location: location.clone(),
            stream_id: handle.stream_id,
            num_chunks: handle.num_chunks,
            received: 0,
            inbound,
            credit_tx,
        })
    }
}

#[async_trait]
impl PartitionReader for WorkerPartitionReader {
    fn location(&self) -> &PartitionLocation {
        &self.location
    }

    fn has_next(&self) -> bool {
        self.received < self.num_chunks
    }

    async fn next_chunk(&mut self) -> Result<Bytes> {
        let chunk = self
            .inbound
            .message()
            .await
            .map_err(|e| RssError::FetchFail(format!("chunk receive failed: {e}")))?
            .ok_or_else(|| {
                RssError::FetchFail(format!(
                    "stream {} ended after {} of {} chunks",
                    self.stream_id, self.received, self.num_chunks
                ))
            })?;
        self.received += 1;
        // Replenish the credit this chunk consumed.
        let _ = self
            .credit_tx
            .send(v1::ReadAddCredit {
                stream_id: self.stream_id,
                credit: 1,
            })
            .await;
        Ok(Bytes::from(chunk.payload))
    }
}

/// Reader over a locally accessible partition file.
pub struct LocalPartitionReader {
    location: PartitionLocation,
    path: PathBuf,
    chunk_offsets: Vec<u64>,
    next_index: usize,
}

impl LocalPartitionReader {
    /// Reader over an already-finalized file and its chunk-offset snapshot.
    pub fn new(location: PartitionLocation, path: PathBuf, chunk_offsets: Vec<u64>) -> Self {
        Self {
            location,
            path,
            chunk_offsets,
            next_index: 0,
        }
    }
}

#[async_trait]
impl PartitionReader for LocalPartitionReader {
    fn location(&self) -> &PartitionLocation {
        &self.location
    }

    fn has_next(&self) -> bool {
        self.next_index + 1 < self.chunk_offsets.len()
    }

    async fn next_chunk(&mut self) -> Result<Bytes> {
        if !self.has_next() {
            return Err(RssError::FetchFail(format!(
                "no chunk {} in {}",
                self.next_index,
                self.path.display()
            )));
        }
        let start = self.chunk_offsets[self.next_index];
        let len = (self.chunk_offsets[self.next_index + 1] - start) as usize;
        let path = self.path.clone();
        let payload = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut file = File::open(&path)?;
            file.seek(SeekFrom::Start(start))?;
            let mut payload = vec![0u8; len];
            file.read_exact(&mut payload)?;
            Ok(payload)
        })
        .await
        .map_err(|e| RssError::FetchFail(format!("chunk read task failed: {e}")))?
        .map_err(|e| RssError::FetchFail(format!("chunk read failed: {e}")))?;
        self.next_index += 1;
        Ok(Bytes::from(payload))
    }
}

/// Default factory: picks the reader variant from the storage hint.
pub struct GrpcReaderFactory {
    client: Arc<ShuffleClient>,
}

impl GrpcReaderFactory {
    /// Factory using the client's fetch connection pool.
    pub fn new(client: Arc<ShuffleClient>) -> Arc<Self> {
        Arc::new(Self { client })
    }
}

#[async_trait]
impl PartitionReaderFactory for GrpcReaderFactory {
    async fn create(
        &self,
        key: &ShuffleKey,
        location: &PartitionLocation,
        start_map: u32,
        end_map: u32,
    ) -> Result<Box<dyn PartitionReader>> {
        if !location.storage.is_worker_served() {
            return Err(RssError::Unsupported(format!(
                "storage hint {:?} is not served by this build",
                location.storage
            )));
        }
        let reader =
            WorkerPartitionReader::open(&self.client, key, location, start_map, end_map).await?;
        Ok(Box::new(reader))
    }
}

/// Pick the replica for odd consumer attempts so retried reduce tasks
/// spread load across the pair.
pub fn initial_location(location: &PartitionLocation, attempt_number: u32) -> PartitionLocation {
    if attempt_number % 2 == 1 {
        if let Some(peer) = location.peer() {
            let mut peer = peer.clone();
            if peer.peer.is_none() {
                peer.peer = Some(Box::new(location.without_peer()));
            }
            return peer;
        }
    }
    location.clone()
}

/// The peer of a location, restoring the back link the wire form elides.
pub fn peer_of(location: &PartitionLocation) -> Option<PartitionLocation> {
    location.peer().map(|peer| {
        let mut peer = peer.clone();
        if peer.peer.is_none() {
            peer.peer = Some(Box::new(location.without_peer()));
        }
        peer
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rss_common::protocol::{Role, StorageHint};
    use std::io::Write;

    fn location_with_peer() -> PartitionLocation {
        PartitionLocation {
            partition_id: 0,
            epoch: 0,
            host: "primary".to_string(),
            rpc_port: 1,
            push_port: 2,
            fetch_port: 3,
            replicate_port: 4,
            role: Role::Primary,
            peer: Some(Box::new(PartitionLocation {
                partition_id: 0,
                epoch: 0,
                host: "replica".to_string(),
                rpc_port: 5,
                push_port: 6,
                fetch_port: 7,
                replicate_port: 8,
                role: Role::Replica,
                peer: None,
                storage: StorageHint::Hdd,
                disk_mount: "/tmp".to_string(),
            })),
            storage: StorageHint::Hdd,
            disk_mount: "/tmp".to_string(),
        }
    }

    #[test]
    fn odd_attempts_start_at_the_replica() {
        let primary = location_with_peer();
        assert_eq!(initial_location(&primary, 0).host, "primary");
        assert_eq!(initial_location(&primary, 2).host, "primary");

        let chosen = initial_location(&primary, 1);
        assert_eq!(chosen.host, "replica");
        // The back link is restored so failover can return to the primary.
        assert_eq!(chosen.peer().unwrap().host, "primary");
    }

    #[tokio::test]
    async fn local_reader_walks_chunks_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0-0-0");
        File::create(&path)
            .unwrap()
            .write_all(b"abcdefgh")
            .unwrap();

        let mut reader = LocalPartitionReader::new(
            location_with_peer(),
            path,
            vec![0, 3, 8],
        );
        assert!(reader.has_next());
        assert_eq!(reader.next_chunk().await.unwrap().as_ref(), b"abc");
        assert_eq!(reader.next_chunk().await.unwrap().as_ref(), b"defgh");
        assert!(!reader.has_next());
        assert!(reader.next_chunk().await.is_err());
    }
}
