//! Wire-level protocol types shared by producers, consumers, and workers.
//!
//! Batch framing on disk and on the wire is identical, little-endian:
//! `[map_id: u32][attempt_id: u32][batch_id: u32][size: u32][payload]`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, RssError};

/// Length of the framed batch header in bytes.
pub const BATCH_HEADER_LEN: usize = 16;

/// Reserved batch id carrying a per-map commit-metadata record instead of
/// user bytes.
pub const METADATA_BATCH_ID: u32 = 0xFFFF_FFFE;

/// Role of a partition location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Receives pushes directly from producers and forks them to its peer.
    Primary,
    /// Receives forked writes from the primary.
    Replica,
}

impl Role {
    /// Stable single-byte encoding used in file names and on the wire.
    pub fn as_byte(self) -> u8 {
        match self {
            Role::Primary => 0,
            Role::Replica => 1,
        }
    }

    /// Decode from the stable single-byte encoding.
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Role::Primary),
            1 => Ok(Role::Replica),
            other => Err(RssError::InvalidConfig(format!(
                "unknown partition role byte: {other}"
            ))),
        }
    }
}

/// Storage medium hint for a partition location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageHint {
    /// Worker memory only.
    Memory,
    /// Local SSD mount.
    Ssd,
    /// Local HDD mount.
    Hdd,
    /// HDFS-backed storage.
    Hdfs,
    /// S3-backed storage.
    S3,
}

impl StorageHint {
    /// Whether chunks for this hint are served by a worker process.
    pub fn is_worker_served(self) -> bool {
        matches!(self, StorageHint::Memory | StorageHint::Ssd | StorageHint::Hdd)
    }
}

/// One incarnation of a shuffle partition on one worker.
///
/// The `peer` field points at the paired replica (for a primary) or back at
/// the primary (for a replica). The peer's own `peer` is always elided so the
/// structure stays acyclic; resolution beyond one hop goes through the
/// partition registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionLocation {
    /// Partition id within the shuffle.
    pub partition_id: u32,
    /// Incarnation counter, bumped on every split or re-assignment.
    pub epoch: u32,
    /// Worker host.
    pub host: String,
    /// Worker control RPC port.
    pub rpc_port: u16,
    /// Port accepting producer pushes.
    pub push_port: u16,
    /// Port serving chunk fetches.
    pub fetch_port: u16,
    /// Port accepting replicated writes from the peer primary.
    pub replicate_port: u16,
    /// Primary or replica role.
    pub role: Role,
    /// Paired location, one hop only.
    pub peer: Option<Box<PartitionLocation>>,
    /// Storage medium backing this location.
    pub storage: StorageHint,
    /// Mount point the partition file lives on.
    pub disk_mount: String,
}

impl PartitionLocation {
    /// Unique id of this partition incarnation, used in file names.
    pub fn unique_id(&self) -> String {
        format!("{}-{}", self.partition_id, self.epoch)
    }

    /// `host:push_port` endpoint key for in-flight accounting.
    pub fn host_and_push_port(&self) -> String {
        format!("{}:{}", self.host, self.push_port)
    }

    /// `host:fetch_port` endpoint key for fetch exclusion.
    pub fn host_and_fetch_port(&self) -> String {
        format!("{}:{}", self.host, self.fetch_port)
    }

    /// `host:replicate_port` endpoint the primary forks writes to.
    pub fn host_and_replicate_port(&self) -> String {
        format!("{}:{}", self.host, self.replicate_port)
    }

    /// Peer location, if one is configured.
    pub fn peer(&self) -> Option<&PartitionLocation> {
        self.peer.as_deref()
    }

    /// Copy of this location without its peer link.
    pub fn without_peer(&self) -> PartitionLocation {
        let mut loc = self.clone();
        loc.peer = None;
        loc
    }
}

impl fmt::Display for PartitionLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}@{}:{} ({:?})",
            self.partition_id, self.epoch, self.host, self.push_port, self.role
        )
    }
}

/// Decoded batch framing header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchHeader {
    /// Producing map task id.
    pub map_id: u32,
    /// Attempt number of the producing task.
    pub attempt_id: u32,
    /// Monotonic batch number within the attempt, or [`METADATA_BATCH_ID`].
    pub batch_id: u32,
    /// Payload length in bytes.
    pub size: u32,
}

impl BatchHeader {
    /// Encode into the 16-byte little-endian wire form.
    pub fn encode(&self) -> [u8; BATCH_HEADER_LEN] {
        let mut out = [0u8; BATCH_HEADER_LEN];
        out[0..4].copy_from_slice(&self.map_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.attempt_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.batch_id.to_le_bytes());
        out[12..16].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    /// Decode from a buffer holding at least [`BATCH_HEADER_LEN`] bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < BATCH_HEADER_LEN {
            return Err(RssError::FetchFail(format!(
                "truncated batch header: {} bytes",
                buf.len()
            )));
        }
        Ok(Self {
            map_id: u32::from_le_bytes(buf[0..4].try_into().expect("sliced")),
            attempt_id: u32::from_le_bytes(buf[4..8].try_into().expect("sliced")),
            batch_id: u32::from_le_bytes(buf[8..12].try_into().expect("sliced")),
            size: u32::from_le_bytes(buf[12..16].try_into().expect("sliced")),
        })
    }

    /// Whether this batch carries commit metadata instead of user data.
    pub fn is_metadata(&self) -> bool {
        self.batch_id == METADATA_BATCH_ID
    }
}

/// Frame one batch (header + payload) into a single buffer.
pub fn frame_batch(map_id: u32, attempt_id: u32, batch_id: u32, payload: &[u8]) -> Bytes {
    let header = BatchHeader {
        map_id,
        attempt_id,
        batch_id,
        size: payload.len() as u32,
    };
    let mut buf = BytesMut::with_capacity(BATCH_HEADER_LEN + payload.len());
    buf.put_slice(&header.encode());
    buf.put_slice(payload);
    buf.freeze()
}

/// Per-(map, attempt) digest used for end-to-end integrity verification.
///
/// Values combine as a commutative monoid: byte and record counts add, and
/// checksums combine by XOR of per-batch CRC32s, so aggregation over batches
/// arriving in any order yields the same digest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMetadata {
    /// Total uncompressed payload bytes.
    pub bytes: u64,
    /// XOR-combined CRC32 of each payload.
    pub checksum: u32,
    /// Number of batches covered.
    pub records: u64,
}

/// Encoded length of a commit-metadata record.
pub const COMMIT_METADATA_LEN: usize = 20;

impl CommitMetadata {
    /// Fold one payload into the digest.
    pub fn add_batch(&mut self, payload: &[u8]) {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(payload);
        self.checksum ^= hasher.finalize();
        self.bytes += payload.len() as u64;
        self.records += 1;
    }

    /// Combine with another digest.
    pub fn merge(&mut self, other: &CommitMetadata) {
        self.bytes += other.bytes;
        self.checksum ^= other.checksum;
        self.records += other.records;
    }

    /// Encode into the 20-byte little-endian wire form.
    pub fn encode(&self) -> [u8; COMMIT_METADATA_LEN] {
        let mut out = [0u8; COMMIT_METADATA_LEN];
        out[0..8].copy_from_slice(&self.bytes.to_le_bytes());
        out[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        out[12..20].copy_from_slice(&self.records.to_le_bytes());
        out
    }

    /// Decode from the wire form.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < COMMIT_METADATA_LEN {
            return Err(RssError::IntegrityIncomplete(format!(
                "truncated commit metadata: {} bytes",
                buf.len()
            )));
        }
        Ok(Self {
            bytes: buf.get_u64_le(),
            checksum: buf.get_u32_le(),
            records: buf.get_u64_le(),
        })
    }
}

impl fmt::Display for CommitMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bytes={} checksum={:#010x} records={}",
            self.bytes, self.checksum, self.records
        )
    }
}

/// Status codes a worker returns for push requests. Values are stable across
/// versions; the gRPC layer transports them as a proto enum with identical
/// discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStatus {
    /// Push accepted.
    Success,
    /// Partition passed the soft-split threshold; producer should obtain a
    /// new epoch but the push was accepted.
    SoftSplit,
    /// Partition hard-split; push rejected until the epoch is bumped.
    HardSplit,
    /// Partition closed by stage end; producer terminates cleanly.
    StageEnd,
    /// Local write failed on the primary.
    PushDataFailPrimary,
    /// Replication to the peer failed.
    PushDataFailReplica,
    /// User or worker is rate-capped.
    CongestControl,
    /// Worker is under memory pressure and refuses new pushes.
    PausePush,
}

impl PushStatus {
    /// Whether the producer's batch was durably accepted.
    pub fn is_accepted(self) -> bool {
        matches!(self, PushStatus::Success | PushStatus::SoftSplit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_header_round_trips_little_endian() {
        let header = BatchHeader {
            map_id: 3,
            attempt_id: 1,
            batch_id: 42,
            size: 1024,
        };
        let encoded = header.encode();
        assert_eq!(&encoded[0..4], &3u32.to_le_bytes());
        assert_eq!(BatchHeader::decode(&encoded).unwrap(), header);
    }

    #[test]
    fn metadata_batch_id_is_reserved() {
        let framed = frame_batch(0, 0, METADATA_BATCH_ID, &[1, 2, 3]);
        let header = BatchHeader::decode(&framed).unwrap();
        assert!(header.is_metadata());
        assert_eq!(header.size, 3);
    }

    #[test]
    fn commit_metadata_is_order_independent() {
        let a = b"first payload".as_slice();
        let b = b"second payload".as_slice();

        let mut forward = CommitMetadata::default();
        forward.add_batch(a);
        forward.add_batch(b);

        let mut reverse = CommitMetadata::default();
        reverse.add_batch(b);
        reverse.add_batch(a);

        assert_eq!(forward, reverse);

        let mut merged = CommitMetadata::default();
        let mut only_a = CommitMetadata::default();
        only_a.add_batch(a);
        let mut only_b = CommitMetadata::default();
        only_b.add_batch(b);
        merged.merge(&only_a);
        merged.merge(&only_b);
        assert_eq!(merged, forward);
    }

    #[test]
    fn commit_metadata_round_trips() {
        let mut meta = CommitMetadata::default();
        meta.add_batch(b"payload");
        let decoded = CommitMetadata::decode(&meta.encode()).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn location_endpoints_render_host_and_port() {
        let loc = PartitionLocation {
            partition_id: 5,
            epoch: 2,
            host: "10.0.0.1".to_string(),
            rpc_port: 9000,
            push_port: 9001,
            fetch_port: 9002,
            replicate_port: 9003,
            role: Role::Primary,
            peer: None,
            storage: StorageHint::Ssd,
            disk_mount: "/mnt/disk1".to_string(),
        };
        assert_eq!(loc.unique_id(), "5-2");
        assert_eq!(loc.host_and_push_port(), "10.0.0.1:9001");
        assert_eq!(loc.host_and_fetch_port(), "10.0.0.1:9002");
    }
}
