#![deny(missing_docs)]

//! Shared configuration, error types, protocol primitives, and observability
//! for the remote shuffle service crates.
//!
//! Architecture role:
//! - defines configuration passed across the data-plane layers
//! - provides the common [`RssError`] / [`Result`] contracts
//! - hosts wire-level protocol types (partition locations, batch framing,
//!   commit metadata, push status codes)
//! - tracks process-wide direct-memory usage and pause/resume signals
//! - hosts metrics and optional exporter utilities
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`protocol`]
//! - [`memory`]
//! - [`metrics`]
//! - `metrics_exporter` (feature-gated)
//!
//! Feature flags:
//! - `profiling`: enables the metrics HTTP exporter helpers.

/// Batch payload compression codecs.
pub mod compress;
/// Shared data-plane configuration types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Strongly-typed identifier wrappers.
pub mod ids;
/// Process-wide direct-memory tracking and pause/resume signals.
pub mod memory;
/// Metrics registry and Prometheus rendering helpers.
pub mod metrics;
#[cfg(feature = "profiling")]
/// Optional HTTP metrics exporter.
pub mod metrics_exporter;
/// Wire-level protocol types shared by clients and workers.
pub mod protocol;

pub use compress::CompressionCodec;
pub use config::{
    ClientConfig, CongestionConfig, MemoryConfig, PartitionSplitMode, StorageConfig,
};
pub use error::{Result, RssError};
pub use ids::{ShuffleKey, UserIdentifier};
pub use memory::{MemoryState, MemoryTracker};
pub use metrics::MetricsRegistry;
#[cfg(feature = "profiling")]
pub use metrics_exporter::run_metrics_exporter;
pub use protocol::{
    BatchHeader, CommitMetadata, PartitionLocation, PushStatus, Role, StorageHint,
    BATCH_HEADER_LEN, METADATA_BATCH_ID,
};
