//! Worker data plane of the remote shuffle service.
//!
//! Architecture role:
//! - receives producer pushes, writes them through per-partition file
//!   writers, and forks primary writes to the replica;
//! - serves finalized files back to consumers as credit-gated chunk
//!   streams;
//! - applies back-pressure through the direct-memory tracker and per-user
//!   congestion control;
//! - exposes control operations (reserve, stage end, unregister) to the
//!   lifecycle manager.
//!
//! Key modules:
//! - [`registry`]
//! - [`storage`]
//! - [`handler`]
//! - [`congestion`]
//! - [`fetch`]
//! - [`worker`]
//! - [`grpc`]

pub mod congestion;
pub mod fetch;
pub mod grpc;
pub mod handler;
pub mod registry;
pub mod storage;
pub mod worker;

#[cfg(test)]
mod congestion_tests;

pub use congestion::{BufferStatusWindow, CongestionController, PendingBytes};
pub use fetch::{ChunkStreamRegistry, StreamHandle};
pub use handler::{MergedRange, PushHandler, PushRequest, ReplicateForwarder};
pub use registry::{LookupOutcome, PartitionRegistry};
pub use storage::{FinalizedFile, StorageManager};
pub use worker::{Worker, WorkerConfig};
