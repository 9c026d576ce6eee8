//! Producer and consumer clients of the remote shuffle service.
//!
//! Architecture role:
//! - batches map output per partition and pushes it with bounded in-flight
//!   requests, timeouts, and retry across epochs and replicas;
//! - reads reduce partitions back through a deduplicating, decompressing,
//!   integrity-checked input stream with replica failover;
//! - abstracts the control plane behind [`LocationProvider`] so embedded
//!   runs and tests inject their own location resolution.
//!
//! Key modules:
//! - [`client`]
//! - [`location`]
//! - [`pusher`] / [`push_queue`] / [`inflight`]
//! - [`reader`] / [`stream`]

pub mod client;
pub mod inflight;
pub mod location;
pub mod push_queue;
pub mod pusher;
pub mod reader;
pub mod stream;

pub use client::{FetchExcludedSet, ShuffleClient};
pub use inflight::{InFlightRequestTracker, PushState};
pub use location::{EpochChangeCause, LocationProvider, StaticLocationProvider};
pub use push_queue::{DataPushQueue, PushTask};
pub use pusher::DataPusher;
pub use reader::{
    GrpcReaderFactory, LocalPartitionReader, PartitionReader, PartitionReaderFactory,
    WorkerPartitionReader,
};
pub use stream::ShuffleInputStream;
