//! Storage plane of the remote shuffle service worker.
//!
//! Architecture role:
//! - on-disk layout for per-partition append-only files
//! - bounded pool of reusable composite buffers
//! - per-mount disk flushers with dedicated writer threads
//! - periodic device health probing and mount isolation
//! - per-partition file writers maintaining the chunk-offset index
//!
//! Key modules:
//! - [`layout`]
//! - [`buffer`]
//! - [`flusher`]
//! - [`device`]
//! - [`writer`]

pub mod buffer;
pub mod device;
pub mod flusher;
pub mod layout;
pub mod writer;

pub use buffer::{BufferPool, CompositeBuffer};
pub use device::{DeviceErrorKind, DeviceMonitor, DeviceObserver};
pub use flusher::{DiskFlusher, FlushNotifier, FlushTask};
pub use writer::{PartitionFileWriter, WriterOptions, WriterState};
