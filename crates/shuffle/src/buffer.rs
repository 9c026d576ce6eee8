//! Bounded pool of reusable composite buffers.
//!
//! A composite buffer is a sequence of `Bytes` slabs: pushed bodies flow in
//! from the network layer without copying, and the flusher gathers all
//! components into one sequential write. The pool is the rate-limiting
//! resource of the write path; when it runs dry, pushes back-pressure.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Semaphore;

use rss_common::{MemoryTracker, Result, RssError};

/// A concatenation of small `Bytes` slabs gathered into one flush.
#[derive(Debug, Default)]
pub struct CompositeBuffer {
    components: Vec<Bytes>,
    len: usize,
}

impl CompositeBuffer {
    /// Empty buffer with a component-capacity hint.
    pub fn with_capacity(components: usize) -> Self {
        Self {
            components: Vec::with_capacity(components),
            len: 0,
        }
    }

    /// Append one body without copying.
    pub fn push(&mut self, body: Bytes) {
        self.len += body.len();
        self.components.push(body);
    }

    /// Total byte length across components.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Component slabs in append order.
    pub fn components(&self) -> &[Bytes] {
        &self.components
    }

    /// Drop all components, keeping allocated capacity for reuse.
    pub fn clear(&mut self) {
        self.components.clear();
        self.len = 0;
    }

    /// Write every component sequentially into `out`.
    pub fn write_to(&self, out: &mut impl std::io::Write) -> std::io::Result<usize> {
        for component in &self.components {
            out.write_all(component)?;
        }
        Ok(self.len)
    }
}

/// Fixed pool of composite buffers enforcing the worker's buffer budget.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<VecDeque<CompositeBuffer>>,
    available: Semaphore,
    acquire_timeout: Duration,
    tracker: Arc<MemoryTracker>,
}

impl BufferPool {
    /// Pre-allocate `capacity` buffers.
    pub fn new(
        capacity: usize,
        component_hint: usize,
        acquire_timeout: Duration,
        tracker: Arc<MemoryTracker>,
    ) -> Arc<Self> {
        let capacity = capacity.max(1);
        let buffers = (0..capacity)
            .map(|_| CompositeBuffer::with_capacity(component_hint))
            .collect();
        Arc::new(Self {
            buffers: Mutex::new(buffers),
            available: Semaphore::new(capacity),
            acquire_timeout,
            tracker,
        })
    }

    /// Take a buffer, waiting up to the configured timeout.
    pub async fn acquire(&self) -> Result<CompositeBuffer> {
        let permit = tokio::time::timeout(self.acquire_timeout, self.available.acquire())
            .await
            .map_err(|_| {
                RssError::BufferExhausted(format!(
                    "no buffer available within {:?}",
                    self.acquire_timeout
                ))
            })?
            .map_err(|_| RssError::BufferExhausted("buffer pool closed".to_string()))?;
        permit.forget();
        let buffer = self
            .buffers
            .lock()
            .expect("buffer pool lock")
            .pop_front()
            .expect("semaphore guarantees availability");
        Ok(buffer)
    }

    /// Return a buffer to the pool, crediting its bytes back to the tracker.
    ///
    /// Callable from flusher threads; never blocks.
    pub fn release(&self, mut buffer: CompositeBuffer) {
        let bytes = buffer.len();
        buffer.clear();
        self.buffers
            .lock()
            .expect("buffer pool lock")
            .push_back(buffer);
        self.available.add_permits(1);
        if bytes > 0 {
            self.tracker.release_disk_buffer(bytes);
        }
    }

    /// Buffers currently available.
    pub fn available(&self) -> usize {
        self.available.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rss_common::config::MemoryConfig;

    fn pool(capacity: usize) -> Arc<BufferPool> {
        let tracker = MemoryTracker::new(MemoryConfig::default());
        BufferPool::new(capacity, 8, Duration::from_millis(50), tracker)
    }

    #[tokio::test]
    async fn acquire_fails_when_exhausted() {
        let pool = pool(1);
        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, RssError::BufferExhausted(_)));
        pool.release(held);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn release_clears_and_credits_tracker() {
        let tracker = MemoryTracker::new(MemoryConfig::default());
        let pool = BufferPool::new(1, 8, Duration::from_millis(50), Arc::clone(&tracker));
        let mut buf = pool.acquire().await.unwrap();
        buf.push(Bytes::from_static(b"hello"));
        tracker.reserve_disk_buffer(5);
        assert_eq!(tracker.pending_flush_bytes(), 5);
        pool.release(buf);
        assert_eq!(tracker.pending_flush_bytes(), 0);

        let buf = pool.acquire().await.unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn composite_write_gathers_components() {
        let mut buf = CompositeBuffer::with_capacity(2);
        buf.push(Bytes::from_static(b"ab"));
        buf.push(Bytes::from_static(b"cd"));
        let mut out = Vec::new();
        assert_eq!(buf.write_to(&mut out).unwrap(), 4);
        assert_eq!(out, b"abcd");
    }
}
