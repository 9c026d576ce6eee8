//! Per-map-task data pusher.
//!
//! A fixed set of reusable task slots bounds the memory one map task can
//! pin: `add_task` blocks until a slot frees up, the pusher loop drains the
//! working queue toward workers with in-flight capacity, and completed
//! slots return to the idle queue. Any captured push failure is rethrown to
//! the producer on its next call.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use rss_common::{Result, RssError, ShuffleKey};

use crate::client::ShuffleClient;
use crate::inflight::{replicate_error, PushState};
use crate::push_queue::{DataPushQueue, PushTask};

const IDLE_POLL: Duration = Duration::from_millis(500);

/// Producer-side pusher for one map attempt.
pub struct DataPusher {
    client: Arc<ShuffleClient>,
    key: ShuffleKey,
    map_id: u32,
    attempt_id: u32,
    state: Arc<PushState>,
    queue: Arc<DataPushQueue>,
    idle_tx: mpsc::Sender<PushTask>,
    idle_rx: Mutex<mpsc::Receiver<PushTask>>,
    idle_len: Arc<AtomicUsize>,
    idle_capacity: usize,
    terminated: Arc<AtomicBool>,
    pushed_bytes: Arc<Vec<AtomicU64>>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DataPusher {
    /// Build the pusher and start its drain loop.
    pub fn new(
        client: Arc<ShuffleClient>,
        key: ShuffleKey,
        map_id: u32,
        attempt_id: u32,
        num_partitions: usize,
    ) -> Arc<Self> {
        let config = client.config();
        let capacity = config.push_queue_capacity.max(1);
        let buffer_size = config.push_buffer_max_size;

        let (idle_tx, idle_rx) = mpsc::channel(capacity);
        for _ in 0..capacity {
            idle_tx
                .try_send(PushTask::new(buffer_size))
                .expect("idle queue sized to capacity");
        }

        let state = client.push_state(&key, map_id, attempt_id);
        let queue = Arc::new(DataPushQueue::new(
            Arc::clone(&client),
            Arc::clone(&state),
            key.clone(),
        ));
        let pushed_bytes = Arc::new(
            (0..num_partitions.max(1))
                .map(|_| AtomicU64::new(0))
                .collect::<Vec<_>>(),
        );

        let pusher = Arc::new(Self {
            client,
            key,
            map_id,
            attempt_id,
            state,
            queue,
            idle_tx,
            idle_rx: Mutex::new(idle_rx),
            idle_len: Arc::new(AtomicUsize::new(capacity)),
            idle_capacity: capacity,
            terminated: Arc::new(AtomicBool::new(false)),
            pushed_bytes,
            handle: Mutex::new(None),
        });
        pusher.spawn_push_loop();
        pusher
    }

    /// Queue one batch for a partition, blocking for an idle slot.
    pub async fn add_task(&self, partition_id: u32, data: &[u8]) -> Result<()> {
        let mut task = loop {
            self.state.check()?;
            if self.terminated.load(Ordering::Acquire) {
                return Err(RssError::StageEnd(
                    "pusher terminated, map task should end".to_string(),
                ));
            }
            let mut idle = self.idle_rx.lock().await;
            match tokio::time::timeout(IDLE_POLL, idle.recv()).await {
                Ok(Some(task)) => {
                    self.idle_len.fetch_sub(1, Ordering::AcqRel);
                    break task;
                }
                Ok(None) => {
                    return Err(RssError::WorkerBusy(
                        "pusher idle queue closed".to_string(),
                    ))
                }
                Err(_) => continue,
            }
        };
        task.fill(partition_id, data);
        loop {
            self.state.check()?;
            match self.queue.add_push_task(task) {
                Ok(()) => return Ok(()),
                Err(returned) => {
                    task = returned;
                    tokio::time::sleep(IDLE_POLL).await;
                }
            }
        }
    }

    /// Drain the working queue, wait for every slot to return, and rethrow
    /// any captured error.
    pub async fn wait_on_termination(&self) -> Result<()> {
        // Wait for the idle queue to refill: every queued batch either
        // pushed, failed, or became moot at stage end.
        while self.idle_len.load(Ordering::Acquire) < self.idle_capacity
            && !self.state.has_error()
            && !self.terminated.load(Ordering::Acquire)
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.terminated.store(true, Ordering::Release);

        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.queue.clear();
        self.state.check()
    }

    /// Bytes pushed per partition, for the map status report.
    pub fn pushed_bytes(&self) -> Vec<u64> {
        self.pushed_bytes
            .iter()
            .map(|b| b.load(Ordering::Acquire))
            .collect()
    }

    fn spawn_push_loop(self: &Arc<Self>) {
        let pusher = Arc::clone(self);
        let handle = tokio::spawn(async move {
            pusher.push_loop().await;
        });
        *self.handle.try_lock().expect("handle set before loop starts") = Some(handle);
    }

    async fn push_loop(&self) {
        let running = || !self.terminated.load(Ordering::Acquire) && !self.state.has_error();
        while running() {
            let tasks = match self.queue.take_push_tasks(running).await {
                Ok(tasks) => tasks,
                Err(e) => {
                    self.state.record_error(e);
                    break;
                }
            };
            if tasks.is_empty() {
                continue;
            }
            let mut tasks = tasks.into_iter();
            while let Some(task) = tasks.next() {
                let outcome = self
                    .client
                    .push_data(
                        &self.key,
                        self.map_id,
                        self.attempt_id,
                        task.partition_id(),
                        task.bytes(),
                    )
                    .await;
                match outcome {
                    Ok(bytes) => {
                        if let Some(counter) =
                            self.pushed_bytes.get(task.partition_id() as usize)
                        {
                            counter.fetch_add(bytes as u64, Ordering::AcqRel);
                        }
                        self.reclaim(task).await;
                    }
                    Err(e) => {
                        if let RssError::StageEnd(message) = &e {
                            // Registry closed the partition: the map task
                            // ends cleanly, remaining work is moot.
                            info!(map_id = self.map_id, message = %message, "stage ended during push");
                            self.terminated.store(true, Ordering::Release);
                        } else {
                            debug!(error = %e, "push loop captured failure");
                            self.state.record_error(replicate_error(&e));
                        }
                        // Hand every remaining slot back so termination can
                        // observe a full idle queue.
                        self.reclaim(task).await;
                        for task in tasks {
                            self.reclaim(task).await;
                        }
                        self.queue.clear();
                        return;
                    }
                }
            }
        }
    }

    async fn reclaim(&self, task: PushTask) {
        if self.idle_tx.send(task).await.is_ok() {
            self.idle_len.fetch_add(1, Ordering::AcqRel);
        }
    }
}
