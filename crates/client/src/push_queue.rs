//! Working queue for push tasks.
//!
//! The queue can hand back any task whose destination worker still has
//! in-flight capacity, not just the head, so one slow worker does not stall
//! batches bound for healthy ones. When nothing is eligible the taker
//! sleeps briefly and rescans; in-flight counts change under it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use rss_common::{Result, ShuffleKey};

use crate::client::ShuffleClient;
use crate::inflight::PushState;

/// One reusable unit of map output bound for a partition.
#[derive(Debug)]
pub struct PushTask {
    partition_id: u32,
    buffer: Vec<u8>,
    size: usize,
}

impl PushTask {
    /// Pre-allocate a task with the push buffer capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            partition_id: 0,
            buffer: vec![0; capacity],
            size: 0,
        }
    }

    /// Fill the task for one batch.
    pub fn fill(&mut self, partition_id: u32, data: &[u8]) {
        if self.buffer.len() < data.len() {
            self.buffer.resize(data.len(), 0);
        }
        self.buffer[..data.len()].copy_from_slice(data);
        self.size = data.len();
        self.partition_id = partition_id;
    }

    /// Destination partition.
    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    /// Filled bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.buffer[..self.size]
    }
}

/// Bounded queue of tasks awaiting push, scanned by destination capacity.
pub struct DataPushQueue {
    client: Arc<ShuffleClient>,
    state: Arc<PushState>,
    key: ShuffleKey,
    working: Mutex<VecDeque<PushTask>>,
    capacity: usize,
    max_in_flight: usize,
    take_task_wait: Duration,
}

impl DataPushQueue {
    /// Queue for one map attempt.
    pub fn new(
        client: Arc<ShuffleClient>,
        state: Arc<PushState>,
        key: ShuffleKey,
    ) -> Self {
        let config = client.config();
        let capacity = config.push_queue_capacity;
        let max_in_flight = config.max_in_flight_per_worker;
        let take_task_wait = Duration::from_millis(config.take_task_wait_ms.max(1));
        Self {
            client,
            state,
            key,
            working: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            max_in_flight,
            take_task_wait,
        }
    }

    /// Offer one task; a full queue hands the task back.
    pub fn add_push_task(&self, task: PushTask) -> std::result::Result<(), PushTask> {
        let mut working = self.working.lock().expect("working queue lock");
        if working.len() >= self.capacity {
            return Err(task);
        }
        working.push_back(task);
        Ok(())
    }

    /// Take every task whose destination has in-flight capacity, waiting
    /// while none is eligible and `running` stays true.
    pub async fn take_push_tasks(&self, running: impl Fn() -> bool) -> Result<Vec<PushTask>> {
        while running() {
            self.state.check()?;
            let locations = self.client.push_locations(&self.key).await?;

            let mut taken = Vec::new();
            {
                let mut working = self.working.lock().expect("working queue lock");
                // Budget per endpoint, recomputed each scan because
                // in-flight counts moved while we slept.
                let mut budgets: HashMap<String, isize> = HashMap::new();
                let mut index = 0;
                while index < working.len() {
                    let partition_id = working[index].partition_id();
                    match locations.get(&partition_id) {
                        Some(location) => {
                            let endpoint = location.host_and_push_port();
                            let budget = budgets.entry(endpoint.clone()).or_insert_with(|| {
                                self.max_in_flight as isize
                                    - self.state.tracker.in_flight(&endpoint) as isize
                            });
                            if *budget > 0 {
                                *budget -= 1;
                                let task = working.remove(index).expect("index in bounds");
                                taken.push(task);
                            } else {
                                index += 1;
                            }
                        }
                        // No location: stage ended or the partition moved;
                        // hand the task to the push path, which resolves or
                        // fails it definitively.
                        None => {
                            let task = working.remove(index).expect("index in bounds");
                            taken.push(task);
                        }
                    }
                }
            }
            if !taken.is_empty() {
                return Ok(taken);
            }
            if self.is_empty() && !running() {
                break;
            }
            tokio::time::sleep(self.take_task_wait).await;
        }
        Ok(Vec::new())
    }

    /// Whether no tasks are queued.
    pub fn is_empty(&self) -> bool {
        self.working.lock().expect("working queue lock").is_empty()
    }

    /// Drop all queued tasks.
    pub fn clear(&self) {
        self.working.lock().expect("working queue lock").clear();
    }
}
