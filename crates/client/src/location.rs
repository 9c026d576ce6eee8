//! Partition location resolution.
//!
//! The lifecycle manager owns slot assignment and split handling; the data
//! plane only needs the small contract below. Production deployments back it
//! with the control-plane RPC client; tests inject a static provider that
//! pre-stages the epochs a split will hand out.

use std::collections::HashMap;
use std::sync::Mutex;

use tonic::async_trait;
use tracing::debug;

use rss_common::protocol::PartitionLocation;
use rss_common::{Result, RssError, ShuffleKey};

/// Why the producer is asking for a new epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochChangeCause {
    /// The worker answered with a soft or hard split status.
    Split,
    /// The push failed and the worker should be avoided.
    PushFailure,
}

/// Control-plane view the data-plane clients depend on.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Current primary locations for pushing, keyed by partition id. An
    /// empty map means the stage has ended.
    async fn get_push_locations(
        &self,
        key: &ShuffleKey,
    ) -> Result<HashMap<u32, PartitionLocation>>;

    /// Obtain the location for the epoch after `stale_epoch`, assigned in
    /// response to a split or push failure.
    async fn request_new_epoch(
        &self,
        key: &ShuffleKey,
        partition_id: u32,
        stale_epoch: u32,
        cause: EpochChangeCause,
    ) -> Result<PartitionLocation>;

    /// Every location holding data of one reduce partition, in read order
    /// (all epochs).
    async fn get_reduce_locations(
        &self,
        key: &ShuffleKey,
        partition_id: u32,
    ) -> Result<Vec<PartitionLocation>>;

    /// Record a worker endpoint the pusher timed out against; the lifecycle
    /// manager feeds this into its fetch-exclusion bookkeeping.
    async fn report_worker_failure(&self, _endpoint: &str, _cause: &RssError) {}
}

/// Static provider for tests and embedded runs: epochs per partition are
/// pre-staged and handed out in order as splits or failures consume them.
pub struct StaticLocationProvider {
    inner: Mutex<StaticInner>,
}

struct StaticInner {
    // partition -> staged locations, ascending epoch; the first entry is
    // the currently active epoch.
    push: HashMap<u32, Vec<PartitionLocation>>,
    // partition -> all locations ever activated, read order.
    activated: HashMap<u32, Vec<PartitionLocation>>,
    stage_ended: bool,
}

impl StaticLocationProvider {
    /// Provider serving the given staged locations.
    pub fn new(locations: Vec<PartitionLocation>) -> Self {
        let mut push: HashMap<u32, Vec<PartitionLocation>> = HashMap::new();
        for location in locations {
            push.entry(location.partition_id).or_default().push(location);
        }
        let mut activated = HashMap::new();
        for (partition, staged) in &mut push {
            staged.sort_by_key(|l| l.epoch);
            if let Some(first) = staged.first() {
                activated.insert(*partition, vec![first.clone()]);
            }
        }
        Self {
            inner: Mutex::new(StaticInner {
                push,
                activated,
                stage_ended: false,
            }),
        }
    }

    /// Mark the stage ended: push lookups return the empty map from now on.
    pub fn end_stage(&self) {
        self.inner.lock().expect("provider lock").stage_ended = true;
    }
}

#[async_trait]
impl LocationProvider for StaticLocationProvider {
    async fn get_push_locations(
        &self,
        _key: &ShuffleKey,
    ) -> Result<HashMap<u32, PartitionLocation>> {
        let inner = self.inner.lock().expect("provider lock");
        if inner.stage_ended {
            return Ok(HashMap::new());
        }
        Ok(inner
            .push
            .iter()
            .filter_map(|(partition, staged)| {
                staged.first().map(|l| (*partition, l.clone()))
            })
            .collect())
    }

    async fn request_new_epoch(
        &self,
        key: &ShuffleKey,
        partition_id: u32,
        stale_epoch: u32,
        cause: EpochChangeCause,
    ) -> Result<PartitionLocation> {
        let mut inner = self.inner.lock().expect("provider lock");
        let staged = inner.push.get_mut(&partition_id).ok_or_else(|| {
            RssError::StageEnd(format!("partition {partition_id} is not registered"))
        })?;
        // Drop incarnations at or below the stale epoch.
        staged.retain(|l| l.epoch > stale_epoch);
        let next = staged.first().cloned().ok_or_else(|| {
            RssError::HardSplit(format!(
                "no staged epoch after {stale_epoch} for partition {partition_id}"
            ))
        })?;
        debug!(
            %key,
            partition_id,
            stale_epoch,
            new_epoch = next.epoch,
            ?cause,
            "assigned new epoch"
        );
        inner
            .activated
            .entry(partition_id)
            .or_default()
            .push(next.clone());
        Ok(next)
    }

    async fn get_reduce_locations(
        &self,
        _key: &ShuffleKey,
        partition_id: u32,
    ) -> Result<Vec<PartitionLocation>> {
        Ok(self
            .inner
            .lock()
            .expect("provider lock")
            .activated
            .get(&partition_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rss_common::protocol::{Role, StorageHint};

    fn location(partition_id: u32, epoch: u32) -> PartitionLocation {
        PartitionLocation {
            partition_id,
            epoch,
            host: "localhost".to_string(),
            rpc_port: 1,
            push_port: 2,
            fetch_port: 3,
            replicate_port: 4,
            role: Role::Primary,
            peer: None,
            storage: StorageHint::Hdd,
            disk_mount: "/tmp".to_string(),
        }
    }

    #[tokio::test]
    async fn split_advances_to_staged_epoch() {
        let key = ShuffleKey::new("app", 0);
        let provider =
            StaticLocationProvider::new(vec![location(0, 0), location(0, 1), location(1, 0)]);

        let initial = provider.get_push_locations(&key).await.unwrap();
        assert_eq!(initial[&0].epoch, 0);

        let next = provider
            .request_new_epoch(&key, 0, 0, EpochChangeCause::Split)
            .await
            .unwrap();
        assert_eq!(next.epoch, 1);
        assert_eq!(provider.get_push_locations(&key).await.unwrap()[&0].epoch, 1);

        // Both activated epochs show up for readers, in order.
        let reduce = provider.get_reduce_locations(&key, 0).await.unwrap();
        assert_eq!(
            reduce.iter().map(|l| l.epoch).collect::<Vec<_>>(),
            vec![0, 1]
        );

        let exhausted = provider
            .request_new_epoch(&key, 0, 1, EpochChangeCause::Split)
            .await;
        assert!(exhausted.is_err());
    }

    #[tokio::test]
    async fn stage_end_empties_push_locations() {
        let key = ShuffleKey::new("app", 0);
        let provider = StaticLocationProvider::new(vec![location(0, 0)]);
        provider.end_stage();
        assert!(provider.get_push_locations(&key).await.unwrap().is_empty());
    }
}
