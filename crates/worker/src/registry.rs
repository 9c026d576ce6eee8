//! Partition location registry.
//!
//! Maps `(shuffle, partition, epoch)` to the location the worker serves.
//! Primary/replica pairing is modeled as one-hop peer links inside the
//! stored location; cyclic references never exist because a peer's own peer
//! is elided and deeper resolution goes through this registry.

use std::collections::HashMap;
use std::sync::Mutex;

use rss_common::protocol::{PartitionLocation, Role};
use rss_common::ShuffleKey;
use tracing::{debug, info};

/// Outcome of resolving a pushed partition against the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome {
    /// The pushed epoch is current; its registered location is returned.
    Found(PartitionLocation),
    /// The partition exists but the pushed epoch is not the current one.
    StaleEpoch {
        /// Epoch the registry currently serves.
        current_epoch: u32,
    },
    /// The shuffle is unknown or the stage has ended.
    StageEnded,
}

#[derive(Debug, Default)]
struct ShuffleEntry {
    // (partition_id, role) -> registered location at its current epoch.
    partitions: HashMap<(u32, Role), PartitionLocation>,
    stage_ended: bool,
}

/// Worker-side registry of partition incarnations.
#[derive(Debug, Default)]
pub struct PartitionRegistry {
    shuffles: Mutex<HashMap<ShuffleKey, ShuffleEntry>>,
}

impl PartitionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or update partition locations for a shuffle. A location with
    /// a newer epoch replaces the older incarnation; an older epoch is
    /// ignored.
    pub fn reserve(&self, key: &ShuffleKey, locations: Vec<PartitionLocation>) {
        let mut shuffles = self.shuffles.lock().expect("registry lock");
        let entry = shuffles.entry(key.clone()).or_default();
        entry.stage_ended = false;
        for location in locations {
            let slot = (location.partition_id, location.role);
            match entry.partitions.get(&slot) {
                Some(existing) if existing.epoch >= location.epoch => {
                    debug!(
                        %key,
                        partition = location.partition_id,
                        epoch = location.epoch,
                        current = existing.epoch,
                        "ignoring stale reserve"
                    );
                }
                _ => {
                    entry.partitions.insert(slot, location);
                }
            }
        }
    }

    /// Resolve one pushed `(partition, epoch, role)`.
    pub fn lookup(
        &self,
        key: &ShuffleKey,
        partition_id: u32,
        epoch: u32,
        role: Role,
    ) -> LookupOutcome {
        let shuffles = self.shuffles.lock().expect("registry lock");
        let Some(entry) = shuffles.get(key) else {
            return LookupOutcome::StageEnded;
        };
        if entry.stage_ended {
            return LookupOutcome::StageEnded;
        }
        match entry.partitions.get(&(partition_id, role)) {
            Some(location) if location.epoch == epoch => {
                LookupOutcome::Found(location.clone())
            }
            Some(location) => LookupOutcome::StaleEpoch {
                current_epoch: location.epoch,
            },
            None => LookupOutcome::StageEnded,
        }
    }

    /// Mark a shuffle's stage as ended; later pushes get `STAGE_END`.
    /// Returns false when the shuffle was never registered.
    pub fn mark_stage_end(&self, key: &ShuffleKey) -> bool {
        let mut shuffles = self.shuffles.lock().expect("registry lock");
        match shuffles.get_mut(key) {
            Some(entry) => {
                entry.stage_ended = true;
                info!(%key, "stage end recorded");
                true
            }
            None => false,
        }
    }

    /// Whether stage end was recorded for the shuffle.
    pub fn is_stage_ended(&self, key: &ShuffleKey) -> bool {
        self.shuffles
            .lock()
            .expect("registry lock")
            .get(key)
            .map(|e| e.stage_ended)
            .unwrap_or(false)
    }

    /// Locations currently registered for one shuffle.
    pub fn locations(&self, key: &ShuffleKey) -> Vec<PartitionLocation> {
        self.shuffles
            .lock()
            .expect("registry lock")
            .get(key)
            .map(|e| e.partitions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop everything recorded for a shuffle.
    pub fn unregister(&self, key: &ShuffleKey) {
        self.shuffles.lock().expect("registry lock").remove(key);
    }

    /// Number of partitions still registered across all shuffles; graceful
    /// shutdown waits for this to reach zero.
    pub fn registered_partitions(&self) -> usize {
        self.shuffles
            .lock()
            .expect("registry lock")
            .values()
            .map(|e| e.partitions.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rss_common::protocol::StorageHint;

    fn location(partition_id: u32, epoch: u32, role: Role) -> PartitionLocation {
        PartitionLocation {
            partition_id,
            epoch,
            host: "localhost".to_string(),
            rpc_port: 9000,
            push_port: 9001,
            fetch_port: 9002,
            replicate_port: 9003,
            role,
            peer: None,
            storage: StorageHint::Hdd,
            disk_mount: "/tmp".to_string(),
        }
    }

    #[test]
    fn lookup_distinguishes_stale_epoch_from_unknown() {
        let registry = PartitionRegistry::new();
        let key = ShuffleKey::new("app", 1);
        registry.reserve(&key, vec![location(0, 1, Role::Primary)]);

        assert!(matches!(
            registry.lookup(&key, 0, 1, Role::Primary),
            LookupOutcome::Found(_)
        ));
        assert_eq!(
            registry.lookup(&key, 0, 0, Role::Primary),
            LookupOutcome::StaleEpoch { current_epoch: 1 }
        );
        assert_eq!(
            registry.lookup(&key, 9, 0, Role::Primary),
            LookupOutcome::StageEnded
        );
        assert_eq!(
            registry.lookup(&ShuffleKey::new("other", 1), 0, 1, Role::Primary),
            LookupOutcome::StageEnded
        );
    }

    #[test]
    fn newer_epoch_replaces_older() {
        let registry = PartitionRegistry::new();
        let key = ShuffleKey::new("app", 1);
        registry.reserve(&key, vec![location(0, 0, Role::Primary)]);
        registry.reserve(&key, vec![location(0, 1, Role::Primary)]);
        // Stale re-reserve is ignored.
        registry.reserve(&key, vec![location(0, 0, Role::Primary)]);

        assert_eq!(
            registry.lookup(&key, 0, 0, Role::Primary),
            LookupOutcome::StaleEpoch { current_epoch: 1 }
        );
        assert!(matches!(
            registry.lookup(&key, 0, 1, Role::Primary),
            LookupOutcome::Found(_)
        ));
    }

    #[test]
    fn stage_end_closes_all_partitions() {
        let registry = PartitionRegistry::new();
        let key = ShuffleKey::new("app", 1);
        registry.reserve(&key, vec![location(0, 0, Role::Primary)]);
        assert!(registry.mark_stage_end(&key));
        assert_eq!(
            registry.lookup(&key, 0, 0, Role::Primary),
            LookupOutcome::StageEnded
        );
        assert!(!registry.mark_stage_end(&ShuffleKey::new("ghost", 0)));
    }

    #[test]
    fn primary_and_replica_roles_are_tracked_separately() {
        let registry = PartitionRegistry::new();
        let key = ShuffleKey::new("app", 1);
        registry.reserve(
            &key,
            vec![location(0, 0, Role::Primary), location(0, 0, Role::Replica)],
        );
        assert_eq!(registry.registered_partitions(), 2);
        assert!(matches!(
            registry.lookup(&key, 0, 0, Role::Replica),
            LookupOutcome::Found(_)
        ));
    }
}
