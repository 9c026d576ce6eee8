//! Shuffle client facade.
//!
//! One `ShuffleClient` per application process: it owns the push/fetch
//! connection pools, the per-map push states, the running commit-metadata
//! digests, and the fetch-excluded worker set. The pusher and the input
//! stream are built on top of it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tonic::transport::Channel;
use tracing::{debug, warn};

use rss_common::compress::CompressionCodec;
use rss_common::config::ClientConfig;
use rss_common::protocol::{
    frame_batch, CommitMetadata, PartitionLocation, PushStatus, METADATA_BATCH_ID,
};
use rss_common::{Result, RssError, ShuffleKey};
use rss_worker::grpc::{
    push_status_from_proto, v1, FetchServiceClient, PushClientPool,
};

use crate::inflight::PushState;
use crate::location::{EpochChangeCause, LocationProvider};
use crate::reader::{GrpcReaderFactory, PartitionReaderFactory};
use crate::stream::ShuffleInputStream;

/// Expiring set of workers excluded from fetching after failures.
pub struct FetchExcludedSet {
    entries: Mutex<HashMap<String, Instant>>,
    expire_after: Duration,
}

impl FetchExcludedSet {
    /// Empty set whose entries expire after `expire_after`.
    pub fn new(expire_after: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            expire_after,
        })
    }

    /// Record a failed endpoint.
    pub fn exclude(&self, endpoint: &str) {
        self.entries
            .lock()
            .expect("excluded lock")
            .insert(endpoint.to_string(), Instant::now());
    }

    /// Whether a location should be skipped. With both replicas excluded the
    /// older entry is allowed through again so the pair cannot deadlock.
    pub fn is_excluded(&self, location: &PartitionLocation) -> bool {
        let mut entries = self.entries.lock().expect("excluded lock");
        let endpoint = location.host_and_fetch_port();
        let Some(&timestamp) = entries.get(&endpoint) else {
            return false;
        };
        if timestamp.elapsed() > self.expire_after {
            entries.remove(&endpoint);
            return false;
        }
        if let Some(peer) = location.peer() {
            match entries.get(&peer.host_and_fetch_port()) {
                // Peer unexcluded, or excluded after this one: try the peer.
                None => true,
                Some(&peer_timestamp) if peer_timestamp > timestamp => false,
                Some(_) => true,
            }
        } else {
            true
        }
    }
}

/// Producer/consumer client for one application.
pub struct ShuffleClient {
    config: ClientConfig,
    codec: CompressionCodec,
    provider: Arc<dyn LocationProvider>,
    push_clients: Arc<PushClientPool>,
    fetch_clients: tokio::sync::Mutex<HashMap<String, FetchServiceClient<Channel>>>,
    push_states: Mutex<HashMap<String, Arc<PushState>>>,
    commit_metadata: Mutex<HashMap<(String, u32), CommitMetadata>>,
    fetch_excluded: Arc<FetchExcludedSet>,
    reader_factory: Mutex<Option<Arc<dyn PartitionReaderFactory>>>,
}

impl ShuffleClient {
    /// Build a client over the given location provider.
    pub fn new(
        config: ClientConfig,
        codec: CompressionCodec,
        provider: Arc<dyn LocationProvider>,
    ) -> Arc<Self> {
        let fetch_excluded =
            FetchExcludedSet::new(Duration::from_millis(config.fetch_excluded_expire_ms));
        Arc::new(Self {
            config,
            codec,
            provider,
            push_clients: PushClientPool::new(),
            fetch_clients: tokio::sync::Mutex::new(HashMap::new()),
            push_states: Mutex::new(HashMap::new()),
            commit_metadata: Mutex::new(HashMap::new()),
            fetch_excluded,
            reader_factory: Mutex::new(None),
        })
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Payload codec shared by pushes and reads.
    pub fn codec(&self) -> CompressionCodec {
        self.codec
    }

    /// Location provider backing this client.
    pub fn provider(&self) -> &Arc<dyn LocationProvider> {
        &self.provider
    }

    /// Fetch-excluded worker set shared with input streams.
    pub fn fetch_excluded(&self) -> &Arc<FetchExcludedSet> {
        &self.fetch_excluded
    }

    /// Override the partition-reader factory; tests inject in-process
    /// readers here.
    pub fn set_reader_factory(&self, factory: Arc<dyn PartitionReaderFactory>) {
        *self.reader_factory.lock().expect("factory lock") = Some(factory);
    }

    /// Push state scoped to one map attempt.
    pub fn push_state(&self, key: &ShuffleKey, map_id: u32, attempt_id: u32) -> Arc<PushState> {
        let map_key = key.map_key(map_id, attempt_id);
        let mut states = self.push_states.lock().expect("state lock");
        Arc::clone(
            states
                .entry(map_key)
                .or_insert_with(|| PushState::new(&self.config)),
        )
    }

    /// Current push locations, for the push queue's capacity scan.
    pub async fn push_locations(
        &self,
        key: &ShuffleKey,
    ) -> Result<HashMap<u32, PartitionLocation>> {
        self.provider.get_push_locations(key).await
    }

    /// Push one batch of map output for a partition. Returns the bytes
    /// accepted (payload size after compression, plus framing).
    pub async fn push_data(
        &self,
        key: &ShuffleKey,
        map_id: u32,
        attempt_id: u32,
        partition_id: u32,
        payload: &[u8],
    ) -> Result<usize> {
        {
            let map_key = key.map_key(map_id, attempt_id);
            let mut digests = self.commit_metadata.lock().expect("metadata lock");
            digests
                .entry((map_key, partition_id))
                .or_default()
                .add_batch(payload);
        }
        let body = self.codec.compress(payload)?;
        self.push_batch(key, map_id, attempt_id, partition_id, body, None)
            .await
    }

    /// Push batches for several partitions of one map in a single RPC per
    /// destination endpoint.
    pub async fn push_merged_data(
        &self,
        key: &ShuffleKey,
        map_id: u32,
        attempt_id: u32,
        batches: Vec<(u32, Vec<u8>)>,
    ) -> Result<usize> {
        let state = self.push_state(key, map_id, attempt_id);
        state.check()?;
        let locations = self.provider.get_push_locations(key).await?;
        if locations.is_empty() {
            return Err(RssError::StageEnd(format!("shuffle {key} has ended")));
        }

        // Group per destination endpoint, framing each batch client-side.
        let mut grouped: HashMap<String, (Vec<v1::MergedLocation>, Vec<u32>, Vec<u8>)> =
            HashMap::new();
        let mut accepted = 0usize;
        for (partition_id, payload) in batches {
            let location = locations.get(&partition_id).ok_or_else(|| {
                RssError::StageEnd(format!("partition {partition_id} is not registered"))
            })?;
            {
                let map_key = key.map_key(map_id, attempt_id);
                let mut digests = self.commit_metadata.lock().expect("metadata lock");
                digests
                    .entry((map_key, partition_id))
                    .or_default()
                    .add_batch(&payload);
            }
            let compressed = self.codec.compress(&payload)?;
            let batch_id = state.tracker.next_batch_id();
            let framed = frame_batch(map_id, attempt_id, batch_id, &compressed);
            accepted += framed.len();

            let entry = grouped
                .entry(location.host_and_push_port())
                .or_insert_with(|| (Vec::new(), Vec::new(), Vec::new()));
            entry.0.push(v1::MergedLocation {
                partition_id,
                epoch: location.epoch,
            });
            entry.1.push(entry.2.len() as u32);
            entry.2.extend_from_slice(&framed);
        }

        for (endpoint, (merged_locations, offsets, body)) in grouped {
            let mut client = self.push_clients.get(&endpoint).await?;
            let request = v1::PushMergedDataRequest {
                shuffle_key: key.to_string(),
                mode: 0,
                locations: merged_locations,
                offsets,
                body,
                user_tenant: String::new(),
                user_name: String::new(),
            };
            let response = tokio::time::timeout(
                Duration::from_millis(self.config.push_data_timeout_ms),
                client.push_merged_data(request),
            )
            .await
            .map_err(|_| {
                RssError::PushDataTimeout(format!("merged push to {endpoint} timed out"))
            })?
            .map_err(|e| {
                RssError::PushDataConnectionFail(format!("merged push to {endpoint}: {e}"))
            })?
            .into_inner();
            let status = push_status_from_proto(response.status)?;
            if !status.is_accepted() {
                return Err(status_to_error(status, &response.message));
            }
        }
        Ok(accepted)
    }

    /// Finish one map attempt: push the commit-metadata batch for every
    /// partition this attempt wrote, then wait for zero in-flight pushes.
    pub async fn map_end(&self, key: &ShuffleKey, map_id: u32, attempt_id: u32) -> Result<()> {
        let map_key = key.map_key(map_id, attempt_id);
        let digests: Vec<(u32, CommitMetadata)> = {
            let metadata = self.commit_metadata.lock().expect("metadata lock");
            metadata
                .iter()
                .filter(|((k, _), _)| *k == map_key)
                .map(|((_, partition), digest)| (*partition, *digest))
                .collect()
        };
        for (partition_id, digest) in digests {
            let body = self.codec.compress(&digest.encode())?;
            self.push_batch(
                key,
                map_id,
                attempt_id,
                partition_id,
                body,
                Some(METADATA_BATCH_ID),
            )
            .await?;
        }

        let state = self.push_state(key, map_id, attempt_id);
        state.tracker.limit_zero_in_flight(&state).await?;
        state.check()
    }

    /// Build a deduplicating input stream over one reduce partition.
    pub async fn read_partition(
        self: &Arc<Self>,
        key: &ShuffleKey,
        partition_id: u32,
        start_map: u32,
        end_map: u32,
        attempts: Vec<u32>,
        attempt_number: u32,
    ) -> Result<ShuffleInputStream> {
        let locations = self.provider.get_reduce_locations(key, partition_id).await?;
        let factory = {
            let guard = self.reader_factory.lock().expect("factory lock");
            guard.clone()
        }
        .unwrap_or_else(|| GrpcReaderFactory::new(Arc::clone(self)));
        Ok(ShuffleInputStream::new(
            self.config.clone(),
            self.codec,
            key.clone(),
            partition_id,
            locations,
            attempts,
            attempt_number,
            start_map,
            end_map,
            factory,
            Arc::clone(&self.fetch_excluded),
        ))
    }

    /// Fetch client for an endpoint, connecting on first use.
    pub async fn fetch_client(&self, endpoint: &str) -> Result<FetchServiceClient<Channel>> {
        let mut clients = self.fetch_clients.lock().await;
        if let Some(client) = clients.get(endpoint) {
            return Ok(client.clone());
        }
        let client = FetchServiceClient::connect(format!("http://{endpoint}"))
            .await
            .map_err(|e| RssError::FetchFail(format!("connect {endpoint} failed: {e}")))?;
        clients.insert(endpoint.to_string(), client.clone());
        Ok(client)
    }

    async fn push_batch(
        &self,
        key: &ShuffleKey,
        map_id: u32,
        attempt_id: u32,
        partition_id: u32,
        body: Vec<u8>,
        batch_id_override: Option<u32>,
    ) -> Result<usize> {
        let state = self.push_state(key, map_id, attempt_id);
        state.check()?;
        let batch_id = batch_id_override.unwrap_or_else(|| state.tracker.next_batch_id());

        let mut location: Option<PartitionLocation> = None;
        let mut last_error: Option<RssError> = None;

        for attempt in 0..=self.config.push_max_retries {
            let loc = match location.take() {
                Some(loc) => loc,
                None => {
                    let locations = self.provider.get_push_locations(key).await?;
                    if locations.is_empty() {
                        return Err(RssError::StageEnd(format!("shuffle {key} has ended")));
                    }
                    locations
                        .get(&partition_id)
                        .cloned()
                        .ok_or_else(|| {
                            RssError::StageEnd(format!(
                                "partition {partition_id} is not registered"
                            ))
                        })?
                }
            };
            let endpoint = loc.host_and_push_port();

            state
                .tracker
                .limit_max_in_flight(&endpoint, self.config.max_in_flight_per_worker, &state)
                .await?;
            let guard = state.tracker.track(&endpoint, batch_id);

            let outcome = self
                .send_push(key, &loc, map_id, attempt_id, batch_id, &body)
                .await;
            drop(guard);

            match outcome {
                Ok(PushStatus::Success) => return Ok(body.len()),
                Ok(PushStatus::SoftSplit) => {
                    // Accepted; fetch the next epoch so later batches land in
                    // the new incarnation.
                    if let Err(e) = self
                        .provider
                        .request_new_epoch(key, partition_id, loc.epoch, EpochChangeCause::Split)
                        .await
                    {
                        debug!(error = %e, "soft split epoch request failed");
                    }
                    return Ok(body.len());
                }
                Ok(PushStatus::HardSplit) => {
                    last_error =
                        Some(RssError::HardSplit(format!("partition {partition_id} split")));
                    location = Some(
                        self.provider
                            .request_new_epoch(key, partition_id, loc.epoch, EpochChangeCause::Split)
                            .await?,
                    );
                }
                Ok(PushStatus::StageEnd) => {
                    return Err(RssError::StageEnd(format!("shuffle {key} has ended")))
                }
                Ok(PushStatus::CongestControl) | Ok(PushStatus::PausePush) => {
                    last_error = Some(RssError::PushDataCongestControl(format!(
                        "worker {endpoint} throttled the push"
                    )));
                    tokio::time::sleep(Duration::from_millis(self.config.retry_wait_ms)).await;
                    location = Some(loc);
                }
                Ok(status) => {
                    // Primary or replica write failure: exclude the worker
                    // and move to a fresh epoch.
                    last_error = Some(status_to_error(status, "push write failed"));
                    self.handle_push_failure(key, &loc, partition_id, &mut location, attempt)
                        .await;
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "push transport failure");
                    self.push_clients.evict(&endpoint).await;
                    self.provider.report_worker_failure(&endpoint, &e).await;
                    last_error = Some(e);
                    self.handle_push_failure(key, &loc, partition_id, &mut location, attempt)
                        .await;
                }
            }
        }

        let err = last_error.unwrap_or_else(|| {
            RssError::PushDataConnectionFail(format!(
                "push for partition {partition_id} exhausted retries"
            ))
        });
        state.record_error(crate::inflight::replicate_error(&err));
        Err(err)
    }

    async fn handle_push_failure(
        &self,
        key: &ShuffleKey,
        loc: &PartitionLocation,
        partition_id: u32,
        location: &mut Option<PartitionLocation>,
        attempt: u32,
    ) {
        self.fetch_excluded.exclude(&loc.host_and_fetch_port());
        match self
            .provider
            .request_new_epoch(key, partition_id, loc.epoch, EpochChangeCause::PushFailure)
            .await
        {
            Ok(next) => *location = Some(next),
            Err(e) => {
                debug!(attempt, error = %e, "no fresh epoch available, retrying current location");
                *location = Some(loc.clone());
            }
        }
    }

    async fn send_push(
        &self,
        key: &ShuffleKey,
        loc: &PartitionLocation,
        map_id: u32,
        attempt_id: u32,
        batch_id: u32,
        body: &[u8],
    ) -> Result<PushStatus> {
        let endpoint = loc.host_and_push_port();
        let mut client = self.push_clients.get(&endpoint).await?;
        let request = v1::PushDataRequest {
            shuffle_key: key.to_string(),
            partition_id: loc.partition_id,
            epoch: loc.epoch,
            mode: 0,
            map_id,
            attempt_id,
            batch_id,
            body: body.to_vec(),
            user_tenant: String::new(),
            user_name: String::new(),
        };
        let response = tokio::time::timeout(
            Duration::from_millis(self.config.push_data_timeout_ms),
            client.push_data(request),
        )
        .await
        .map_err(|_| RssError::PushDataTimeout(format!("push to {endpoint} timed out")))?
        .map_err(|e| RssError::PushDataConnectionFail(format!("push to {endpoint}: {e}")))?
        .into_inner();
        push_status_from_proto(response.status)
    }
}

fn status_to_error(status: PushStatus, message: &str) -> RssError {
    match status {
        PushStatus::PushDataFailPrimary => RssError::PushDataWriteFailPrimary(message.to_string()),
        PushStatus::PushDataFailReplica => RssError::PushDataWriteFailReplica(message.to_string()),
        PushStatus::HardSplit => RssError::HardSplit(message.to_string()),
        PushStatus::StageEnd => RssError::StageEnd(message.to_string()),
        PushStatus::CongestControl | PushStatus::PausePush => {
            RssError::PushDataCongestControl(message.to_string())
        }
        PushStatus::Success | PushStatus::SoftSplit => {
            RssError::PushDataConnectionFail(format!("unexpected status for failure: {message}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rss_common::protocol::{Role, StorageHint};

    fn location(fetch_port: u16, peer_fetch_port: Option<u16>) -> PartitionLocation {
        let peer = peer_fetch_port.map(|port| {
            Box::new(PartitionLocation {
                partition_id: 0,
                epoch: 0,
                host: "peer".to_string(),
                rpc_port: 1,
                push_port: 2,
                fetch_port: port,
                replicate_port: 4,
                role: Role::Replica,
                peer: None,
                storage: StorageHint::Hdd,
                disk_mount: "/tmp".to_string(),
            })
        });
        PartitionLocation {
            partition_id: 0,
            epoch: 0,
            host: "primary".to_string(),
            rpc_port: 1,
            push_port: 2,
            fetch_port,
            replicate_port: 4,
            role: Role::Primary,
            peer,
            storage: StorageHint::Hdd,
            disk_mount: "/tmp".to_string(),
        }
    }

    #[test]
    fn excluded_set_expires_entries() {
        let set = FetchExcludedSet::new(Duration::from_millis(20));
        let loc = location(9002, None);
        set.exclude(&loc.host_and_fetch_port());
        assert!(set.is_excluded(&loc));
        std::thread::sleep(Duration::from_millis(40));
        assert!(!set.is_excluded(&loc));
    }

    #[test]
    fn excluded_pair_falls_back_to_older_entry() {
        let set = FetchExcludedSet::new(Duration::from_secs(60));
        let loc = location(9002, Some(9102));

        // Only the primary excluded: skip it, the peer is healthy.
        set.exclude(&loc.host_and_fetch_port());
        assert!(set.is_excluded(&loc));

        // Peer excluded afterwards: the primary is the older entry, use it.
        std::thread::sleep(Duration::from_millis(5));
        set.exclude(&loc.peer().unwrap().host_and_fetch_port());
        assert!(!set.is_excluded(&loc));
    }
}
