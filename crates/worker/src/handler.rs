//! Push request handling.
//!
//! Implements the arrival decision table: memory pause and congestion gates,
//! registry staleness checks, the local write, and the replication fork. A
//! primary acks only after its local flush is enqueued and the replica
//! confirmed; the replica acks as soon as its own flush is scheduled.
//!
//! Replica failure policy: when the replica push fails after retries the
//! whole push fails with `PUSH_DATA_FAIL_REPLICA` even though the local
//! write may have succeeded; the producer requests a fresh epoch and the
//! reader deduplicates any overlap. A replica ack racing a later primary
//! flush abort is resolved deterministically because the writer's notifier
//! is consulted before every subsequent ack.

use std::sync::Arc;

use bytes::Bytes;
use tonic::async_trait;
use tracing::{debug, warn};

use rss_common::metrics::global_metrics;
use rss_common::protocol::{frame_batch, BatchHeader, PushStatus, Role, BATCH_HEADER_LEN};
use rss_common::{MemoryTracker, Result, RssError, ShuffleKey, UserIdentifier};

use crate::congestion::CongestionController;
use crate::registry::{LookupOutcome, PartitionRegistry};
use crate::storage::StorageManager;

/// One decoded push request.
#[derive(Debug, Clone)]
pub struct PushRequest {
    /// Target shuffle.
    pub shuffle_key: ShuffleKey,
    /// Target partition.
    pub partition_id: u32,
    /// Partition incarnation the producer believes is current.
    pub epoch: u32,
    /// Primary push or replicated write.
    pub role: Role,
    /// Producing map task.
    pub map_id: u32,
    /// Producing attempt.
    pub attempt_id: u32,
    /// Batch number within the attempt.
    pub batch_id: u32,
    /// Payload, not yet framed.
    pub body: Bytes,
    /// Producing user, for congestion scoping.
    pub user: UserIdentifier,
}

/// One range of a merged push: pre-framed batches for a single partition.
#[derive(Debug, Clone)]
pub struct MergedRange {
    /// Target partition.
    pub partition_id: u32,
    /// Partition incarnation.
    pub epoch: u32,
    /// Concatenated framed batches.
    pub body: Bytes,
}

/// Forwards a replicated write to the peer worker.
#[async_trait]
pub trait ReplicateForwarder: Send + Sync {
    /// Push the request (already re-roled to `Replica`) at `endpoint`.
    async fn forward(&self, endpoint: &str, request: PushRequest) -> Result<PushStatus>;
}

/// Push decision pipeline for one worker.
pub struct PushHandler {
    registry: Arc<PartitionRegistry>,
    storage: Arc<StorageManager>,
    congestion: Arc<CongestionController>,
    tracker: Arc<MemoryTracker>,
    forwarder: Option<Arc<dyn ReplicateForwarder>>,
    replicate_retries: u32,
}

impl PushHandler {
    /// Assemble the handler. Without a forwarder, pushes to partitions with
    /// a configured peer fail replication.
    pub fn new(
        registry: Arc<PartitionRegistry>,
        storage: Arc<StorageManager>,
        congestion: Arc<CongestionController>,
        tracker: Arc<MemoryTracker>,
        forwarder: Option<Arc<dyn ReplicateForwarder>>,
        replicate_retries: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            storage,
            congestion,
            tracker,
            forwarder,
            replicate_retries,
        })
    }

    /// Handle one `PushData`. Returns the wire status and a diagnostic
    /// message for non-success outcomes.
    pub async fn handle_push_data(&self, request: PushRequest) -> (PushStatus, String) {
        let shuffle_label = request.shuffle_key.to_string();

        if let Some(rejection) = self.admission_gate(&request) {
            global_metrics().record_push_rejected(&shuffle_label, status_label(rejection.0));
            return rejection;
        }

        let location = match self.registry.lookup(
            &request.shuffle_key,
            request.partition_id,
            request.epoch,
            request.role,
        ) {
            LookupOutcome::Found(location) => location,
            LookupOutcome::StaleEpoch { current_epoch } => {
                global_metrics().record_push_rejected(&shuffle_label, "HARD_SPLIT");
                return (
                    PushStatus::HardSplit,
                    format!(
                        "epoch {} is stale, current epoch is {current_epoch}",
                        request.epoch
                    ),
                );
            }
            LookupOutcome::StageEnded => {
                global_metrics().record_push_rejected(&shuffle_label, "STAGE_END");
                return (PushStatus::StageEnd, "partition closed".to_string());
            }
        };

        let framed = frame_batch(
            request.map_id,
            request.attempt_id,
            request.batch_id,
            &request.body,
        );
        let framed_len = framed.len() as u64;

        let replicate = request.role == Role::Primary
            && location.peer().is_some()
            && self.tracker.current_state().admits_replicate();

        let (local, remote) = tokio::join!(
            self.write_local(&request, framed),
            self.fork_to_replica(&request, replicate.then(|| location.peer().cloned()).flatten())
        );

        if let Err(e) = local {
            let status = match (&e, request.role) {
                (RssError::HardSplit(_), _) => PushStatus::HardSplit,
                (_, Role::Primary) => PushStatus::PushDataFailPrimary,
                (_, Role::Replica) => PushStatus::PushDataFailReplica,
            };
            global_metrics().record_push_rejected(&shuffle_label, status_label(status));
            return (status, e.to_string());
        }
        if let Err(e) = remote {
            global_metrics().record_push_rejected(&shuffle_label, "PUSH_DATA_FAIL_REPLICA");
            return (PushStatus::PushDataFailReplica, e.to_string());
        }

        if request.role == Role::Primary {
            self.congestion
                .produce_bytes(&request.user, request.body.len() as u64);
        }
        global_metrics().record_push(&shuffle_label, framed_len);

        if let Ok(writer) = self
            .storage
            .get_or_create_writer(
                &request.shuffle_key,
                request.partition_id,
                request.epoch,
                request.role,
            )
            .await
        {
            if writer.split_if_needed().await.is_some() {
                debug!(
                    partition = request.partition_id,
                    epoch = request.epoch,
                    "advising soft split"
                );
                return (PushStatus::SoftSplit, "partition passed split threshold".to_string());
            }
        }
        (PushStatus::Success, String::new())
    }

    /// Handle one `PushMergedData`: every range shares this endpoint and the
    /// producer's ack covers them all, so the first non-accepted status
    /// wins.
    pub async fn handle_push_merged_data(
        &self,
        shuffle_key: ShuffleKey,
        role: Role,
        user: UserIdentifier,
        ranges: Vec<MergedRange>,
    ) -> (PushStatus, String) {
        let mut soft_split = false;
        for range in ranges {
            let (status, message) = self
                .handle_merged_range(&shuffle_key, role, &user, range)
                .await;
            match status {
                PushStatus::Success => {}
                PushStatus::SoftSplit => soft_split = true,
                other => return (other, message),
            }
        }
        if soft_split {
            (PushStatus::SoftSplit, "partition passed split threshold".to_string())
        } else {
            (PushStatus::Success, String::new())
        }
    }

    async fn handle_merged_range(
        &self,
        shuffle_key: &ShuffleKey,
        role: Role,
        user: &UserIdentifier,
        range: MergedRange,
    ) -> (PushStatus, String) {
        // Merged bodies are pre-framed; walk the headers to recover map ids
        // and re-push each framed batch through the single-batch path.
        let mut cursor = 0usize;
        let mut soft_split = false;
        let body = &range.body;
        while cursor + BATCH_HEADER_LEN <= body.len() {
            let header = match BatchHeader::decode(&body[cursor..]) {
                Ok(header) => header,
                Err(e) => return (PushStatus::PushDataFailPrimary, e.to_string()),
            };
            let payload_start = cursor + BATCH_HEADER_LEN;
            let payload_end = payload_start + header.size as usize;
            if payload_end > body.len() {
                return (
                    PushStatus::PushDataFailPrimary,
                    format!("merged range truncated at batch {}", header.batch_id),
                );
            }
            let request = PushRequest {
                shuffle_key: shuffle_key.clone(),
                partition_id: range.partition_id,
                epoch: range.epoch,
                role,
                map_id: header.map_id,
                attempt_id: header.attempt_id,
                batch_id: header.batch_id,
                body: body.slice(payload_start..payload_end),
                user: user.clone(),
            };
            let (status, message) = self.handle_push_data(request).await;
            if !status.is_accepted() {
                return (status, message);
            }
            if status == PushStatus::SoftSplit {
                soft_split = true;
            }
            cursor = payload_end;
        }
        if cursor != body.len() {
            return (
                PushStatus::PushDataFailPrimary,
                "merged range holds trailing bytes shorter than a header".to_string(),
            );
        }
        if soft_split {
            (PushStatus::SoftSplit, "partition passed split threshold".to_string())
        } else {
            (PushStatus::Success, String::new())
        }
    }

    fn admission_gate(&self, request: &PushRequest) -> Option<(PushStatus, String)> {
        let state = self.tracker.current_state();
        match request.role {
            Role::Primary => {
                if !state.admits_push() {
                    return Some((
                        PushStatus::PausePush,
                        "worker paused under memory pressure".to_string(),
                    ));
                }
                if self.congestion.is_user_congested(&request.user) {
                    return Some((
                        PushStatus::CongestControl,
                        format!("user {} is rate-limited", request.user),
                    ));
                }
            }
            Role::Replica => {
                // Replicated writes ride on an already-admitted primary push
                // and only stop at the replicate threshold.
                if !state.admits_replicate() {
                    return Some((
                        PushStatus::PausePush,
                        "worker paused replication under memory pressure".to_string(),
                    ));
                }
            }
        }
        None
    }

    async fn write_local(&self, request: &PushRequest, framed: Bytes) -> Result<()> {
        let writer = self
            .storage
            .get_or_create_writer(
                &request.shuffle_key,
                request.partition_id,
                request.epoch,
                request.role,
            )
            .await?;
        writer.write(framed, request.map_id).await
    }

    async fn fork_to_replica(
        &self,
        request: &PushRequest,
        peer: Option<rss_common::protocol::PartitionLocation>,
    ) -> Result<()> {
        let Some(peer) = peer else {
            return Ok(());
        };
        let Some(forwarder) = self.forwarder.as_ref() else {
            return Err(RssError::PushDataWriteFailReplica(
                "replica configured but no forwarder available".to_string(),
            ));
        };

        let endpoint = peer.host_and_replicate_port();
        let mut replica_request = request.clone();
        replica_request.role = Role::Replica;
        replica_request.partition_id = peer.partition_id;
        replica_request.epoch = peer.epoch;

        let mut last_error = None;
        for attempt in 0..=self.replicate_retries {
            match forwarder.forward(&endpoint, replica_request.clone()).await {
                Ok(status) if status.is_accepted() => {
                    global_metrics().record_replicate(
                        &request.shuffle_key.to_string(),
                        request.body.len() as u64,
                    );
                    return Ok(());
                }
                Ok(status) => {
                    last_error = Some(RssError::PushDataWriteFailReplica(format!(
                        "replica at {endpoint} answered {:?}",
                        status
                    )));
                }
                Err(e) => last_error = Some(e),
            }
            if attempt < self.replicate_retries {
                warn!(
                    endpoint = %endpoint,
                    attempt = attempt + 1,
                    "replica push failed, retrying"
                );
            }
        }
        Err(last_error.unwrap_or_else(|| {
            RssError::PushDataWriteFailReplica(format!("replica at {endpoint} unreachable"))
        }))
    }
}

fn status_label(status: PushStatus) -> &'static str {
    match status {
        PushStatus::Success => "SUCCESS",
        PushStatus::SoftSplit => "SOFT_SPLIT",
        PushStatus::HardSplit => "HARD_SPLIT",
        PushStatus::StageEnd => "STAGE_END",
        PushStatus::PushDataFailPrimary => "PUSH_DATA_FAIL_PRIMARY",
        PushStatus::PushDataFailReplica => "PUSH_DATA_FAIL_REPLICA",
        PushStatus::CongestControl => "CONGEST_CONTROL",
        PushStatus::PausePush => "PAUSE_PUSH",
    }
}
