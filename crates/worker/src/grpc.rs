//! gRPC service/client glue for the worker data plane.
//!
//! RPC schema source: `proto/rss_worker.proto`.
//!
//! Data-plane RPCs (generated under [`v1`]):
//! - `PushData`, `PushMergedData`
//! - `OpenStream`, `StreamChunks` (bidirectional, credit-gated)
//!
//! Control RPCs driven by the lifecycle manager:
//! - `ReservePartitions`, `StageEnd`, `UnregisterShuffle`
//!
//! Push acknowledgements travel in-band as [`v1::PushStatus`]; tonic-level
//! errors are reserved for transport and malformed-request failures.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::transport::Channel;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};

use rss_common::metrics::global_metrics;
use rss_common::protocol::{PartitionLocation, PushStatus, Role, StorageHint};
use rss_common::{Result, RssError, ShuffleKey, UserIdentifier};

use crate::handler::{MergedRange, PushRequest, ReplicateForwarder};
use crate::worker::Worker;

#[allow(missing_docs)]
pub mod v1 {
    tonic::include_proto!("rss.worker.v1");
}

pub use v1::control_service_client::ControlServiceClient;
pub use v1::control_service_server::{ControlService, ControlServiceServer};
pub use v1::fetch_service_client::FetchServiceClient;
pub use v1::fetch_service_server::{FetchService, FetchServiceServer};
pub use v1::push_service_client::PushServiceClient;
pub use v1::push_service_server::{PushService, PushServiceServer};

/// Combined gRPC service implementation backed by one [`Worker`].
#[derive(Clone)]
pub struct WorkerServices {
    worker: Arc<Worker>,
}

impl WorkerServices {
    /// Expose a worker's data plane over gRPC.
    pub fn new(worker: Arc<Worker>) -> Self {
        Self { worker }
    }

    /// Shared worker behind these services.
    pub fn worker(&self) -> Arc<Worker> {
        Arc::clone(&self.worker)
    }
}

#[tonic::async_trait]
impl PushService for WorkerServices {
    async fn push_data(
        &self,
        request: Request<v1::PushDataRequest>,
    ) -> std::result::Result<Response<v1::PushDataResponse>, Status> {
        let req = request.into_inner();
        let push = PushRequest {
            shuffle_key: parse_shuffle_key(&req.shuffle_key)?,
            partition_id: req.partition_id,
            epoch: req.epoch,
            role: role_from_mode(req.mode)?,
            map_id: req.map_id,
            attempt_id: req.attempt_id,
            batch_id: req.batch_id,
            body: Bytes::from(req.body),
            user: user_from_parts(req.user_tenant, req.user_name),
        };
        let (status, message) = self.worker.handler().handle_push_data(push).await;
        Ok(Response::new(v1::PushDataResponse {
            status: push_status_to_proto(status) as i32,
            message,
        }))
    }

    async fn push_merged_data(
        &self,
        request: Request<v1::PushMergedDataRequest>,
    ) -> std::result::Result<Response<v1::PushMergedDataResponse>, Status> {
        let req = request.into_inner();
        if req.locations.len() != req.offsets.len() {
            return Err(Status::invalid_argument(
                "merged push locations and offsets must align",
            ));
        }
        let body = Bytes::from(req.body);
        let mut ranges = Vec::with_capacity(req.locations.len());
        for (index, location) in req.locations.iter().enumerate() {
            let start = req.offsets[index] as usize;
            let end = req
                .offsets
                .get(index + 1)
                .map(|o| *o as usize)
                .unwrap_or(body.len());
            if start > end || end > body.len() {
                return Err(Status::invalid_argument(format!(
                    "merged offset range {start}..{end} outside body of {} bytes",
                    body.len()
                )));
            }
            ranges.push(MergedRange {
                partition_id: location.partition_id,
                epoch: location.epoch,
                body: body.slice(start..end),
            });
        }
        let (status, message) = self
            .worker
            .handler()
            .handle_push_merged_data(
                parse_shuffle_key(&req.shuffle_key)?,
                role_from_mode(req.mode)?,
                user_from_parts(req.user_tenant, req.user_name),
                ranges,
            )
            .await;
        Ok(Response::new(v1::PushMergedDataResponse {
            status: push_status_to_proto(status) as i32,
            message,
        }))
    }
}

#[tonic::async_trait]
impl FetchService for WorkerServices {
    async fn open_stream(
        &self,
        request: Request<v1::OpenStreamRequest>,
    ) -> std::result::Result<Response<v1::OpenStreamResponse>, Status> {
        let req = request.into_inner();
        let key = parse_shuffle_key(&req.shuffle_key)?;
        let handle = self
            .worker
            .open_stream(
                &key,
                &req.file_name,
                req.start_map,
                req.end_map,
                req.initial_credit,
            )
            .await
            .map_err(to_status)?;
        Ok(Response::new(v1::OpenStreamResponse {
            stream_id: handle.stream_id,
            num_chunks: handle.num_chunks(),
            chunk_offsets: handle.chunk_offsets.clone(),
        }))
    }

    type StreamChunksStream =
        Pin<Box<dyn Stream<Item = std::result::Result<v1::ChunkData, Status>> + Send>>;

    async fn stream_chunks(
        &self,
        request: Request<Streaming<v1::ReadAddCredit>>,
    ) -> std::result::Result<Response<Self::StreamChunksStream>, Status> {
        let mut inbound = request.into_inner();
        let first = inbound
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("chunk stream opened without a credit grant"))?;

        let streams = Arc::clone(self.worker.streams());
        let handle = streams.get(first.stream_id).map_err(to_status)?;
        streams.add_credit(first.stream_id, first.credit);

        // Credit pump: every inbound grant adds permits until the reader
        // closes its side.
        let pump_streams = Arc::clone(&streams);
        tokio::spawn(async move {
            while let Ok(Some(grant)) = inbound.message().await {
                pump_streams.add_credit(grant.stream_id, grant.credit);
            }
        });

        let congestion = Arc::clone(self.worker.congestion());
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            let num_chunks = handle.num_chunks();
            for chunk_index in 0..num_chunks {
                if let Err(e) = streams.wait_credit(&handle).await {
                    let _ = tx.send(Err(to_status(e))).await;
                    break;
                }
                let path = handle.path.clone();
                let offsets = handle.chunk_offsets.clone();
                let read = tokio::task::spawn_blocking(move || {
                    crate::fetch::read_chunk(&path, &offsets, chunk_index)
                })
                .await;
                let payload = match read {
                    Ok(Ok(payload)) => payload,
                    Ok(Err(e)) => {
                        let _ = tx.send(Err(to_status(e))).await;
                        break;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(Status::internal(e.to_string()))).await;
                        break;
                    }
                };
                global_metrics().record_fetch_chunk(&handle.shuffle_key, payload.len() as u64);
                congestion.consume_bytes(payload.len() as u64);
                let chunk = v1::ChunkData {
                    stream_id: handle.stream_id,
                    chunk_index,
                    backlog: num_chunks - chunk_index - 1,
                    offset: handle.chunk_offsets[chunk_index as usize],
                    payload,
                };
                if tx.send(Ok(chunk)).await.is_err() {
                    debug!(stream_id = handle.stream_id, "reader dropped chunk stream");
                    break;
                }
            }
            streams.release(handle.stream_id);
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

#[tonic::async_trait]
impl ControlService for WorkerServices {
    async fn reserve_partitions(
        &self,
        request: Request<v1::ReservePartitionsRequest>,
    ) -> std::result::Result<Response<v1::ReservePartitionsResponse>, Status> {
        let req = request.into_inner();
        let key = parse_shuffle_key(&req.shuffle_key)?;
        let locations = req
            .partitions
            .iter()
            .map(location_from_proto)
            .collect::<Result<Vec<_>>>()
            .map_err(to_status)?;
        match self.worker.reserve_partitions(&key, locations) {
            Ok(()) => Ok(Response::new(v1::ReservePartitionsResponse {
                success: true,
                message: String::new(),
            })),
            Err(e) => Ok(Response::new(v1::ReservePartitionsResponse {
                success: false,
                message: e.to_string(),
            })),
        }
    }

    async fn stage_end(
        &self,
        request: Request<v1::StageEndRequest>,
    ) -> std::result::Result<Response<v1::StageEndResponse>, Status> {
        let req = request.into_inner();
        let key = parse_shuffle_key(&req.shuffle_key)?;
        let committed = self.worker.stage_end(&key).await.map_err(to_status)?;
        Ok(Response::new(v1::StageEndResponse {
            committed_files: committed
                .into_iter()
                .map(|(file_name, chunk_offsets)| v1::CommittedFile {
                    file_name,
                    chunk_offsets,
                })
                .collect(),
        }))
    }

    async fn unregister_shuffle(
        &self,
        request: Request<v1::UnregisterShuffleRequest>,
    ) -> std::result::Result<Response<v1::UnregisterShuffleResponse>, Status> {
        let req = request.into_inner();
        let key = parse_shuffle_key(&req.shuffle_key)?;
        self.worker
            .unregister_shuffle(&key)
            .await
            .map_err(to_status)?;
        Ok(Response::new(v1::UnregisterShuffleResponse {}))
    }
}

/// Connection cache of push clients keyed by `host:port`.
pub struct PushClientPool {
    clients: Mutex<HashMap<String, PushServiceClient<Channel>>>,
}

impl PushClientPool {
    /// Empty pool; connections open on first use.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clients: Mutex::new(HashMap::new()),
        })
    }

    /// Client for an endpoint, connecting if none is cached.
    pub async fn get(&self, endpoint: &str) -> Result<PushServiceClient<Channel>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(endpoint) {
            return Ok(client.clone());
        }
        let client = PushServiceClient::connect(format!("http://{endpoint}"))
            .await
            .map_err(|e| {
                RssError::PushDataConnectionFail(format!("connect {endpoint} failed: {e}"))
            })?;
        clients.insert(endpoint.to_string(), client.clone());
        Ok(client)
    }

    /// Drop a cached client after a transport failure so the next call
    /// reconnects.
    pub async fn evict(&self, endpoint: &str) {
        self.clients.lock().await.remove(endpoint);
    }
}

/// Replication forwarder backed by the push client pool.
pub struct GrpcReplicateForwarder {
    pool: Arc<PushClientPool>,
}

impl GrpcReplicateForwarder {
    /// Forwarder sharing the given connection pool.
    pub fn new(pool: Arc<PushClientPool>) -> Arc<Self> {
        Arc::new(Self { pool })
    }
}

#[tonic::async_trait]
impl ReplicateForwarder for GrpcReplicateForwarder {
    async fn forward(&self, endpoint: &str, request: PushRequest) -> Result<PushStatus> {
        let mut client = self.pool.get(endpoint).await?;
        let response = client
            .push_data(push_request_to_proto(&request))
            .await
            .map_err(|e| {
                warn!(endpoint, error = %e, "replica push transport failure");
                RssError::PushDataConnectionFail(format!("replica push to {endpoint}: {e}"))
            });
        match response {
            Ok(response) => push_status_from_proto(response.into_inner().status),
            Err(e) => {
                self.pool.evict(endpoint).await;
                Err(e)
            }
        }
    }
}

/// Serve push, fetch, and control services on one socket.
pub async fn serve(worker: Arc<Worker>, addr: std::net::SocketAddr) -> Result<()> {
    let services = WorkerServices::new(worker);
    tonic::transport::Server::builder()
        .add_service(PushServiceServer::new(services.clone()))
        .add_service(FetchServiceServer::new(services.clone()))
        .add_service(ControlServiceServer::new(services))
        .serve(addr)
        .await
        .map_err(|e| RssError::PushDataConnectionFail(format!("worker server failed: {e}")))
}

/// Parse the `app-shuffleId` rendering used on the wire.
pub fn parse_shuffle_key(raw: &str) -> std::result::Result<ShuffleKey, Status> {
    let (app_id, shuffle_id) = raw
        .rsplit_once('-')
        .ok_or_else(|| Status::invalid_argument(format!("malformed shuffle key: {raw}")))?;
    let shuffle_id = shuffle_id
        .parse::<u32>()
        .map_err(|_| Status::invalid_argument(format!("malformed shuffle key: {raw}")))?;
    Ok(ShuffleKey::new(app_id, shuffle_id))
}

fn user_from_parts(tenant: String, name: String) -> UserIdentifier {
    if tenant.is_empty() && name.is_empty() {
        UserIdentifier::new("default", "default")
    } else {
        UserIdentifier::new(tenant, name)
    }
}

/// Map a handler status onto the wire enum.
pub fn push_status_to_proto(status: PushStatus) -> v1::PushStatus {
    match status {
        PushStatus::Success => v1::PushStatus::Success,
        PushStatus::SoftSplit => v1::PushStatus::SoftSplit,
        PushStatus::HardSplit => v1::PushStatus::HardSplit,
        PushStatus::StageEnd => v1::PushStatus::StageEnd,
        PushStatus::PushDataFailPrimary => v1::PushStatus::PushDataFailPrimary,
        PushStatus::PushDataFailReplica => v1::PushStatus::PushDataFailReplica,
        PushStatus::CongestControl => v1::PushStatus::CongestControl,
        PushStatus::PausePush => v1::PushStatus::PausePush,
    }
}

/// Decode the wire enum, rejecting unknown values.
pub fn push_status_from_proto(value: i32) -> Result<PushStatus> {
    let parsed = v1::PushStatus::try_from(value)
        .map_err(|_| RssError::PushDataConnectionFail(format!("invalid push status {value}")))?;
    match parsed {
        v1::PushStatus::Success => Ok(PushStatus::Success),
        v1::PushStatus::SoftSplit => Ok(PushStatus::SoftSplit),
        v1::PushStatus::HardSplit => Ok(PushStatus::HardSplit),
        v1::PushStatus::StageEnd => Ok(PushStatus::StageEnd),
        v1::PushStatus::PushDataFailPrimary => Ok(PushStatus::PushDataFailPrimary),
        v1::PushStatus::PushDataFailReplica => Ok(PushStatus::PushDataFailReplica),
        v1::PushStatus::CongestControl => Ok(PushStatus::CongestControl),
        v1::PushStatus::PausePush => Ok(PushStatus::PausePush),
        v1::PushStatus::Unspecified => Err(RssError::PushDataConnectionFail(
            "push status unspecified".to_string(),
        )),
    }
}

/// Build the wire form of a push request.
pub fn push_request_to_proto(request: &PushRequest) -> v1::PushDataRequest {
    v1::PushDataRequest {
        shuffle_key: request.shuffle_key.to_string(),
        partition_id: request.partition_id,
        epoch: request.epoch,
        mode: match request.role {
            Role::Primary => 0,
            Role::Replica => 1,
        },
        map_id: request.map_id,
        attempt_id: request.attempt_id,
        batch_id: request.batch_id,
        body: request.body.to_vec(),
        user_tenant: request.user.tenant.clone(),
        user_name: request.user.name.clone(),
    }
}

fn role_from_mode(mode: u32) -> std::result::Result<Role, Status> {
    match mode {
        0 => Ok(Role::Primary),
        1 => Ok(Role::Replica),
        other => Err(Status::invalid_argument(format!("invalid push mode {other}"))),
    }
}

/// Encode a location, carrying the peer one hop only.
pub fn location_to_proto(location: &PartitionLocation) -> v1::PartitionLocationProto {
    v1::PartitionLocationProto {
        partition_id: location.partition_id,
        epoch: location.epoch,
        host: location.host.clone(),
        rpc_port: location.rpc_port as u32,
        push_port: location.push_port as u32,
        fetch_port: location.fetch_port as u32,
        replicate_port: location.replicate_port as u32,
        mode: location.role.as_byte() as u32,
        storage: storage_to_proto(location.storage),
        disk_mount: location.disk_mount.clone(),
        peer: location
            .peer()
            .map(|peer| Box::new(location_to_proto(&peer.without_peer()))),
    }
}

/// Decode a location from the wire.
pub fn location_from_proto(proto: &v1::PartitionLocationProto) -> Result<PartitionLocation> {
    Ok(PartitionLocation {
        partition_id: proto.partition_id,
        epoch: proto.epoch,
        host: proto.host.clone(),
        rpc_port: proto.rpc_port as u16,
        push_port: proto.push_port as u16,
        fetch_port: proto.fetch_port as u16,
        replicate_port: proto.replicate_port as u16,
        role: Role::from_byte(proto.mode as u8)?,
        peer: match proto.peer.as_deref() {
            Some(peer) => Some(Box::new(location_from_proto(peer)?)),
            None => None,
        },
        storage: storage_from_proto(proto.storage)?,
        disk_mount: proto.disk_mount.clone(),
    })
}

fn storage_to_proto(storage: StorageHint) -> u32 {
    match storage {
        StorageHint::Memory => 0,
        StorageHint::Ssd => 1,
        StorageHint::Hdd => 2,
        StorageHint::Hdfs => 3,
        StorageHint::S3 => 4,
    }
}

fn storage_from_proto(value: u32) -> Result<StorageHint> {
    match value {
        0 => Ok(StorageHint::Memory),
        1 => Ok(StorageHint::Ssd),
        2 => Ok(StorageHint::Hdd),
        3 => Ok(StorageHint::Hdfs),
        4 => Ok(StorageHint::S3),
        other => Err(RssError::InvalidConfig(format!(
            "unknown storage hint {other}"
        ))),
    }
}

/// Map internal errors onto tonic statuses at the RPC boundary.
pub fn to_status(err: RssError) -> Status {
    match err {
        RssError::InvalidConfig(msg) => Status::invalid_argument(msg),
        RssError::FetchFail(msg) => Status::not_found(msg),
        RssError::StageEnd(msg) => Status::failed_precondition(msg),
        RssError::WorkerBusy(msg) => Status::resource_exhausted(msg),
        RssError::Unsupported(msg) => Status::unimplemented(msg),
        other => Status::internal(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shuffle_key_parses_app_ids_containing_dashes() {
        let key = parse_shuffle_key("spark-app-17-3").unwrap();
        assert_eq!(key.app_id, "spark-app-17");
        assert_eq!(key.shuffle_id, 3);
        assert!(parse_shuffle_key("no-trailing-id-x").is_err());
    }

    #[test]
    fn push_status_round_trips() {
        for status in [
            PushStatus::Success,
            PushStatus::SoftSplit,
            PushStatus::HardSplit,
            PushStatus::StageEnd,
            PushStatus::PushDataFailPrimary,
            PushStatus::PushDataFailReplica,
            PushStatus::CongestControl,
            PushStatus::PausePush,
        ] {
            let wire = push_status_to_proto(status) as i32;
            assert_eq!(push_status_from_proto(wire).unwrap(), status);
        }
        assert!(push_status_from_proto(0).is_err());
        assert!(push_status_from_proto(99).is_err());
    }

    #[test]
    fn location_round_trips_with_one_hop_peer() {
        let peer = PartitionLocation {
            partition_id: 1,
            epoch: 2,
            host: "replica-host".to_string(),
            rpc_port: 1,
            push_port: 2,
            fetch_port: 3,
            replicate_port: 4,
            role: Role::Replica,
            peer: None,
            storage: StorageHint::Ssd,
            disk_mount: "/mnt/b".to_string(),
        };
        let primary = PartitionLocation {
            partition_id: 1,
            epoch: 2,
            host: "primary-host".to_string(),
            rpc_port: 5,
            push_port: 6,
            fetch_port: 7,
            replicate_port: 8,
            role: Role::Primary,
            peer: Some(Box::new(peer)),
            storage: StorageHint::Hdd,
            disk_mount: "/mnt/a".to_string(),
        };

        let decoded = location_from_proto(&location_to_proto(&primary)).unwrap();
        assert_eq!(decoded, primary);
        assert_eq!(decoded.peer().unwrap().host, "replica-host");
        assert!(decoded.peer().unwrap().peer().is_none());
    }
}
