//! End-to-end push → flush → stage end → fetch → verify flows over real
//! gRPC transports on loopback.

use std::net::SocketAddr;
use std::sync::Arc;

use rss_client::{LocationProvider, ShuffleClient, StaticLocationProvider};
use rss_common::compress::CompressionCodec;
use rss_common::config::ClientConfig;
use rss_common::protocol::{PartitionLocation, Role, StorageHint};
use rss_common::{RssError, ShuffleKey};
use rss_worker::grpc::{
    ControlServiceServer, FetchServiceServer, GrpcReplicateForwarder, PushClientPool,
    PushServiceServer, WorkerServices,
};
use rss_worker::{Worker, WorkerConfig};
use tokio_stream::wrappers::TcpListenerStream;

struct TestWorker {
    worker: Arc<Worker>,
    addr: SocketAddr,
    _server: tokio::task::JoinHandle<()>,
    _background: Vec<tokio::task::JoinHandle<()>>,
    _mount: tempfile::TempDir,
}

async fn start_worker(worker_id: &str) -> TestWorker {
    let mount = tempfile::tempdir().expect("mount dir");
    let mut config = WorkerConfig {
        worker_id: worker_id.to_string(),
        ..WorkerConfig::default()
    };
    config.storage.mounts = vec![mount.path().to_string_lossy().to_string()];
    config.storage.flush_buffer_size = 64;
    config.storage.chunk_size = 2048;

    let pool = PushClientPool::new();
    let forwarder = GrpcReplicateForwarder::new(pool);
    let worker = Worker::new(config, Some(forwarder));
    let background = worker.spawn_background();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    let services = WorkerServices::new(Arc::clone(&worker));
    let server = tokio::spawn(async move {
        let _ = tonic::transport::Server::builder()
            .add_service(PushServiceServer::new(services.clone()))
            .add_service(FetchServiceServer::new(services.clone()))
            .add_service(ControlServiceServer::new(services))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await;
    });

    TestWorker {
        worker,
        addr,
        _server: server,
        _background: background,
        _mount: mount,
    }
}

fn location(
    partition_id: u32,
    epoch: u32,
    role: Role,
    addr: SocketAddr,
    peer: Option<Box<PartitionLocation>>,
) -> PartitionLocation {
    PartitionLocation {
        partition_id,
        epoch,
        host: addr.ip().to_string(),
        rpc_port: addr.port(),
        push_port: addr.port(),
        fetch_port: addr.port(),
        replicate_port: addr.port(),
        role,
        peer,
        storage: StorageHint::Ssd,
        disk_mount: String::new(),
    }
}

fn client_config() -> ClientConfig {
    ClientConfig {
        push_queue_capacity: 16,
        max_in_flight_per_worker: 4,
        push_data_timeout_ms: 10_000,
        retry_wait_ms: 50,
        fetch_max_retries_per_replica: 2,
        ..ClientConfig::default()
    }
}

fn payload(map_id: u32, batch_id: u32) -> Vec<u8> {
    let mut data = vec![0u8; 1024];
    for (index, byte) in data.iter_mut().enumerate() {
        *byte = (map_id as usize + batch_id as usize + index) as u8;
    }
    data
}

/// Two maps push 15 KiB total into one partition; the consumer reads it all
/// back exactly once with the integrity check passing.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_partition_push_and_read_back() {
    let tw = start_worker("worker-a").await;
    let key = ShuffleKey::new("app-e2e", 0);
    let primary = location(0, 0, Role::Primary, tw.addr, None);
    tw.worker
        .reserve_partitions(&key, vec![primary.clone()])
        .expect("reserve");

    let provider = Arc::new(StaticLocationProvider::new(vec![primary]));
    let client = ShuffleClient::new(client_config(), CompressionCodec::Lz4, provider);

    // Map 0 pushes through the full pusher pipeline (idle slots, working
    // queue, in-flight caps); map 1 through the client facade directly.
    let mut expected_bytes = 0usize;
    let pusher = rss_client::DataPusher::new(Arc::clone(&client), key.clone(), 0, 0, 1);
    for batch_id in 0..10u32 {
        let data = payload(0, batch_id);
        expected_bytes += data.len();
        pusher.add_task(0, &data).await.expect("add task");
    }
    pusher.wait_on_termination().await.expect("pusher drained");
    assert!(pusher.pushed_bytes()[0] > 0);
    client.map_end(&key, 0, 0).await.expect("map 0 end");

    for batch_id in 0..5u32 {
        let data = payload(1, batch_id);
        expected_bytes += data.len();
        client
            .push_data(&key, 1, 0, 0, &data)
            .await
            .expect("push");
    }
    client.map_end(&key, 1, 0).await.expect("map 1 end");

    let committed = tw.worker.stage_end(&key).await.expect("stage end");
    assert_eq!(committed.len(), 1);
    let offsets = &committed[0].1;
    assert_eq!(offsets[0], 0);
    assert!(offsets.windows(2).all(|p| p[0] < p[1]));

    let mut stream = client
        .read_partition(&key, 0, 0, 2, vec![0, 0], 0)
        .await
        .expect("open read");
    let delivered = stream.read_to_end().await.expect("read");
    assert_eq!(delivered.len(), expected_bytes);
    assert_eq!(stream.expected_commit_metadata().len(), 2);
    stream.close().expect("close verified");
}

/// A replicated partition serves the same batches from both sides; reading
/// primary then replica delivers each batch exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replica_overlap_is_deduplicated() {
    let tw1 = start_worker("worker-a").await;
    let tw2 = start_worker("worker-b").await;
    let key = ShuffleKey::new("app-rep", 0);

    let replica = location(0, 0, Role::Replica, tw2.addr, None);
    let primary = location(0, 0, Role::Primary, tw1.addr, Some(Box::new(replica.clone())));
    tw1.worker
        .reserve_partitions(&key, vec![primary.clone()])
        .expect("reserve primary");
    tw2.worker
        .reserve_partitions(&key, vec![replica.clone()])
        .expect("reserve replica");

    let provider = Arc::new(StaticLocationProvider::new(vec![primary.clone()]));
    let client = ShuffleClient::new(client_config(), CompressionCodec::Lz4, provider);

    let mut expected_bytes = 0usize;
    for map_id in 0..2u32 {
        let batches = if map_id == 0 { 10 } else { 5 };
        for batch_id in 0..batches {
            let data = payload(map_id, batch_id);
            expected_bytes += data.len();
            client
                .push_data(&key, map_id, 0, 0, &data)
                .await
                .expect("push");
        }
        client.map_end(&key, map_id, 0).await.expect("map end");
    }

    tw1.worker.stage_end(&key).await.expect("stage end primary");
    tw2.worker.stage_end(&key).await.expect("stage end replica");

    // Read both incarnations: every batch arrives twice on the wire, once
    // per replica, and must be delivered once.
    let mut stream = rss_client::ShuffleInputStream::new(
        client_config(),
        CompressionCodec::Lz4,
        key.clone(),
        0,
        vec![primary, replica],
        vec![0, 0],
        0,
        0,
        2,
        rss_client::GrpcReaderFactory::new(Arc::clone(&client)),
        Arc::clone(client.fetch_excluded()),
    );
    let delivered = stream.read_to_end().await.expect("read");
    assert_eq!(delivered.len(), expected_bytes);
    assert_eq!(stream.partitions_read(), 2);
    stream.close().expect("close verified");
}

/// Pushing past the split threshold answers SOFT_SPLIT; the producer moves
/// to the staged next epoch and the consumer reads both epochs in order.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn soft_split_moves_producer_to_next_epoch() {
    let mount = tempfile::tempdir().expect("mount dir");
    let mut config = WorkerConfig {
        worker_id: "worker-split".to_string(),
        ..WorkerConfig::default()
    };
    config.storage.mounts = vec![mount.path().to_string_lossy().to_string()];
    config.storage.flush_buffer_size = 64;
    config.storage.chunk_size = 2048;
    config.storage.split_threshold = 4 * 1024;

    let worker = Worker::new(config, None);
    let background = worker.spawn_background();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    let services = WorkerServices::new(Arc::clone(&worker));
    let server = tokio::spawn(async move {
        let _ = tonic::transport::Server::builder()
            .add_service(PushServiceServer::new(services.clone()))
            .add_service(FetchServiceServer::new(services.clone()))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await;
    });

    let key = ShuffleKey::new("app-split", 0);
    let epoch0 = location(0, 0, Role::Primary, addr, None);
    let epoch1 = location(0, 1, Role::Primary, addr, None);
    worker
        .reserve_partitions(&key, vec![epoch0.clone()])
        .expect("reserve epoch 0");

    let provider = Arc::new(StaticLocationProvider::new(vec![
        epoch0.clone(),
        epoch1.clone(),
    ]));
    let client = ShuffleClient::new(
        client_config(),
        CompressionCodec::None,
        Arc::clone(&provider) as Arc<dyn rss_client::LocationProvider>,
    );

    // 8 KiB against a 4 KiB threshold: the split lands mid-way.
    let mut expected_bytes = 0usize;
    for batch_id in 0..8u32 {
        let data = payload(0, batch_id);
        expected_bytes += data.len();
        client.push_data(&key, 0, 0, 0, &data).await.expect("push");
        // The soft-split answer advances the provider; register the new
        // epoch on the worker the way the lifecycle manager would.
        if provider
            .get_push_locations(&key)
            .await
            .expect("locations")
            .get(&0)
            .map(|l| l.epoch)
            == Some(1)
        {
            worker
                .reserve_partitions(&key, vec![epoch1.clone()])
                .expect("reserve epoch 1");
        }
    }
    client.map_end(&key, 0, 0).await.expect("map end");

    let committed = worker.stage_end(&key).await.expect("stage end");
    assert_eq!(committed.len(), 2, "both epochs hold data");

    let mut stream = client
        .read_partition(&key, 0, 0, 1, vec![0], 0)
        .await
        .expect("open read");
    let delivered = stream.read_to_end().await.expect("read");
    assert_eq!(delivered.len(), expected_bytes);
    assert_eq!(stream.partitions_read(), 2);
    stream.close().expect("close verified");

    server.abort();
    for task in background {
        task.abort();
    }
}

/// Corrupting flushed bytes on disk surfaces as an integrity failure, never
/// as silently delivered data.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn corrupted_chunk_fails_integrity_check() {
    let tw = start_worker("worker-corrupt").await;
    let key = ShuffleKey::new("app-corrupt", 0);
    let primary = location(0, 0, Role::Primary, tw.addr, None);
    tw.worker
        .reserve_partitions(&key, vec![primary.clone()])
        .expect("reserve");

    let provider = Arc::new(StaticLocationProvider::new(vec![primary]));
    // Uncompressed payloads so the corruption reaches the digest check
    // instead of failing the codec.
    let client = ShuffleClient::new(client_config(), CompressionCodec::None, provider);

    for batch_id in 0..4u32 {
        client
            .push_data(&key, 0, 0, 0, &payload(0, batch_id))
            .await
            .expect("push");
    }
    client.map_end(&key, 0, 0).await.expect("map end");
    let committed = tw.worker.stage_end(&key).await.expect("stage end");

    // Flip payload bytes in the middle of the file, past the first header.
    let file = tw
        .worker
        .storage()
        .open_finalized(&key, &committed[0].0)
        .await
        .expect("finalized file");
    let mut contents = std::fs::read(&file.path).expect("read file");
    for byte in &mut contents[600..700] {
        *byte ^= 0xFF;
    }
    std::fs::write(&file.path, &contents).expect("rewrite file");

    let mut stream = client
        .read_partition(&key, 0, 0, 1, vec![0], 0)
        .await
        .expect("open read");
    let err = stream.read_to_end().await.expect_err("must fail");
    assert!(
        matches!(err, RssError::IntegrityMismatch(_)),
        "unexpected error: {err}"
    );
}
