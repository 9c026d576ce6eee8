use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use rss_worker::grpc::{self, GrpcReplicateForwarder, PushClientPool};
use rss_worker::{Worker, WorkerConfig};
use tracing::info;

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64_or_default(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize_or_default(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let worker_id = env_or_default("RSS_WORKER_ID", "worker-1");
    let bind = env_or_default("RSS_WORKER_BIND", "0.0.0.0:9097");
    let bind_addr: SocketAddr = bind.parse()?;
    let mounts = env_or_default("RSS_WORKER_MOUNTS", "/tmp/rss");
    let max_direct_memory =
        env_usize_or_default("RSS_WORKER_MAX_DIRECT_MEMORY", 1024 * 1024 * 1024);
    let flush_buffer_size = env_usize_or_default("RSS_WORKER_FLUSH_BUFFER_SIZE", 256 * 1024);
    let chunk_size = env_u64_or_default("RSS_WORKER_CHUNK_SIZE", 8 * 1024 * 1024);
    let split_threshold = env_u64_or_default("RSS_WORKER_SPLIT_THRESHOLD", 1024 * 1024 * 1024);

    let mut config = WorkerConfig {
        worker_id: worker_id.clone(),
        ..WorkerConfig::default()
    };
    config.storage.mounts = mounts.split(',').map(str::to_string).collect();
    config.storage.flush_buffer_size = flush_buffer_size;
    config.storage.chunk_size = chunk_size;
    config.storage.split_threshold = split_threshold;
    config.memory.max_direct_memory = max_direct_memory;

    for mount in &config.storage.mounts {
        std::fs::create_dir_all(mount)?;
    }

    let pool = PushClientPool::new();
    let forwarder = GrpcReplicateForwarder::new(pool);
    let worker = Worker::new(config, Some(forwarder));
    let background = worker.spawn_background();

    #[cfg(feature = "profiling")]
    {
        let metrics_bind = env_or_default("RSS_WORKER_METRICS_BIND", "0.0.0.0:9098");
        let metrics_addr: SocketAddr = metrics_bind.parse()?;
        tokio::spawn(async move {
            let _ = rss_common::run_metrics_exporter(metrics_addr).await;
        });
    }

    info!(worker_id, %bind_addr, "rss-worker started");
    let serve_worker = Arc::clone(&worker);
    let server = tokio::spawn(async move { grpc::serve(serve_worker, bind_addr).await });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    worker.graceful_shutdown().await;
    server.abort();
    for task in background {
        task.abort();
    }
    Ok(())
}
