use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

/// Prometheus metrics registry for the shuffle data plane.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    push_bytes: CounterVec,
    push_batches: CounterVec,
    push_rejected: CounterVec,
    replicate_bytes: CounterVec,
    flush_bytes: CounterVec,
    flush_seconds: HistogramVec,
    flush_failures: CounterVec,
    fetch_bytes: CounterVec,
    fetch_chunks: CounterVec,
    open_streams: GaugeVec,
    active_writers: GaugeVec,
    direct_memory_bytes: GaugeVec,
    congested_users: GaugeVec,
    user_produce_rate: GaugeVec,
    isolated_mounts: GaugeVec,
}

impl MetricsRegistry {
    /// Build a registry with all metric families registered.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Record an accepted push.
    pub fn record_push(&self, shuffle_key: &str, bytes: u64) {
        let labels = [shuffle_key];
        self.inner
            .push_bytes
            .with_label_values(&labels)
            .inc_by(bytes as f64);
        self.inner.push_batches.with_label_values(&labels).inc();
    }

    /// Record a rejected push with the wire status it was refused with.
    pub fn record_push_rejected(&self, shuffle_key: &str, status: &str) {
        self.inner
            .push_rejected
            .with_label_values(&[shuffle_key, status])
            .inc();
    }

    /// Record bytes forked to a replica.
    pub fn record_replicate(&self, shuffle_key: &str, bytes: u64) {
        self.inner
            .replicate_bytes
            .with_label_values(&[shuffle_key])
            .inc_by(bytes as f64);
    }

    /// Record one completed flush.
    pub fn record_flush(&self, mount: &str, bytes: u64, secs: f64) {
        self.inner
            .flush_bytes
            .with_label_values(&[mount])
            .inc_by(bytes as f64);
        self.inner
            .flush_seconds
            .with_label_values(&[mount])
            .observe(secs.max(0.0));
    }

    /// Record one failed flush.
    pub fn record_flush_failure(&self, mount: &str) {
        self.inner.flush_failures.with_label_values(&[mount]).inc();
    }

    /// Record one chunk served to a reader.
    pub fn record_fetch_chunk(&self, shuffle_key: &str, bytes: u64) {
        let labels = [shuffle_key];
        self.inner
            .fetch_bytes
            .with_label_values(&labels)
            .inc_by(bytes as f64);
        self.inner.fetch_chunks.with_label_values(&labels).inc();
    }

    /// Set the number of open chunk streams.
    pub fn set_open_streams(&self, count: u64) {
        self.inner
            .open_streams
            .with_label_values(&["worker"])
            .set(count as f64);
    }

    /// Set the number of live partition file writers.
    pub fn set_active_writers(&self, count: u64) {
        self.inner
            .active_writers
            .with_label_values(&["worker"])
            .set(count as f64);
    }

    /// Set a direct-memory counter gauge.
    pub fn set_direct_memory(&self, counter: &str, bytes: u64) {
        self.inner
            .direct_memory_bytes
            .with_label_values(&[counter])
            .set(bytes as f64);
    }

    /// Set the number of currently congested users.
    pub fn set_congested_users(&self, count: u64) {
        self.inner
            .congested_users
            .with_label_values(&["worker"])
            .set(count as f64);
    }

    /// Set one user's observed produce rate.
    pub fn set_user_produce_rate(&self, user: &str, bytes_per_sec: u64) {
        self.inner
            .user_produce_rate
            .with_label_values(&[user])
            .set(bytes_per_sec as f64);
    }

    /// Drop one user's produce-rate gauge when the user goes inactive.
    pub fn remove_user_produce_rate(&self, user: &str) {
        let _ = self.inner.user_produce_rate.remove_label_values(&[user]);
    }

    /// Set the number of isolated mounts.
    pub fn set_isolated_mounts(&self, count: u64) {
        self.inner
            .isolated_mounts
            .with_label_values(&["worker"])
            .set(count as f64);
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let push_bytes = counter_vec(
            &registry,
            "rss_push_bytes_total",
            "Bytes accepted by the push handler",
            &["shuffle_key"],
        );
        let push_batches = counter_vec(
            &registry,
            "rss_push_batches_total",
            "Batches accepted by the push handler",
            &["shuffle_key"],
        );
        let push_rejected = counter_vec(
            &registry,
            "rss_push_rejected_total",
            "Pushes refused, by wire status",
            &["shuffle_key", "status"],
        );
        let replicate_bytes = counter_vec(
            &registry,
            "rss_replicate_bytes_total",
            "Bytes forked to replica locations",
            &["shuffle_key"],
        );
        let flush_bytes = counter_vec(
            &registry,
            "rss_flush_bytes_total",
            "Bytes flushed to disk",
            &["mount"],
        );
        let flush_seconds = histogram_vec(
            &registry,
            "rss_flush_seconds",
            "Flush write latency",
            &["mount"],
        );
        let flush_failures = counter_vec(
            &registry,
            "rss_flush_failures_total",
            "Failed flush writes",
            &["mount"],
        );
        let fetch_bytes = counter_vec(
            &registry,
            "rss_fetch_bytes_total",
            "Bytes streamed to readers",
            &["shuffle_key"],
        );
        let fetch_chunks = counter_vec(
            &registry,
            "rss_fetch_chunks_total",
            "Chunks streamed to readers",
            &["shuffle_key"],
        );
        let open_streams = gauge_vec(
            &registry,
            "rss_open_streams",
            "Currently open chunk streams",
            &["scope"],
        );
        let active_writers = gauge_vec(
            &registry,
            "rss_active_writers",
            "Live partition file writers",
            &["scope"],
        );
        let direct_memory_bytes = gauge_vec(
            &registry,
            "rss_direct_memory_bytes",
            "Tracked direct memory by counter",
            &["counter"],
        );
        let congested_users = gauge_vec(
            &registry,
            "rss_congested_users",
            "Users currently flagged congested",
            &["scope"],
        );
        let user_produce_rate = gauge_vec(
            &registry,
            "rss_user_produce_rate_bytes",
            "Observed per-user produce rate",
            &["user"],
        );
        let isolated_mounts = gauge_vec(
            &registry,
            "rss_isolated_mounts",
            "Mounts quarantined by the device monitor",
            &["scope"],
        );

        Self {
            registry,
            push_bytes,
            push_batches,
            push_rejected,
            replicate_bytes,
            flush_bytes,
            flush_seconds,
            flush_failures,
            fetch_bytes,
            fetch_chunks,
            open_streams,
            active_writers,
            direct_memory_bytes,
            congested_users,
            user_produce_rate,
            isolated_mounts,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

/// Process-wide metrics registry.
pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
