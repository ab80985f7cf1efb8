use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "rollupd";

/// Prometheus metrics for the aggregation and rollup pipeline.
///
/// All metrics use the "rollupd" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Aggregation ===
    /// Transactions accepted onto a scope queue.
    pub transactions_received: Counter,
    /// Transactions dropped because a scope queue was full.
    pub transactions_dropped: Counter,
    /// Intervals written at level 0.
    pub intervals_flushed: Counter,
    /// Failed interval flushes, including marker writes.
    pub flush_errors: Counter,
    /// Aggregate records written at level 0.
    pub aggregate_records_written: Counter,
    /// Time from interval close to stored rows.
    pub flush_duration: Histogram,
    /// Transactions recorded under the overflow name.
    pub name_overflow: Counter,

    // === Rollup ===
    /// Histogram rows skipped because they failed to decode.
    pub histogram_decode_errors: Counter,
    /// Buckets rolled up, by kind and level.
    pub rollup_buckets: CounterVec,
    /// Buckets that failed to roll up, by kind and level.
    pub rollup_errors: CounterVec,
    /// Duration of a full rollup pass.
    pub rollup_pass_duration: Histogram,
    /// Markers seen at the start of the last pass, by kind and level.
    pub pending_markers: GaugeVec,

    // === Gauges and storage ===
    /// Self gauge samples written.
    pub gauge_samples: Counter,
    /// Whether the store answered its startup check (1=yes, 0=no).
    pub store_connected: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let transactions_received = Counter::with_opts(
            Opts::new(
                "transactions_received_total",
                "Transactions accepted onto a scope queue.",
            )
            .namespace(NAMESPACE),
        )?;
        let transactions_dropped = Counter::with_opts(
            Opts::new(
                "transactions_dropped_total",
                "Transactions dropped because a scope queue was full.",
            )
            .namespace(NAMESPACE),
        )?;
        let intervals_flushed = Counter::with_opts(
            Opts::new("intervals_flushed_total", "Intervals written at level 0.")
                .namespace(NAMESPACE),
        )?;
        let flush_errors = Counter::with_opts(
            Opts::new("flush_errors_total", "Failed interval flushes.").namespace(NAMESPACE),
        )?;
        let aggregate_records_written = Counter::with_opts(
            Opts::new(
                "aggregate_records_written_total",
                "Aggregate records written at level 0.",
            )
            .namespace(NAMESPACE),
        )?;
        let flush_duration = Histogram::with_opts(
            HistogramOpts::new(
                "flush_duration_seconds",
                "Time to snapshot and store a closed interval.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        let name_overflow = Counter::with_opts(
            Opts::new(
                "name_overflow_total",
                "Transactions recorded under the overflow name.",
            )
            .namespace(NAMESPACE),
        )?;

        let histogram_decode_errors = Counter::with_opts(
            Opts::new(
                "histogram_decode_errors_total",
                "Histogram rows skipped during rollup because they failed to decode.",
            )
            .namespace(NAMESPACE),
        )?;
        let rollup_buckets = CounterVec::new(
            Opts::new("rollup_buckets_total", "Buckets rolled up by kind and level.")
                .namespace(NAMESPACE),
            &["kind", "level"],
        )?;
        let rollup_errors = CounterVec::new(
            Opts::new(
                "rollup_errors_total",
                "Buckets that failed to roll up by kind and level.",
            )
            .namespace(NAMESPACE),
            &["kind", "level"],
        )?;
        let rollup_pass_duration = Histogram::with_opts(
            HistogramOpts::new(
                "rollup_pass_duration_seconds",
                "Duration of a full rollup pass.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
        )?;
        let pending_markers = GaugeVec::new(
            Opts::new(
                "pending_markers",
                "Needs-rollup markers seen by the last pass by kind and level.",
            )
            .namespace(NAMESPACE),
            &["kind", "level"],
        )?;

        let gauge_samples = Counter::with_opts(
            Opts::new("gauge_samples_total", "Self gauge samples written.").namespace(NAMESPACE),
        )?;
        let store_connected = Gauge::with_opts(
            Opts::new(
                "store_connected",
                "Whether the store answered its startup check (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(transactions_received.clone()))?;
        registry.register(Box::new(transactions_dropped.clone()))?;
        registry.register(Box::new(intervals_flushed.clone()))?;
        registry.register(Box::new(flush_errors.clone()))?;
        registry.register(Box::new(aggregate_records_written.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(name_overflow.clone()))?;
        registry.register(Box::new(histogram_decode_errors.clone()))?;
        registry.register(Box::new(rollup_buckets.clone()))?;
        registry.register(Box::new(rollup_errors.clone()))?;
        registry.register(Box::new(rollup_pass_duration.clone()))?;
        registry.register(Box::new(pending_markers.clone()))?;
        registry.register(Box::new(gauge_samples.clone()))?;
        registry.register(Box::new(store_connected.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            transactions_received,
            transactions_dropped,
            intervals_flushed,
            flush_errors,
            aggregate_records_written,
            flush_duration,
            name_overflow,
            histogram_decode_errors,
            rollup_buckets,
            rollup_errors,
            rollup_pass_duration,
            pending_markers,
            gauge_samples,
            store_connected,
        })
    }

    /// Renders all metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;
        String::from_utf8(buffer).context("metrics are not UTF-8")
    }

    /// Starts the HTTP server serving /metrics and /healthz. Returns the
    /// bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // ":port" binds all interfaces.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(Arc::new(AppState {
                registry: self.registry.clone(),
            }));

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&state.registry.gather(), &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
