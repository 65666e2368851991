use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "metricbuf";

/// Prometheus metrics for agent health.
///
/// All metrics use the "metricbuf" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,

    // === Tick loop ===
    /// Total ticks run, successful or not.
    pub ticks_total: Counter,
    /// Ticks that returned an error or panicked.
    pub tick_failures_total: Counter,
    /// Samples merged into the buffer by ticks. Samples whose values were
    /// all rejected are not counted.
    pub samples_merged_total: Counter,
    /// Tick duration (1ms-10s buckets).
    pub tick_duration: Histogram,

    // === Snapshots and reporting ===
    /// Snapshots taken, by where the data came from.
    pub snapshots_total: CounterVec,
    /// Number of aggregates in the last snapshot.
    pub snapshot_metrics: Gauge,
    /// Metrics handed to the reporter.
    pub metrics_reported_total: Counter,
    /// Reporter failures.
    pub report_errors_total: Counter,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let ticks_total = Counter::with_opts(
            Opts::new("ticks_total", "Total fetch ticks run.").namespace(NAMESPACE),
        )?;
        let tick_failures_total = Counter::with_opts(
            Opts::new(
                "tick_failures_total",
                "Total fetch ticks that failed or panicked.",
            )
            .namespace(NAMESPACE),
        )?;
        let samples_merged_total = Counter::with_opts(
            Opts::new(
                "samples_merged_total",
                "Total samples merged into the aggregation buffer.",
            )
            .namespace(NAMESPACE),
        )?;
        let tick_duration = Histogram::with_opts(
            HistogramOpts::new("tick_duration_seconds", "Fetch tick duration in seconds.")
                .namespace(NAMESPACE)
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
        )?;
        let snapshots_total = CounterVec::new(
            Opts::new("snapshots_total", "Total buffer snapshots by source.").namespace(NAMESPACE),
            &["source"],
        )?;
        let snapshot_metrics = Gauge::with_opts(
            Opts::new(
                "snapshot_metrics",
                "Number of aggregates in the last snapshot.",
            )
            .namespace(NAMESPACE),
        )?;
        let metrics_reported_total = Counter::with_opts(
            Opts::new("metrics_reported_total", "Total metrics reported.").namespace(NAMESPACE),
        )?;
        let report_errors_total = Counter::with_opts(
            Opts::new("report_errors_total", "Total reporter failures.").namespace(NAMESPACE),
        )?;

        registry.register(Box::new(ticks_total.clone()))?;
        registry.register(Box::new(tick_failures_total.clone()))?;
        registry.register(Box::new(samples_merged_total.clone()))?;
        registry.register(Box::new(tick_duration.clone()))?;
        registry.register(Box::new(snapshots_total.clone()))?;
        registry.register(Box::new(snapshot_metrics.clone()))?;
        registry.register(Box::new(metrics_reported_total.clone()))?;
        registry.register(Box::new(report_errors_total.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            local_addr: parking_lot::Mutex::new(None),
            ticks_total,
            tick_failures_total,
            samples_merged_total,
            tick_duration,
            snapshots_total,
            snapshot_metrics,
            metrics_reported_total,
            report_errors_total,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // ":port" shorthand binds all interfaces.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;
        *self.local_addr.lock() = Some(local_addr);

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

        Ok(())
    }

    /// Address the server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Encodes every registered metric in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "serving metrics");
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
