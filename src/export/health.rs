use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Encoder, Gauge, IntGauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "weatherhub";

/// Prometheus metrics for the aggregator.
///
/// Registered on construction; only served over HTTP once [`start`] is
/// called, so tests and embedded servers can use the counters freely.
///
/// [`start`]: HealthMetrics::start
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Handled requests by method and response status code.
    pub requests_total: CounterVec,
    /// Connections currently being served.
    pub connections_active: IntGauge,
    /// Records currently held in the store.
    pub live_records: Gauge,
    /// Snapshot flushes by trigger (write/sweep/shutdown) and result (ok/error).
    pub flushes_total: CounterVec,
    /// Records evicted by the expiry sweeper.
    pub records_evicted: Counter,
    /// Last observed Lamport clock value.
    pub lamport_clock: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new(
                "requests_total",
                "Total handled requests by method and status code.",
            )
            .namespace(NAMESPACE),
            &["method", "status"],
        )?;
        let connections_active = IntGauge::with_opts(
            Opts::new("connections_active", "Connections currently being served.")
                .namespace(NAMESPACE),
        )?;
        let live_records = Gauge::with_opts(
            Opts::new("live_records", "Records currently held in the store.").namespace(NAMESPACE),
        )?;
        let flushes_total = CounterVec::new(
            Opts::new(
                "flushes_total",
                "Total snapshot flushes by trigger and result.",
            )
            .namespace(NAMESPACE),
            &["trigger", "result"],
        )?;
        let records_evicted = Counter::with_opts(
            Opts::new(
                "records_evicted_total",
                "Total records evicted for exceeding the liveness window.",
            )
            .namespace(NAMESPACE),
        )?;
        let lamport_clock = Gauge::with_opts(
            Opts::new("lamport_clock", "Last observed Lamport clock value.").namespace(NAMESPACE),
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(live_records.clone()))?;
        registry.register(Box::new(flushes_total.clone()))?;
        registry.register(Box::new(records_evicted.clone()))?;
        registry.register(Box::new(lamport_clock.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            requests_total,
            connections_active,
            live_records,
            flushes_total,
            records_evicted,
            lamport_clock,
        })
    }

    /// Record the outcome of a snapshot flush.
    pub fn record_flush(&self, trigger: &str, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        self.flushes_total
            .with_label_values(&[trigger, result])
            .inc();
    }

    /// Render all metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
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

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
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

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
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
