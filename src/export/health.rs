use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "statshub";

/// Prometheus metrics for the statshub server.
///
/// All metrics use the "statshub" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    server_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,

    // === Ingestion ===
    /// Stats submissions by outcome (ok, bad_request, store_error).
    pub submissions_total: CounterVec,
    /// Stats queries by outcome.
    pub queries_total: CounterVec,
    /// Rejected authentications by reason (unauthenticated, forbidden).
    pub auth_failures_total: CounterVec,

    // === Archival ===
    /// Archive cycles by dimension and outcome (ok, partial, failed).
    pub archive_cycles_total: CounterVec,
    /// Snapshots written to the warehouse by dimension.
    pub snapshots_written_total: CounterVec,
    /// Snapshot writes that failed, by dimension.
    pub snapshot_write_errors_total: CounterVec,
    /// Wall time of one archive cycle by dimension.
    pub archive_cycle_duration: HistogramVec,
    /// Failed warehouse requests by backend.
    pub warehouse_batch_errors: CounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let submissions_total = CounterVec::new(
            Opts::new("submissions_total", "Stats submissions by outcome.").namespace(NAMESPACE),
            &["outcome"],
        )?;
        let queries_total = CounterVec::new(
            Opts::new("queries_total", "Stats queries by outcome.").namespace(NAMESPACE),
            &["outcome"],
        )?;
        let auth_failures_total = CounterVec::new(
            Opts::new("auth_failures_total", "Rejected authentications by reason.")
                .namespace(NAMESPACE),
            &["reason"],
        )?;

        let archive_cycles_total = CounterVec::new(
            Opts::new(
                "archive_cycles_total",
                "Archive cycles by dimension and outcome.",
            )
            .namespace(NAMESPACE),
            &["dimension", "outcome"],
        )?;
        let snapshots_written_total = CounterVec::new(
            Opts::new(
                "snapshots_written_total",
                "Snapshots written to the warehouse by dimension.",
            )
            .namespace(NAMESPACE),
            &["dimension"],
        )?;
        let snapshot_write_errors_total = CounterVec::new(
            Opts::new(
                "snapshot_write_errors_total",
                "Snapshot writes that failed, by dimension.",
            )
            .namespace(NAMESPACE),
            &["dimension"],
        )?;
        let archive_cycle_duration = HistogramVec::new(
            HistogramOpts::new(
                "archive_cycle_duration_seconds",
                "Wall time of one archive cycle by dimension.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
            &["dimension"],
        )?;
        let warehouse_batch_errors = CounterVec::new(
            Opts::new(
                "warehouse_batch_errors_total",
                "Failed warehouse requests by backend.",
            )
            .namespace(NAMESPACE),
            &["backend"],
        )?;

        registry.register(Box::new(submissions_total.clone()))?;
        registry.register(Box::new(queries_total.clone()))?;
        registry.register(Box::new(auth_failures_total.clone()))?;
        registry.register(Box::new(archive_cycles_total.clone()))?;
        registry.register(Box::new(snapshots_written_total.clone()))?;
        registry.register(Box::new(snapshot_write_errors_total.clone()))?;
        registry.register(Box::new(archive_cycle_duration.clone()))?;
        registry.register(Box::new(warehouse_batch_errors.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            server_task: parking_lot::Mutex::new(None),
            local_addr: parking_lot::Mutex::new(None),
            submissions_total,
            queries_total,
            auth_failures_total,
            archive_cycles_total,
            snapshots_written_total,
            snapshot_write_errors_total,
            archive_cycle_duration,
            warehouse_batch_errors,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };
        let bind_addr = resolve_bind_addr(addr);

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

        let task = tokio::spawn(async move {
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
        *self.server_task.lock() = Some(task);

        Ok(())
    }

    /// Address the server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Renders all registered metrics in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;
        String::from_utf8(buffer).context("converting metrics to string")
    }

    /// Gracefully shuts down the health metrics server and waits for it to
    /// finish serving in-flight scrapes.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        let task = self.server_task.lock().take();
        if let Some(task) = task {
            task.await.context("joining health metrics server")?;
        }

        Ok(())
    }
}

/// Expands the ":port" shorthand to listen on all interfaces.
pub fn resolve_bind_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_bind_addr() {
        assert_eq!(resolve_bind_addr(":9090"), "0.0.0.0:9090");
        assert_eq!(resolve_bind_addr("127.0.0.1:8080"), "127.0.0.1:8080");
    }

    #[test]
    fn test_render_uses_namespace() {
        let health = HealthMetrics::new(":0").expect("metrics");
        health
            .archive_cycles_total
            .with_label_values(&["country", "ok"])
            .inc();
        health
            .auth_failures_total
            .with_label_values(&["forbidden"])
            .inc_by(2.0);

        let text = health.render().expect("render");
        assert!(text.contains(r#"statshub_archive_cycles_total{dimension="country",outcome="ok"} 1"#));
        assert!(text.contains(r#"statshub_auth_failures_total{reason="forbidden"} 2"#));
    }

    #[tokio::test]
    async fn test_server_serves_healthz_and_metrics() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        health.submissions_total.with_label_values(&["ok"]).inc();
        health.start().await.expect("start");
        let addr = health.local_addr().expect("bound");

        let client = reqwest::Client::new();
        let healthz = client
            .get(format!("http://{addr}/healthz"))
            .send()
            .await
            .expect("healthz request");
        assert_eq!(healthz.status(), reqwest::StatusCode::OK);
        assert_eq!(healthz.text().await.expect("body"), "ok");

        let metrics = client
            .get(format!("http://{addr}/metrics"))
            .send()
            .await
            .expect("metrics request")
            .text()
            .await
            .expect("body");
        assert!(metrics.contains(r#"statshub_submissions_total{outcome="ok"} 1"#));
        drop(client);

        health.stop().await.expect("stop");
        assert!(
            tokio::net::TcpStream::connect(addr).await.is_err(),
            "listener still open after stop"
        );
        // A second stop is a no-op.
        health.stop().await.expect("stop again");
    }
}
