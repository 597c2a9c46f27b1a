use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::api::{self, ApiState};
use crate::archive::Archiver;
use crate::auth::{IdentityProvider, Provider};
use crate::config::Config;
use crate::export::health::{resolve_bind_addr, HealthMetrics};
use crate::hub::StatsHub;
use crate::store::MemoryStore;
use crate::warehouse::{ClickHouseWarehouse, HttpWarehouse, Warehouse, WarehouseWriter};

/// Server orchestrates all components: ingestion API, store, archiver,
/// warehouse and health metrics.
pub struct Server {
    cfg: Config,
    health: Arc<HealthMetrics>,
    hub: StatsHub<MemoryStore>,
    archiver: Option<Archiver<MemoryStore, WarehouseWriter>>,
    cancel: CancellationToken,
    api_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Server {
    /// Creates a new Server, initializing health metrics and the store.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            hub: StatsHub::new(Arc::new(MemoryStore::new())),
            archiver: None,
            cancel: CancellationToken::new(),
            api_task: None,
            local_addr: None,
        })
    }

    /// Start all components and begin serving.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Start health metrics server first so probes respond during startup.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Identity provider.
        let identity = Provider::from_config(&self.cfg.identity)
            .context("creating identity provider")?;
        info!(provider = identity.name(), "identity provider ready");

        // 2. Archival, only when a warehouse project is configured. A warehouse
        // that is down at boot disables archiving, not ingestion.
        match self.cfg.archive.project().map(str::to_string) {
            Some(project) => {
                if let Err(e) = self.start_archiver(&project).await {
                    error!(
                        project = %project,
                        error = %format!("{e:#}"),
                        "starting archiver, archiving disabled",
                    );
                }
            }
            None => info!("no archive project configured, not archiving"),
        }

        // 3. Ingestion API.
        let state = ApiState {
            hub: self.hub.clone(),
            identity: Arc::new(identity),
            health: Some(Arc::clone(&self.health)),
        };
        let app = api::router(state);

        let bind_addr = resolve_bind_addr(&self.cfg.listen_addr);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;
        self.local_addr = Some(local_addr);

        let cancel = self.cancel.clone();
        self.api_task = Some(tokio::spawn(async move {
            info!(addr = %local_addr, "ingestion API started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                error!(error = %e, "ingestion API server error");
            }
        }));

        Ok(())
    }

    /// Address the ingestion API is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Whether snapshots are being archived.
    pub fn is_archiving(&self) -> bool {
        self.archiver.is_some()
    }

    /// Health metrics shared by all components.
    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Submission and query entry point over the live store.
    pub fn hub(&self) -> &StatsHub<MemoryStore> {
        &self.hub
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Stop accepting requests and drain in-flight ones.
        self.cancel.cancel();
        if let Some(task) = self.api_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "ingestion API task failed");
            }
        }

        // Let in-flight archive cycles finish their writes, then release the
        // warehouse and its connections.
        if let Some(mut archiver) = self.archiver.take() {
            archiver.stop().await;
        }

        self.health.stop().await?;

        Ok(())
    }

    async fn start_archiver(&mut self, project: &str) -> Result<()> {
        let warehouse = self.create_warehouse(project).await?;
        info!(project, warehouse = warehouse.name(), "archiving snapshots");

        let mut archiver = Archiver::new(
            self.hub.clone(),
            Arc::new(warehouse),
            self.cfg.archive.schedules(),
        )
        .context("creating archiver")?
        .with_health(Arc::clone(&self.health));

        archiver.start();
        self.archiver = Some(archiver);

        Ok(())
    }

    async fn create_warehouse(&self, project: &str) -> Result<WarehouseWriter> {
        let archive = &self.cfg.archive;

        if archive.clickhouse.enabled {
            let warehouse = ClickHouseWarehouse::connect(
                &archive.clickhouse,
                &archive.table_prefix,
                project,
                Some(Arc::clone(&self.health)),
            )
            .await
            .context("connecting to ClickHouse")?;

            let dimensions: Vec<&str> = archive.dimensions.iter().map(|d| d.name.as_str()).collect();
            warehouse
                .ensure_tables(&dimensions)
                .await
                .context("creating snapshot tables")?;

            return Ok(WarehouseWriter::ClickHouse(warehouse));
        }

        let warehouse = HttpWarehouse::new(
            archive.http.clone(),
            project,
            Some(Arc::clone(&self.health)),
        )
        .context("creating HTTP warehouse")?;

        Ok(WarehouseWriter::Http(warehouse))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Bytes;
    use axum::extract::State;
    use axum::routing::post;
    use axum::Router;
    use tokio::sync::mpsc;

    use super::*;
    use crate::auth::expected_hash;
    use crate::config::{
        ArchiveConfig, ClickHouseConfig, DimensionConfig, HealthConfig, HttpExportConfig,
        IdentityConfig, IdentityProviderKind,
    };

    fn test_config() -> Config {
        Config {
            listen_addr: "127.0.0.1:0".to_string(),
            identity: IdentityConfig {
                provider: IdentityProviderKind::Header,
                header: "X-Authenticated-User".to_string(),
                ..Default::default()
            },
            health: HealthConfig {
                addr: "127.0.0.1:0".to_string(),
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_serves_submissions_without_archive() {
        let mut server = Server::new(test_config()).expect("server");
        server.start().await.expect("start");
        let addr = server.local_addr().expect("bound");

        let url = format!("http://{addr}/stats/42?hash={}", expected_hash("alice@example.com", 42));
        let client = reqwest::Client::new();

        let resp = client
            .post(&url)
            .header("X-Authenticated-User", "alice@example.com")
            .body(r#"{"counter": {"clicks": 3}}"#)
            .send()
            .await
            .expect("post");
        assert_eq!(resp.status(), reqwest::StatusCode::OK);

        let body: serde_json::Value = client
            .get(&url)
            .header("X-Authenticated-User", "alice@example.com")
            .send()
            .await
            .expect("get")
            .json()
            .await
            .expect("json");
        assert_eq!(body["Stats"]["counter"]["clicks"], 3);

        server.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_unreachable_warehouse_keeps_ingestion_up() {
        // Grab a free port, then close it so connections are refused.
        let closed = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind")
            .local_addr()
            .expect("addr");

        let mut cfg = test_config();
        cfg.archive = ArchiveConfig {
            project: Some("test-project".to_string()),
            clickhouse: ClickHouseConfig {
                enabled: true,
                endpoint: closed.to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        cfg.validate().expect("valid config");

        let mut server = Server::new(cfg).expect("server");
        tokio::time::timeout(Duration::from_secs(60), server.start())
            .await
            .expect("start finishes")
            .expect("start");
        assert!(!server.is_archiving());

        let addr = server.local_addr().expect("bound");
        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/stats/42?hash={}", expected_hash("alice@example.com", 42)))
            .header("X-Authenticated-User", "alice@example.com")
            .body(r#"{"counter": {"clicks": 1}}"#)
            .send()
            .await
            .expect("post");
        assert_eq!(resp.status(), reqwest::StatusCode::OK);

        server.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_archives_to_http_warehouse() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let receiver = Router::new()
            .route(
                "/ingest",
                post(
                    |State(tx): State<mpsc::UnboundedSender<Bytes>>, body: Bytes| async move {
                        let _ = tx.send(body);
                    },
                ),
            )
            .with_state(tx);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind receiver");
        let receiver_addr = listener.local_addr().expect("receiver addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, receiver).await;
        });

        let mut cfg = test_config();
        cfg.archive = ArchiveConfig {
            project: Some("test-project".to_string()),
            dimensions: vec![DimensionConfig {
                name: "user".to_string(),
                interval: Duration::from_secs(1),
            }],
            http: HttpExportConfig {
                enabled: true,
                address: format!("http://{receiver_addr}/ingest"),
                compression: "none".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        cfg.validate().expect("valid config");

        let mut server = Server::new(cfg).expect("server");
        server.start().await.expect("start");
        assert!(server.is_archiving());
        server
            .hub()
            .submit(42, &crate::stats::StatsBundle::new().with_counter("clicks", 7).into())
            .await
            .expect("submit");

        let body = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("snapshot within timeout")
            .expect("receiver open");
        let first = body.split(|b| *b == b'\n').next().expect("one line");
        let line: serde_json::Value = serde_json::from_slice(first).expect("ndjson line");
        assert_eq!(line["project"], "test-project");
        assert_eq!(line["dimension"], "user");
        assert_eq!(line["entity"], "42");
        assert_eq!(line["counter"]["clicks"], 7);

        server.stop().await.expect("stop");
    }
}
