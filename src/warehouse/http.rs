use std::io::Write;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{Snapshot, Warehouse};
use crate::config::HttpExportConfig;
use crate::export::health::HealthMetrics;
use crate::stats::StatMap;

/// JSON line written for each snapshot.
#[derive(Debug, Serialize)]
pub struct SnapshotJson<'a> {
    pub project: &'a str,
    pub dimension: &'a str,
    pub entity: &'a str,
    pub boundary: String,
    pub counter: &'a StatMap,
    pub gauge: &'a StatMap,
    pub presence: &'a StatMap,
    pub updated_date_time: String,
}

impl<'a> SnapshotJson<'a> {
    fn new(project: &'a str, snapshot: &'a Snapshot, updated: SystemTime) -> Self {
        Self {
            project,
            dimension: &snapshot.dimension,
            entity: &snapshot.entity,
            boundary: format_datetime(snapshot.boundary),
            counter: &snapshot.stats.counter,
            gauge: &snapshot.stats.gauge,
            presence: &snapshot.stats.presence,
            updated_date_time: format_datetime(updated),
        }
    }
}

/// Sends snapshots as newline-delimited JSON over HTTP POST, optionally
/// compressed.
pub struct HttpWarehouse {
    cfg: HttpExportConfig,
    client: reqwest::Client,
    project: String,
    health: Option<Arc<HealthMetrics>>,
}

impl HttpWarehouse {
    /// Creates a new HTTP warehouse with the given configuration.
    pub fn new(
        cfg: HttpExportConfig,
        project: &str,
        health: Option<Arc<HealthMetrics>>,
    ) -> Result<Self> {
        let mut client_builder = reqwest::Client::builder().timeout(cfg.timeout);
        if !cfg.keep_alive {
            client_builder = client_builder.pool_max_idle_per_host(0);
        }
        let client = client_builder.build().context("building HTTP client")?;

        tracing::info!(
            address = %cfg.address,
            compression = %cfg.compression,
            "HTTP warehouse ready",
        );

        Ok(Self {
            cfg,
            client,
            project: project.to_string(),
            health,
        })
    }

    async fn send(&self, body: Vec<u8>) -> Result<()> {
        let compressed = compress(&body, &self.cfg.compression).context("compressing NDJSON data")?;

        let mut request = self
            .client
            .post(&self.cfg.address)
            .header("Content-Type", "application/x-ndjson")
            .body(compressed);

        if let Some(encoding) = content_encoding(&self.cfg.compression) {
            request = request.header("Content-Encoding", encoding);
        }

        for (k, v) in &self.cfg.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let resp = request
            .send()
            .await
            .context("sending HTTP export request")?;

        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            bail!("HTTP export returned status {status}");
        }

        Ok(())
    }

    fn record_batch_error(&self) {
        if let Some(health) = &self.health {
            health
                .warehouse_batch_errors
                .with_label_values(&["http"])
                .inc();
        }
    }
}

impl Warehouse for HttpWarehouse {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn write(&self, snapshot: &Snapshot) -> Result<()> {
        let body = encode_ndjson(&self.project, std::slice::from_ref(snapshot), SystemTime::now())?;

        let result = self.send(body).await;
        if result.is_err() {
            self.record_batch_error();
        }
        result.with_context(|| {
            format!(
                "exporting {} snapshot to {}",
                snapshot.dimension, self.cfg.address
            )
        })
    }
}

/// Serializes snapshots to NDJSON.
fn encode_ndjson(project: &str, snapshots: &[Snapshot], updated: SystemTime) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(snapshots.len() * 256);
    for snapshot in snapshots {
        let item = SnapshotJson::new(project, snapshot, updated);
        serde_json::to_writer(&mut buf, &item).context("serializing snapshot to JSON")?;
        buf.push(b'\n');
    }
    Ok(buf)
}

// --- Compression ---

/// Compresses data with the named algorithm.
fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => compress_gzip(data),
        "zstd" => compress_zstd(data),
        "zlib" => compress_zlib(data),
        "snappy" => compress_snappy(data),
        other => bail!("unsupported compression: {other}"),
    }
}

/// Returns the Content-Encoding header value for the algorithm.
fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        "zstd" => Some("zstd"),
        "zlib" => Some("deflate"),
        "snappy" => Some("snappy"),
        _ => None,
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}

fn compress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    zstd::encode_all(data, 0).context("zstd encode")
}

fn compress_zlib(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("zlib write")?;
    encoder.finish().context("zlib finish")
}

fn compress_snappy(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = snap::raw::Encoder::new();
    encoder.compress_vec(data).context("snappy encode")
}

/// Formats a SystemTime as "2006-01-02 15:04:05.000" in UTC.
fn format_datetime(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}
