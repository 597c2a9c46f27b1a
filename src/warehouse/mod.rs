//! Durable snapshot sinks: ClickHouse tables or NDJSON over HTTP.

pub mod clickhouse;
pub mod http;

use std::time::SystemTime;

use anyhow::Result;

use crate::stats::StatsBundle;

pub use self::clickhouse::ClickHouseWarehouse;
pub use self::http::HttpWarehouse;

/// One entity of one dimension at one archive boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub dimension: String,
    pub entity: String,
    pub stats: StatsBundle,
    /// Window boundary the snapshot was taken for, aligned to the archive interval.
    pub boundary: SystemTime,
}

/// Durable sink for archived snapshots.
///
/// Writes are not idempotent. Consumers deduplicate on
/// (dimension, entity, boundary).
pub trait Warehouse: Send + Sync {
    /// Backend name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Appends one snapshot.
    fn write(&self, snapshot: &Snapshot) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Warehouse backend selected by configuration.
///
/// Enum dispatch keeps the archiver generic over one concrete type.
pub enum WarehouseWriter {
    ClickHouse(ClickHouseWarehouse),
    Http(HttpWarehouse),
}

impl Warehouse for WarehouseWriter {
    fn name(&self) -> &'static str {
        match self {
            Self::ClickHouse(w) => w.name(),
            Self::Http(w) => w.name(),
        }
    }

    async fn write(&self, snapshot: &Snapshot) -> Result<()> {
        match self {
            Self::ClickHouse(w) => w.write(snapshot).await,
            Self::Http(w) => w.write(snapshot).await,
        }
    }
}
