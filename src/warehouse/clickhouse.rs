use std::fmt::Write;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clickhouse_rs::Pool;
use tracing::info;

use super::{Snapshot, Warehouse};
use crate::config::ClickHouseConfig;
use crate::export::health::HealthMetrics;
use crate::stats::StatMap;

const COLUMNS: &str = "project, entity, boundary, counter, gauge, presence, updated_date_time";

/// Pool and timeout options appended to every DSN. Query and connection
/// timeouts make a hung server fail the write instead of stalling a cycle.
const DSN_OPTIONS: &str =
    "compression=lz4&pool_min=1&pool_max=4&connection_timeout=5s&query_timeout=30s";

/// Writes snapshots into one ClickHouse table per dimension.
///
/// Tables are named `{database}.{table_prefix}_{dimension}` and use
/// `ReplacingMergeTree`, so a re-written boundary collapses on merge.
pub struct ClickHouseWarehouse {
    pool: Pool,
    database: String,
    table_prefix: String,
    project: String,
    health: Option<Arc<HealthMetrics>>,
}

impl ClickHouseWarehouse {
    pub fn new(
        pool: Pool,
        database: &str,
        table_prefix: &str,
        project: &str,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            pool,
            database: database.to_string(),
            table_prefix: table_prefix.to_string(),
            project: project.to_string(),
            health,
        }
    }

    /// Opens a pool against the configured server and checks it with a ping.
    pub async fn connect(
        cfg: &ClickHouseConfig,
        table_prefix: &str,
        project: &str,
        health: Option<Arc<HealthMetrics>>,
    ) -> Result<Self> {
        let pool = Pool::new(dsn(cfg));

        let mut handle = pool
            .get_handle()
            .await
            .context("opening ClickHouse connection")?;
        handle.ping().await.context("pinging ClickHouse")?;

        info!(
            endpoint = %cfg.endpoint,
            database = %cfg.database,
            "ClickHouse warehouse connected",
        );

        Ok(Self::new(pool, &cfg.database, table_prefix, project, health))
    }

    /// Creates the snapshot table for every dimension if missing.
    pub async fn ensure_tables(&self, dimensions: &[&str]) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for table creation")?;

        for dim in dimensions {
            let table = table_name(&self.database, &self.table_prefix, dim);
            handle
                .execute(create_table_sql(&table).as_str())
                .await
                .with_context(|| format!("creating table {table}"))?;
            info!(table = %table, "snapshot table ready");
        }

        Ok(())
    }

    fn record_batch_error(&self) {
        if let Some(health) = &self.health {
            health
                .warehouse_batch_errors
                .with_label_values(&["clickhouse"])
                .inc();
        }
    }
}

impl Warehouse for ClickHouseWarehouse {
    fn name(&self) -> &'static str {
        "clickhouse"
    }

    async fn write(&self, snapshot: &Snapshot) -> Result<()> {
        let table = table_name(&self.database, &self.table_prefix, &snapshot.dimension);
        let sql = insert_sql(&table, &self.project, snapshot, SystemTime::now());

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for snapshot insert")?;

        if let Err(e) = handle.execute(sql.as_str()).await {
            self.record_batch_error();
            return Err(e).with_context(|| format!("inserting snapshot into {table}"));
        }

        Ok(())
    }
}

/// Native-protocol DSN: `tcp://[user[:pass]@]host:port/database?options`.
fn dsn(cfg: &ClickHouseConfig) -> String {
    let credentials = match (cfg.username.as_str(), cfg.password.as_str()) {
        ("", _) => String::new(),
        (user, "") => format!("{user}@"),
        (user, pass) => format!("{user}:{pass}@"),
    };
    format!(
        "tcp://{credentials}{}/{}?{DSN_OPTIONS}",
        cfg.endpoint, cfg.database
    )
}

fn table_name(database: &str, prefix: &str, dimension: &str) -> String {
    format!("{database}.{prefix}_{dimension}")
}

fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\
         project LowCardinality(String), \
         entity String, \
         boundary DateTime64(3), \
         counter Map(String, Int64), \
         gauge Map(String, Int64), \
         presence Map(String, Int64), \
         updated_date_time DateTime64(3)\
         ) ENGINE = ReplacingMergeTree(updated_date_time) \
         ORDER BY (project, entity, boundary)"
    )
}

fn insert_sql(table: &str, project: &str, snapshot: &Snapshot, updated: SystemTime) -> String {
    let mut sql = String::with_capacity(256);
    let _ = write!(
        sql,
        "INSERT INTO {table} ({COLUMNS}) VALUES ('{}', '{}', {}, {}, {}, {}, {})",
        escape_sql(project),
        escape_sql(&snapshot.entity),
        format_datetime(snapshot.boundary),
        format_map(&snapshot.stats.counter),
        format_map(&snapshot.stats.gauge),
        format_map(&snapshot.stats.presence),
        format_datetime(updated),
    );
    sql
}

// --- SQL formatting helpers ---

/// Formats a SystemTime as a ClickHouse DateTime64(3) literal.
fn format_datetime(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    format!("'{}'", dt.format("%Y-%m-%d %H:%M:%S%.3f"))
}

/// Escapes a string value for SQL insertion (single-quote escaping).
fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Formats stats as a `Map(String, Int64)` literal.
fn format_map(values: &StatMap) -> String {
    let mut out = String::with_capacity(values.len() * 16 + 2);
    out.push('{');
    for (idx, (name, value)) in values.iter().enumerate() {
        if idx > 0 {
            out.push_str(", ");
        }
        let escaped = escape_sql(name);
        let _ = write!(out, "'{escaped}': {value}");
    }
    out.push('}');
    out
}
