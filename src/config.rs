use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::archive::DimensionSchedule;

/// Compression algorithms accepted by the HTTP warehouse.
pub const SUPPORTED_COMPRESSION: &[&str] = &["none", "gzip", "zstd", "zlib", "snappy"];

/// Top-level configuration for the statshub server.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Ingestion API listen address. Default: ":8080".
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Real-identity resolution for submission verification.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Periodic archival configuration.
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// How the caller's real identity is resolved.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    /// Identity provider kind. Default: oauth.
    #[serde(default)]
    pub provider: IdentityProviderKind,

    /// OpenID Connect userinfo endpoint used by the oauth provider.
    #[serde(default = "default_userinfo_endpoint")]
    pub userinfo_endpoint: String,

    /// Userinfo field holding the real identity. Default: "email".
    #[serde(default = "default_identity_field")]
    pub identity_field: String,

    /// Trusted header read by the header provider.
    #[serde(default = "default_identity_header")]
    pub header: String,

    /// Userinfo request timeout. Default: 10s.
    #[serde(default = "default_identity_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Identity provider kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityProviderKind {
    /// Bearer token forwarded to a userinfo endpoint.
    #[default]
    #[serde(rename = "oauth")]
    OAuth,
    /// Identity set by a fronting proxy in a request header.
    Header,
}

/// Periodic archival configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Warehouse project identifier stamped on every row. Archival is
    /// disabled when absent.
    #[serde(default)]
    pub project: Option<String>,

    /// Prefix for per-dimension warehouse tables. Default: "statshub".
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,

    /// Dimensions to archive and their intervals.
    #[serde(default = "default_dimensions")]
    pub dimensions: Vec<DimensionConfig>,

    /// ClickHouse warehouse backend.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    /// HTTP NDJSON warehouse backend (e.g., to Vector).
    #[serde(default)]
    pub http: HttpExportConfig,
}

/// One archived dimension.
#[derive(Debug, Clone, Deserialize)]
pub struct DimensionConfig {
    /// Dimension name. Also used as the warehouse table suffix.
    pub name: String,

    /// Archive interval, aligned to the Unix epoch.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// Enable the ClickHouse backend. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Native protocol endpoint (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Target database. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,
}

/// HTTP export configuration (e.g., for Vector).
#[derive(Debug, Clone, Deserialize)]
pub struct HttpExportConfig {
    /// Enable the HTTP backend. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// HTTP endpoint to send snapshots to.
    #[serde(default)]
    pub address: String,

    /// Additional HTTP headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Compression algorithm (none, gzip, zstd, zlib, snappy). Default: gzip.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Request timeout. Default: 30s.
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Enable HTTP keep-alive connections. Default: true.
    #[serde(default = "default_true")]
    pub keep_alive: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen_addr() -> String {
    ":8080".to_string()
}

fn default_userinfo_endpoint() -> String {
    "https://openidconnect.googleapis.com/v1/userinfo".to_string()
}

fn default_identity_field() -> String {
    "email".to_string()
}

fn default_identity_header() -> String {
    "X-Authenticated-User".to_string()
}

fn default_identity_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_table_prefix() -> String {
    "statshub".to_string()
}

fn default_dimensions() -> Vec<DimensionConfig> {
    vec![
        DimensionConfig {
            name: "fallback".to_string(),
            interval: Duration::from_secs(10 * 60),
        },
        DimensionConfig {
            name: "country".to_string(),
            interval: Duration::from_secs(60 * 60),
        },
        DimensionConfig {
            name: "user".to_string(),
            interval: Duration::from_secs(24 * 60 * 60),
        },
    ]
}

fn default_database() -> String {
    "default".to_string()
}

fn default_compression() -> String {
    "gzip".to_string()
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            listen_addr: default_listen_addr(),
            identity: IdentityConfig::default(),
            archive: ArchiveConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            provider: IdentityProviderKind::default(),
            userinfo_endpoint: default_userinfo_endpoint(),
            identity_field: default_identity_field(),
            header: default_identity_header(),
            timeout: default_identity_timeout(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            project: None,
            table_prefix: default_table_prefix(),
            dimensions: default_dimensions(),
            clickhouse: ClickHouseConfig::default(),
            http: HttpExportConfig::default(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
        }
    }
}

impl Default for HttpExportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            headers: HashMap::new(),
            compression: default_compression(),
            timeout: default_http_timeout(),
            keep_alive: true,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            bail!("listen_addr is required");
        }

        match self.identity.provider {
            IdentityProviderKind::OAuth => {
                if self.identity.userinfo_endpoint.is_empty() {
                    bail!("identity.userinfo_endpoint is required for the oauth provider");
                }
                if self.identity.identity_field.is_empty() {
                    bail!("identity.identity_field is required for the oauth provider");
                }
            }
            IdentityProviderKind::Header => {
                if self.identity.header.is_empty() {
                    bail!("identity.header is required for the header provider");
                }
            }
        }

        self.archive.validate()
    }
}

impl ArchiveConfig {
    /// Returns the project when archival is enabled.
    pub fn project(&self) -> Option<&str> {
        self.project.as_deref().filter(|p| !p.is_empty())
    }

    /// Per-dimension schedules in configuration order.
    pub fn schedules(&self) -> Vec<DimensionSchedule> {
        self.dimensions
            .iter()
            .map(|d| DimensionSchedule::new(&d.name, d.interval))
            .collect()
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for dim in &self.dimensions {
            if dim.name.is_empty() {
                bail!("archive.dimensions: name is required");
            }
            if !dim
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                bail!(
                    "archive.dimensions: name {:?} may only contain [A-Za-z0-9_]",
                    dim.name
                );
            }
            if !seen.insert(dim.name.as_str()) {
                bail!("archive.dimensions: duplicate dimension {:?}", dim.name);
            }
            if dim.interval.is_zero() {
                bail!("archive.dimensions: interval for {:?} must be positive", dim.name);
            }
        }

        if self.project().is_none() {
            return Ok(());
        }

        if self.dimensions.is_empty() {
            bail!("archive.dimensions must not be empty when archive.project is set");
        }

        if self.table_prefix.is_empty()
            || !self
                .table_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            bail!("archive.table_prefix must be non-empty and only contain [A-Za-z0-9_]");
        }

        match (self.clickhouse.enabled, self.http.enabled) {
            (true, true) => bail!("only one of archive.clickhouse and archive.http may be enabled"),
            (false, false) => {
                bail!("archive.project is set but no warehouse backend is enabled")
            }
            (true, false) => {
                if self.clickhouse.endpoint.is_empty() {
                    bail!("archive.clickhouse.endpoint is required");
                }
            }
            (false, true) => {
                if self.http.address.is_empty() {
                    bail!("archive.http.address is required");
                }
                if !SUPPORTED_COMPRESSION.contains(&self.http.compression.as_str()) {
                    bail!(
                        "archive.http.compression {:?} is not one of {:?}",
                        self.http.compression,
                        SUPPORTED_COMPRESSION
                    );
                }
            }
        }

        Ok(())
    }
}
