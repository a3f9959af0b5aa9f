//! Configuration types for fleet-dns.
//!
//! The configuration file is JSON; durations arrive as nanosecond integers
//! the way the record publisher emits them.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DnsError;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the DNS server binds (UDP and TCP).
    #[serde(default = "default_address")]
    pub address: String,

    /// Port the DNS server binds.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Startup budget in nanoseconds: how long listeners and upchecks may
    /// take before the server gives up binding.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Per-attempt budget in nanoseconds for a single recursor exchange.
    #[serde(default = "default_recursor_timeout")]
    pub recursor_timeout: u64,

    /// Explicit upstream recursors. Empty means discover from the OS.
    #[serde(default)]
    pub recursors: Vec<String>,

    /// Glob pattern matching alias definition files.
    #[serde(default)]
    pub alias_files_glob: Option<String>,

    /// Delegated domain handlers (currently only `http` sources).
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,

    /// Names used for self-query upchecks, one UDP and one TCP check each.
    #[serde(default)]
    pub upcheck_domains: Vec<String>,

    /// Path to the columnar records JSON published for this deployment.
    pub records_file: PathBuf,

    /// Health probing configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Cache configuration for the catch-all forwarder.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// A delegated domain served from an external source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// The domain suffix this handler owns.
    pub domain: String,

    /// Whether responses from this source are cached.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Where answers come from.
    pub source: SourceConfig,
}

/// Source description for a delegated handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source kind; only `"http"` is recognized.
    #[serde(rename = "type")]
    pub kind: String,

    /// Base URL of the dns-json endpoint.
    #[serde(default)]
    pub url: String,
}

/// Health probing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Whether instance health filtering is active.
    #[serde(default)]
    pub enabled: bool,

    /// Port the per-instance health endpoint listens on.
    #[serde(default = "default_health_port")]
    pub port: u16,

    /// CA bundle for the health endpoint.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,

    /// Client certificate presented to the health endpoint.
    #[serde(default)]
    pub certificate_file: Option<PathBuf>,

    /// Client key presented to the health endpoint.
    #[serde(default)]
    pub private_key_file: Option<PathBuf>,

    /// Probe interval in nanoseconds.
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,

    /// Capacity of the tracked-domain transcript.
    #[serde(default = "default_max_tracked_queries")]
    pub max_tracked_queries: usize,
}

/// Response cache toggle.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether the cache is active.
    #[serde(default)]
    pub enabled: bool,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "fleet_dns=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_health_port(),
            ca_file: None,
            certificate_file: None,
            private_key_file: None,
            check_interval: default_check_interval(),
            max_tracked_queries: default_max_tracked_queries(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, with `FLEET_DNS`-prefixed
    /// environment overrides.
    pub fn load(path: &std::path::Path) -> Result<Self, DnsError> {
        let config: Self = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("FLEET_DNS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| DnsError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| DnsError::Config(e.to_string()))?;

        Ok(config)
    }

    /// The socket address the listeners bind.
    pub fn bind_address(&self) -> Result<SocketAddr, DnsError> {
        format!("{}:{}", self.address, self.port)
            .parse()
            .map_err(|_| DnsError::InvalidAddress(format!("{}:{}", self.address, self.port)))
    }

    /// Startup budget as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_nanos(self.timeout)
    }

    /// Per-attempt recursor budget as a [`Duration`].
    pub fn recursor_timeout(&self) -> Duration {
        Duration::from_nanos(self.recursor_timeout)
    }
}

impl HealthConfig {
    /// Probe interval as a [`Duration`].
    pub fn check_interval(&self) -> Duration {
        Duration::from_nanos(self.check_interval)
    }
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    53
}

fn default_timeout() -> u64 {
    Duration::from_secs(5).as_nanos() as u64
}

fn default_recursor_timeout() -> u64 {
    Duration::from_secs(2).as_nanos() as u64
}

fn default_health_port() -> u16 {
    8853
}

fn default_check_interval() -> u64 {
    Duration::from_secs(20).as_nanos() as u64
}

fn default_max_tracked_queries() -> usize {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}
