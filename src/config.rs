//! Configuration loading and types for Tessera.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct. Every field has a default, so an empty file (or
//! [`Config::default`]) is a working in-process setup.

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Storage backend settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Multipart upload lifecycle settings.
    #[serde(default)]
    pub multipart: MultipartConfig,

    /// RPC client settings used by the gateway backend.
    #[serde(default)]
    pub rpc: RpcConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Storage backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend type: `local`, `memory` or `gateway`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Local storage configuration.
    #[serde(default)]
    pub local: LocalStorageConfig,

    /// Memory storage configuration.
    #[serde(default)]
    pub memory: MemoryStorageConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            local: LocalStorageConfig::default(),
            memory: MemoryStorageConfig::default(),
        }
    }
}

/// Local filesystem storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalStorageConfig {
    /// Root directory for buckets, staged parts and scratch files.
    #[serde(default = "default_storage_root")]
    pub root_dir: String,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_storage_root(),
        }
    }
}

/// Memory storage backend configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MemoryStorageConfig {
    /// Maximum total size in bytes (0 = unlimited).
    #[serde(default)]
    pub max_size_bytes: u64,
}

/// Multipart upload lifecycle configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MultipartConfig {
    /// Uploads older than this are aborted by the cleanup task (0 = never).
    #[serde(default = "default_stale_upload_expiry")]
    pub stale_upload_expiry_seconds: u64,

    /// How often the cleanup task runs.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
}

impl MultipartConfig {
    /// Age after which an open upload is expired, or `None` when expiry is
    /// disabled.
    pub fn stale_upload_max_age(&self) -> Option<chrono::Duration> {
        match self.stale_upload_expiry_seconds {
            0 => None,
            secs => {
                let secs = secs.min(MAX_MULTIPART_DURATION_SECONDS) as i64;
                chrono::Duration::try_seconds(secs)
            }
        }
    }

    /// Period of the cleanup task, at least one second.
    pub fn cleanup_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            self.cleanup_interval_seconds
                .clamp(1, MAX_MULTIPART_DURATION_SECONDS),
        )
    }
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            stale_upload_expiry_seconds: default_stale_upload_expiry(),
            cleanup_interval_seconds: default_cleanup_interval(),
        }
    }
}

/// Authenticated RPC client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    /// Server address, `host:port`.
    #[serde(default = "default_rpc_server_addr")]
    pub server_addr: String,

    /// Path on the server receiving RPC calls.
    #[serde(default = "default_service_endpoint")]
    pub service_endpoint: String,

    /// Service name; the login method is `{service_name}.Login`.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Access key presented at login (also accepts `access_key_id`).
    #[serde(alias = "access_key_id", default)]
    pub access_key: String,

    /// Secret key presented at login (also accepts `secret_access_key`).
    #[serde(alias = "secret_access_key", default)]
    pub secret_key: String,

    /// Do not reconnect after the server closes the connection.
    #[serde(default)]
    pub disable_reconnect: bool,

    /// Backoff unit in milliseconds.
    #[serde(default = "default_retry_unit_ms")]
    pub retry_unit_ms: u64,

    /// Backoff cap in milliseconds.
    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,

    /// Maximum retries of a call whose connection was shut down.
    #[serde(default = "default_retry_attempt_threshold")]
    pub retry_attempt_threshold: u32,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            server_addr: default_rpc_server_addr(),
            service_endpoint: default_service_endpoint(),
            service_name: default_service_name(),
            access_key: String::new(),
            secret_key: String::new(),
            disable_reconnect: false,
            retry_unit_ms: default_retry_unit_ms(),
            retry_cap_ms: default_retry_cap_ms(),
            retry_attempt_threshold: default_retry_attempt_threshold(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection.
    #[serde(default)]
    pub metrics: bool,

    /// Listen address of the Prometheus scrape endpoint.
    #[serde(default = "default_metrics_listen")]
    pub metrics_listen: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics: false,
            metrics_listen: default_metrics_listen(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_storage_backend() -> String {
    "local".to_string()
}

fn default_storage_root() -> String {
    "./data/objects".to_string()
}

fn default_stale_upload_expiry() -> u64 {
    86_400
}

fn default_cleanup_interval() -> u64 {
    3_600
}

fn default_rpc_server_addr() -> String {
    "127.0.0.1:9000".to_string()
}

fn default_service_endpoint() -> String {
    "/tessera/rpc".to_string()
}

fn default_service_name() -> String {
    "Storage".to_string()
}

fn default_retry_unit_ms() -> u64 {
    1_000
}

fn default_retry_cap_ms() -> u64 {
    30_000
}

fn default_retry_attempt_threshold() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_listen() -> String {
    "127.0.0.1:9464".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

/// Upper bound for the multipart expiry and cleanup periods (100 years).
pub const MAX_MULTIPART_DURATION_SECONDS: u64 = 100 * 365 * 24 * 60 * 60;

impl Config {
    /// Reject values the runtime cannot represent.
    pub fn validate(&self) -> anyhow::Result<()> {
        let multipart = &self.multipart;
        anyhow::ensure!(
            multipart.stale_upload_expiry_seconds <= MAX_MULTIPART_DURATION_SECONDS,
            "multipart.stale_upload_expiry_seconds must be at most {MAX_MULTIPART_DURATION_SECONDS}"
        );
        anyhow::ensure!(
            multipart.cleanup_interval_seconds <= MAX_MULTIPART_DURATION_SECONDS,
            "multipart.cleanup_interval_seconds must be at most {MAX_MULTIPART_DURATION_SECONDS}"
        );
        Ok(())
    }
}
