//! Server configuration surface.
//!
//! Every tunable the engine exposes lives on [`ServerConfig`], with
//! defaults matching the documented behavior. The struct deserializes
//! from JSON so hosts can load it from a file, and the section accessors
//! hand pre-sliced views to the subsystems that need them.
//!
//! # Examples
//!
//! ```rust
//! use catzilla::config::ServerConfig;
//!
//! let config = ServerConfig::default();
//! assert_eq!(config.port, 8080);
//! assert!(config.enable_hot_cache);
//!
//! let custom: ServerConfig =
//!     serde_json::from_str(r#"{"port": 9000, "max_workers": 8}"#).unwrap();
//! assert_eq!(custom.port, 9000);
//! assert_eq!(custom.max_workers, 8);
//! ```

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::EngineConfig;

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_true() -> bool {
    true
}
fn default_cache_size_mb() -> u64 {
    64
}
fn default_cache_ttl() -> u64 {
    300
}
fn default_max_file_size() -> u64 {
    100 * 1024 * 1024
}
fn default_initial_workers() -> usize {
    4
}
fn default_min_workers() -> usize {
    1
}
fn default_max_workers() -> usize {
    16
}
fn default_queue_size() -> u64 {
    10_000
}
fn default_task_pool_mb() -> u64 {
    64
}
fn default_rate_window() -> u64 {
    60
}
fn default_small_capacity() -> usize {
    64
}
fn default_medium_capacity() -> usize {
    32
}
fn default_large_capacity() -> usize {
    8
}
fn default_temp_dir() -> PathBuf {
    std::env::temp_dir()
}
fn default_scan_timeout() -> u64 {
    30
}

/// Whole-server configuration with documented defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,

    /// Whether static mounts keep a hot content cache.
    pub enable_hot_cache: bool,
    /// Hot cache byte budget, in MiB.
    pub cache_size_mb: u64,
    /// Soft TTL applied by the periodic sweep, in seconds.
    pub cache_default_ttl_seconds: u64,

    /// Largest file the static pipeline will serve, in bytes.
    pub max_file_size: u64,
    /// Extensions allowed on static mounts; empty allows everything not
    /// blocked.
    pub allowed_extensions: HashSet<String>,
    /// Extensions always rejected on static mounts.
    pub blocked_extensions: HashSet<String>,
    /// Render a directory listing instead of 403 for directories without
    /// an `index.html`.
    pub enable_directory_listing: bool,
    /// Serve dotfiles.
    pub enable_hidden_files: bool,
    /// Emit `ETag` headers and honour `If-None-Match`.
    pub enable_etags: bool,

    /// Worker threads started with the engine.
    pub initial_workers: usize,
    /// Lower bound for auto-scaling.
    pub min_workers: usize,
    /// Upper bound for auto-scaling.
    pub max_workers: usize,
    /// Soft capacity per task priority band.
    pub queue_size: u64,
    /// Whether the pool resizes with queue pressure.
    pub enable_auto_scaling: bool,
    /// Task arena budget, in MiB.
    pub task_memory_pool_mb: u64,

    /// Requests allowed per window per client; `0` disables limiting.
    pub rate_limit_max_requests: u32,
    /// Rate-limit window, in seconds.
    pub rate_limit_window_seconds: u64,

    /// Pre-populated 8 KiB upload buffers.
    pub upload_memory_pool_small_capacity: usize,
    /// Pre-populated 64 KiB upload buffers.
    pub upload_memory_pool_medium_capacity: usize,
    /// Pre-populated 1 MiB upload buffers.
    pub upload_memory_pool_large_capacity: usize,
    /// Directory for spilled upload parts.
    pub upload_temp_directory: PathBuf,

    /// Budget for one virus scan, in seconds.
    pub virus_scan_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            enable_hot_cache: default_true(),
            cache_size_mb: default_cache_size_mb(),
            cache_default_ttl_seconds: default_cache_ttl(),
            max_file_size: default_max_file_size(),
            allowed_extensions: HashSet::new(),
            blocked_extensions: HashSet::new(),
            enable_directory_listing: false,
            enable_hidden_files: false,
            enable_etags: default_true(),
            initial_workers: default_initial_workers(),
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            queue_size: default_queue_size(),
            enable_auto_scaling: default_true(),
            task_memory_pool_mb: default_task_pool_mb(),
            rate_limit_max_requests: 0,
            rate_limit_window_seconds: default_rate_window(),
            upload_memory_pool_small_capacity: default_small_capacity(),
            upload_memory_pool_medium_capacity: default_medium_capacity(),
            upload_memory_pool_large_capacity: default_large_capacity(),
            upload_temp_directory: default_temp_dir(),
            virus_scan_timeout_seconds: default_scan_timeout(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a JSON file. Missing fields fall back to
    /// defaults.
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: ServerConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Sanity-checks cross-field constraints.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.min_workers <= self.max_workers,
            "min_workers ({}) exceeds max_workers ({})",
            self.min_workers,
            self.max_workers,
        );
        anyhow::ensure!(
            self.rate_limit_window_seconds > 0,
            "rate_limit_window_seconds must be positive",
        );
        anyhow::ensure!(
            self.virus_scan_timeout_seconds > 0,
            "virus_scan_timeout_seconds must be positive",
        );
        Ok(())
    }

    /// `host:port` bind string.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Hot cache byte budget.
    pub fn cache_budget_bytes(&self) -> u64 {
        self.cache_size_mb * 1024 * 1024
    }

    /// Soft TTL for the cache sweep.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_default_ttl_seconds)
    }

    /// Virus scan budget.
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.virus_scan_timeout_seconds)
    }

    /// Task engine section of this configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            initial_workers: self.initial_workers,
            min_workers: self.min_workers,
            max_workers: self.max_workers,
            queue_size: self.queue_size,
            enable_auto_scaling: self.enable_auto_scaling,
            ..EngineConfig::default()
        }
    }
}
