//! Configuration
//!
//! Two layers:
//!
//! - [`DaemonConfig`]: the YAML file under the data directory, created with
//!   defaults on first start
//! - [`EngineConfig`]: the typed settings the storage engine runs with,
//!   built from the file and CLI overrides

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default HTTP port
pub const DEFAULT_PORT: u16 = 1700;

/// Default idle time before a cached box is evicted
pub const DEFAULT_BOX_CACHE_SECONDS: u64 = 300;

/// Default bound on a blocked read
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 60;

/// Default evictor cadence
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Name of the config file inside the data directory
pub const CONFIG_FILE_NAME: &str = "config.yml";

/// Contents of `<data>/config.yml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DaemonConfig {
    /// Port the HTTP server binds
    pub server_bind_port: u16,
    /// Idle seconds before a cached box is evicted
    pub box_cache_seconds: u64,
    /// Seconds a blocked read may wait
    pub request_timeout_seconds: u64,
    /// Colorize log output
    pub log_color: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            server_bind_port: DEFAULT_PORT,
            box_cache_seconds: DEFAULT_BOX_CACHE_SECONDS,
            request_timeout_seconds: DEFAULT_REQUEST_TIMEOUT_SECONDS,
            log_color: true,
        }
    }
}

/// Where a loaded [`DaemonConfig`] came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOrigin {
    /// Read from an existing file
    Loaded,
    /// File was missing; defaults were written
    Created,
}

impl DaemonConfig {
    /// Load `path`, writing the defaults there first if it does not exist.
    ///
    /// Runs before logging is initialised, so the caller reports the origin.
    pub fn load_or_create(path: &Path) -> Result<(Self, ConfigOrigin)> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let config = Self::default();
            let yaml = serde_yaml::to_string(&config)
                .map_err(|e| Error::Config(format!("Failed to render defaults: {}", e)))?;
            std::fs::write(path, yaml)?;
            return Ok((config, ConfigOrigin::Created));
        }

        let raw = std::fs::read_to_string(path)?;
        Ok((Self::from_yaml(&raw)?, ConfigOrigin::Loaded))
    }

    /// Parse YAML; missing keys fall back to defaults
    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
            .map_err(|e| Error::Config(format!("Invalid configuration: {}", e)))
    }
}

/// Settings for one storage engine instance
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Data directory; databases live under `<data_dir>/db`
    pub data_dir: PathBuf,
    /// Idle time before a cached box is evicted
    pub box_cache_ttl: Duration,
    /// Evictor cadence
    pub sweep_interval: Duration,
    /// Bound on a blocked read
    pub request_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            box_cache_ttl: Duration::from_secs(DEFAULT_BOX_CACHE_SECONDS),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECONDS),
        }
    }
}

impl EngineConfig {
    /// Engine config rooted at `data_dir` with default timings
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Engine config from the daemon file
    pub fn from_daemon(data_dir: impl Into<PathBuf>, daemon: &DaemonConfig) -> Self {
        Self {
            data_dir: data_dir.into(),
            box_cache_ttl: Duration::from_secs(daemon.box_cache_seconds),
            request_timeout: Duration::from_secs(daemon.request_timeout_seconds),
            ..Default::default()
        }
    }

    /// Directory holding every database
    pub fn db_root(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval.is_zero() {
            return Err(Error::Config("sweep_interval must be > 0".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::Config("request_timeout must be > 0".into()));
        }
        if self.box_cache_ttl.is_zero() {
            return Err(Error::Config("box_cache_ttl must be > 0".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
