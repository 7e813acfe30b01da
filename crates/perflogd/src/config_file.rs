//! Configuration file support for perflogd
//!
//! Loads and validates perflogd configuration from TOML files. Every field
//! has a default, so an empty or missing file yields a runnable config.
//! Command line flags override file values.

use crate::engine::DEFAULT_INTERVAL_MS;
use crate::error::{PerflogError, Result};
use crate::filter::FeatureSelection;
use crate::sqlite_store::DEFAULT_DB_PATH;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::info;

/// Log levels accepted by `[logging] level`
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Sampling loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Sampling interval in milliseconds (>= 1)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// `"all"`, a comma-separated list, or an array of feature names
    #[serde(default)]
    pub features: FeatureSelection,
}

/// Sample database configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    /// Delete the database file when sampling stops
    #[serde(default)]
    pub delete_on_exit: bool,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Prometheus endpoint configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Serve `/metrics` while sampling
    #[serde(default)]
    pub enabled: bool,

    /// Listen address of the metrics endpoint
    #[serde(default = "default_metrics_addr")]
    pub listen_addr: SocketAddr,
}

/// Complete perflogd configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerflogConfig {
    /// Sampling configuration
    #[serde(default)]
    pub sampler: SamplerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

// Default functions
fn default_interval_ms() -> u64 {
    DEFAULT_INTERVAL_MS
}

fn default_db_path() -> PathBuf {
    PathBuf::from(DEFAULT_DB_PATH)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9101))
}

// Default implementations
impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            features: FeatureSelection::All,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            delete_on_exit: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_metrics_addr(),
        }
    }
}

impl PerflogConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| PerflogError::invalid_config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content).map_err(|e| {
                PerflogError::invalid_config(format!("{}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(PerflogError::Io(e)),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.sampler.interval_ms == 0 {
            return Err(PerflogError::invalid_config("interval_ms must be >= 1"));
        }

        self.sampler.features.validate()?;

        if self.database.path.as_os_str().is_empty() {
            return Err(PerflogError::invalid_config("database path must not be empty"));
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(PerflogError::invalid_config(format!(
                "unknown log level {:?}, expected one of {}",
                self.logging.level,
                LOG_LEVELS.join(", ")
            )));
        }

        Ok(())
    }
}
