//! Trawler configuration using Figment
//!
//! Configuration is layered, later layers overriding earlier ones:
//! 1. Built-in defaults (every section is `#[serde(default)]`)
//! 2. A TOML file (`config/trawler.toml` unless another path is given)
//! 3. Environment variables prefixed with `MTPA_TRAWLER_`, using `__` between sections
//!    (e.g. `MTPA_TRAWLER_ARCHIVE__ENDPOINT=http://archive:9101`)
//!
//! Durations are written in humantime form (`"30s"`, `"2m"`, `"250ms"`).
//!
//! # Example
//! ```no_run
//! use mtpa_trawler::config::TrawlerConfig;
//!
//! let config = TrawlerConfig::load()?;
//! println!("Trawling {}", config.buffer.root.display());
//! # Ok::<(), mtpa_trawler::error::TrawlerError>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, TrawlerError};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/trawler.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "MTPA_TRAWLER_";

/// Top-level trawler configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrawlerConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// LOP buffer settings
    pub buffer: BufferConfig,
    /// Orchestrator settings
    pub transfer: TransferConfig,
    /// Archive endpoint settings
    pub archive: ArchiveConfig,
    /// Submission retry budget
    pub retry: RetryConfig,
    /// Transfer state persistence
    pub state: StateConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "mtpa-trawler".to_string(),
            log_level: "info".to_string(),
            log_format: "compact".to_string(),
        }
    }
}

/// Staging buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Root directory of the LOP buffer
    pub root: PathBuf,
    /// How long size and mtime must stay unchanged before a product is ready
    #[serde(with = "humantime_serde")]
    pub settle_interval: Duration,
    /// Ceiling for one buffer scan
    #[serde(with = "humantime_serde")]
    pub scan_timeout: Duration,
    /// Maximum number of products started per poll cycle
    pub max_products_per_cycle: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/data"),
            settle_interval: Duration::from_secs(30),
            scan_timeout: Duration::from_secs(10),
            max_products_per_cycle: 5000,
        }
    }
}

/// What happens to a product once the archive has acknowledged it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseMode {
    /// Remove the product files from the buffer
    Delete,
    /// Move the product files under `cold_storage_dir`
    Move,
}

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Sleep between poll cycles
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Number of products processed concurrently
    pub workers: usize,
    /// Ceiling for extracting one product
    #[serde(with = "humantime_serde")]
    pub extraction_timeout: Duration,
    /// How acknowledged products are released
    pub release: ReleaseMode,
    /// Destination for `release = "move"`
    pub cold_storage_dir: Option<PathBuf>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(20),
            workers: default_workers(),
            extraction_timeout: Duration::from_secs(120),
            release: ReleaseMode::Delete,
            cold_storage_dir: None,
        }
    }
}

/// Archive endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Base URL of the archive ingestion service
    pub endpoint: String,
    /// Timeout for a single archive request
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9101".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Submission retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total submission attempts before a product fails
    pub max_attempts: u32,
    /// First backoff delay
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Backoff ceiling
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Transfer state store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// JSON file holding the transfer state of every product
    pub path: PathBuf,
    /// How long released records stay in the live state file
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("trawler-state.json"),
            retention: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl TrawlerConfig {
    /// Load configuration from the default file (if present) and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path and environment variables
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The layered provider stack, exposed so callers can merge further overrides
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(TrawlerError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(TrawlerError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.transfer.workers == 0 {
            return Err(TrawlerError::Configuration(
                "transfer.workers must be at least 1".to_string(),
            ));
        }

        if self.buffer.max_products_per_cycle == 0 {
            return Err(TrawlerError::Configuration(
                "buffer.max_products_per_cycle must be at least 1".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(TrawlerError::Configuration(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(TrawlerError::Configuration(format!(
                "retry.initial_backoff ({}) exceeds retry.max_backoff ({})",
                humantime::format_duration(self.retry.initial_backoff),
                humantime::format_duration(self.retry.max_backoff)
            )));
        }

        if self.transfer.release == ReleaseMode::Move && self.transfer.cold_storage_dir.is_none()
        {
            return Err(TrawlerError::Configuration(
                "transfer.release = \"move\" requires transfer.cold_storage_dir".to_string(),
            ));
        }

        url::Url::parse(&self.archive.endpoint).map_err(|e| {
            TrawlerError::Configuration(format!(
                "Invalid archive endpoint '{}': {}",
                self.archive.endpoint, e
            ))
        })?;

        Ok(())
    }
}
