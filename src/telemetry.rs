//! Tracing setup
//!
//! Structured, async-aware logging for the trawler built on `tracing` and
//! `tracing-subscriber`:
//! - Structured events with `capture_id` / `state` fields on every transition
//! - Spans around poll cycles and products
//! - Pretty, compact or JSON output
//! - `RUST_LOG` overrides the configured level
//! - Events go to stderr; stdout belongs to command output
//!
//! # Example
//! ```no_run
//! use mtpa_trawler::{config::TrawlerConfig, telemetry};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TrawlerConfig::load()?;
//! telemetry::init_from_config(&config)?;
//! info!(capture_id = "1555862422_sdp_l0", "product acknowledged");
//! # Ok(())
//! # }
//! ```

use crate::config::TrawlerConfig;
use crate::error::{AppResult, TrawlerError};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Output format for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed format with colors (for development)
    Pretty,
    /// Compact single-line format (for the daemon)
    Compact,
    /// JSON format for log aggregation
    Json,
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Whether to include span events (NEW, CLOSE)
    pub with_span_events: bool,
    /// Whether to include file and line numbers
    pub with_file_and_line: bool,
    /// Whether to include thread names
    pub with_thread_names: bool,
    /// Whether to enable ANSI colors (Pretty format only)
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: false,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Create tracing config from the trawler configuration
    pub fn from_trawler_config(config: &TrawlerConfig) -> AppResult<Self> {
        let level = parse_log_level(&config.application.log_level)?;
        let format = parse_output_format(&config.application.log_format)?;

        Ok(Self {
            level,
            format,
            ..Default::default()
        })
    }

    /// Create tracing config with custom settings
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span events
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enable or disable ANSI colors
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize tracing from the trawler configuration
pub fn init_from_config(config: &TrawlerConfig) -> AppResult<()> {
    init(TracingConfig::from_trawler_config(config)?)
}

/// Initialize tracing with custom configuration
///
/// Idempotent: if a global subscriber is already installed this returns `Ok(())`.
pub fn init(config: TracingConfig) -> AppResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(config.level)));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .with_writer(std::io::stderr)
            .pretty()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(config.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .with_writer(std::io::stderr)
            .compact()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .with_writer(std::io::stderr)
            .json()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .or_else(|e| {
            // Tests and embedding callers may have installed a subscriber already
            if e
                .to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(TrawlerError::Configuration(format!(
                    "Failed to initialize tracing: {}",
                    e
                )))
            }
        })
}

/// Parse log level string into tracing Level
fn parse_log_level(level: &str) -> AppResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(TrawlerError::Configuration(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        ))),
    }
}

fn parse_output_format(format: &str) -> AppResult<OutputFormat> {
    match format.to_lowercase().as_str() {
        "pretty" => Ok(OutputFormat::Pretty),
        "compact" => Ok(OutputFormat::Compact),
        "json" => Ok(OutputFormat::Json),
        _ => Err(TrawlerError::Configuration(format!(
            "Invalid log format '{}'. Must be one of: pretty, compact, json",
            format
        ))),
    }
}

/// Convert Level to env filter string
fn level_to_filter_string(level: Level) -> String {
    match level {
        Level::TRACE => "trace".to_string(),
        Level::DEBUG => "debug".to_string(),
        Level::INFO => "info".to_string(),
        Level::WARN => "warn".to_string(),
        Level::ERROR => "error".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("warn"), Ok(Level::WARN)));
        assert!(matches!(parse_log_level("INFO"), Ok(Level::INFO)));
        assert!(parse_log_level("invalid").is_err());
    }

    #[test]
    fn test_tracing_config_from_trawler_config() {
        let mut config = TrawlerConfig::default();
        config.application.log_level = "debug".to_string();
        config.application.log_format = "json".to_string();

        let tracing_config = TracingConfig::from_trawler_config(&config).unwrap();
        assert!(matches!(tracing_config.level, Level::DEBUG));
        assert_eq!(tracing_config.format, OutputFormat::Json);
    }

    #[test]
    fn test_tracing_config_builder() {
        let config = TracingConfig::new(Level::WARN)
            .with_format(OutputFormat::Pretty)
            .with_span_events(true)
            .with_ansi(false);

        assert!(matches!(config.level, Level::WARN));
        assert_eq!(config.format, OutputFormat::Pretty);
        assert!(config.with_span_events);
        assert!(!config.with_ansi);
    }

    #[test]
    fn test_init_is_idempotent() {
        assert!(init(TracingConfig::new(Level::ERROR)).is_ok());
        assert!(init(TracingConfig::new(Level::ERROR)).is_ok());
    }
}
