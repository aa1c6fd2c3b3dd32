// Structured logging setup
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::{
    fmt::{self, time::UtcTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub enable_colors: bool,
    pub enable_timestamps: bool,
    pub enable_line_numbers: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
    Compact,
    Pretty,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            enable_colors: true,
            enable_timestamps: true,
            enable_line_numbers: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter [{filter}]: {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("global subscriber already installed: {0}")]
    AlreadyInitialized(String),
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Logging manager
pub struct LoggingManager {
    config: LoggingConfig,
}

impl LoggingManager {
    pub fn new(config: LoggingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LoggingConfig {
        &self.config
    }

    /// Install the global subscriber. `RUST_LOG` wins over the configured level.
    pub fn initialize(&self) -> Result<(), LoggingError> {
        let filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => self.configured_filter()?,
        };

        Registry::default()
            .with(self.fmt_layer())
            .with(filter)
            .try_init()
            .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

        info!(level = %self.config.level, format = ?self.config.format, "logging initialized");
        Ok(())
    }

    fn configured_filter(&self) -> Result<EnvFilter, LoggingError> {
        EnvFilter::try_new(&self.config.level).map_err(|e| LoggingError::InvalidFilter {
            filter: self.config.level.clone(),
            reason: e.to_string(),
        })
    }

    fn fmt_layer(&self) -> BoxedLayer {
        let base = fmt::layer()
            .with_ansi(self.config.enable_colors)
            .with_line_number(self.config.enable_line_numbers);

        match (self.config.format, self.config.enable_timestamps) {
            (LogFormat::Json, true) => base.json().with_timer(UtcTime::rfc_3339()).boxed(),
            (LogFormat::Json, false) => base.json().without_time().boxed(),
            (LogFormat::Compact, true) => base.compact().with_timer(UtcTime::rfc_3339()).boxed(),
            (LogFormat::Compact, false) => base.compact().without_time().boxed(),
            (LogFormat::Pretty, true) => base.pretty().with_timer(UtcTime::rfc_3339()).boxed(),
            (LogFormat::Pretty, false) => base.pretty().without_time().boxed(),
            (LogFormat::Text, true) => base.with_timer(UtcTime::rfc_3339()).boxed(),
            (LogFormat::Text, false) => base.without_time().boxed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_names() {
        let config: LoggingConfig = serde_yaml::from_str("level: debug\nformat: json\n").unwrap();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, "debug");
        assert!(config.enable_timestamps);
    }

    #[test]
    fn test_invalid_level_is_reported() {
        let manager = LoggingManager::new(LoggingConfig {
            level: "seed_ping=loudest".to_string(),
            ..LoggingConfig::default()
        });
        assert!(matches!(
            manager.configured_filter(),
            Err(LoggingError::InvalidFilter { .. })
        ));
    }
}
