//! Agentbus Observability
//!
//! Installs the process-wide `tracing` subscriber used by agents running
//! the pub/sub core. Library crates only emit events; binaries call
//! [`init_observability`] once at startup.

#[cfg(feature = "tracing")]
pub mod trace;

#[cfg(feature = "tracing")]
pub use trace::init_tracing;

/// Output format of the fmt layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per event
    #[default]
    Json,
    /// Human-readable multi-line output
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = ObservabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            other => Err(ObservabilityError::Config(format!(
                "unknown log format '{other}', expected 'json' or 'pretty'"
            ))),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservabilityConfig {
    /// Enable the tracing subscriber
    pub tracing_enabled: bool,
    /// Filter directive used when `RUST_LOG` is not set
    pub default_filter: String,
    /// Output format
    pub format: LogFormat,
    /// Service name attached to the startup event
    pub service_name: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            tracing_enabled: true,
            default_filter: "info".to_string(),
            format: LogFormat::Json,
            service_name: "agentbus".to_string(),
        }
    }
}

impl ObservabilityConfig {
    /// Load configuration from environment variables
    ///
    /// - `AGENTBUS_TRACING_ENABLED` - `true`/`false` (default: true)
    /// - `AGENTBUS_LOG_LEVEL` - Default filter directive (default: info)
    /// - `AGENTBUS_LOG_FORMAT` - `json` or `pretty` (default: json)
    /// - `AGENTBUS_SERVICE_NAME` - Service name (default: agentbus)
    pub fn from_env() -> Result<Self, ObservabilityError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("AGENTBUS_TRACING_ENABLED") {
            config.tracing_enabled = val.parse::<bool>().map_err(|e| {
                ObservabilityError::Config(format!(
                    "AGENTBUS_TRACING_ENABLED: invalid bool '{val}': {e}"
                ))
            })?;
        }
        if let Ok(level) = std::env::var("AGENTBUS_LOG_LEVEL") {
            if level.trim().is_empty() {
                return Err(ObservabilityError::Config(
                    "AGENTBUS_LOG_LEVEL must not be empty".to_string(),
                ));
            }
            config.default_filter = level;
        }
        if let Ok(format) = std::env::var("AGENTBUS_LOG_FORMAT") {
            config.format = format.parse()?;
        }
        if let Ok(name) = std::env::var("AGENTBUS_SERVICE_NAME") {
            config.service_name = name;
        }

        Ok(config)
    }

    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_default_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }
}

/// Initialize observability framework
pub fn init_observability(config: &ObservabilityConfig) -> Result<(), ObservabilityError> {
    #[cfg(feature = "tracing")]
    if config.tracing_enabled {
        trace::init_tracing(config)?;
    }

    #[cfg(not(feature = "tracing"))]
    let _ = config;

    Ok(())
}

/// Observability framework errors
#[derive(thiserror::Error, Debug)]
pub enum ObservabilityError {
    #[error("Tracing initialization failed: {0}")]
    TracingInit(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
