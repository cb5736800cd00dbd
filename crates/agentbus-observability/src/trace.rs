//! Tracing subscriber installation

use crate::{LogFormat, ObservabilityConfig, ObservabilityError};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `config.default_filter`. Fails with
/// `TracingInit` if a global subscriber is already set.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<(), ObservabilityError> {
    let env_filter = build_filter(config)?;
    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match config.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init(),
    };
    result.map_err(|e| ObservabilityError::TracingInit(e.to_string()))?;

    tracing::info!(
        service = %config.service_name,
        format = ?config.format,
        "Initialized structured tracing"
    );
    Ok(())
}

fn build_filter(config: &ObservabilityConfig) -> Result<EnvFilter, ObservabilityError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.default_filter).map_err(|e| {
            ObservabilityError::Config(format!(
                "invalid filter '{}': {}",
                config.default_filter, e
            ))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_second_init_is_an_error() {
        let config = ObservabilityConfig::default();
        // Another test binary may have installed a subscriber already
        let _ = init_tracing(&config);
        assert!(matches!(
            init_tracing(&config),
            Err(ObservabilityError::TracingInit(_))
        ));
    }

    #[test]
    #[serial]
    fn test_invalid_default_filter() {
        let config = ObservabilityConfig::default().with_default_filter("agentbus=loud");
        if std::env::var("RUST_LOG").is_err() {
            assert!(build_filter(&config).is_err());
        }
    }
}
