//! Environment configuration tests
//!
//! These mutate process environment variables, so every test runs serially.

use agentbus_workspace::pubsub::ConfigError;
use agentbus_workspace::{ObservabilityConfig, PubSubConfig};
use agentbus_workspace::observability::LogFormat;
use serial_test::serial;
use std::time::Duration;

const PUBSUB_VARS: [&str; 5] = [
    "AGENTBUS_DEFAULT_TIMEOUT_MS",
    "AGENTBUS_MAX_PENDING",
    "AGENTBUS_PENDING_TTL_SECS",
    "AGENTBUS_CLEANUP_INTERVAL_SECS",
    "AGENTBUS_METRICS_MAX_TOPICS",
];

fn clear_env() {
    unsafe {
        for key in PUBSUB_VARS {
            std::env::remove_var(key);
        }
        std::env::remove_var("AGENTBUS_LOG_FORMAT");
    }
}

#[test]
#[serial]
fn test_defaults_without_env() {
    clear_env();
    let config = PubSubConfig::from_env().unwrap();
    assert_eq!(config, PubSubConfig::default());
}

#[test]
#[serial]
fn test_env_overrides() {
    clear_env();
    unsafe {
        std::env::set_var("AGENTBUS_DEFAULT_TIMEOUT_MS", "2500");
        std::env::set_var("AGENTBUS_MAX_PENDING", "64");
        std::env::set_var("AGENTBUS_PENDING_TTL_SECS", "30");
        std::env::set_var("AGENTBUS_CLEANUP_INTERVAL_SECS", "5");
        std::env::set_var("AGENTBUS_METRICS_MAX_TOPICS", "3");
    }

    let config = PubSubConfig::from_env().unwrap();
    assert_eq!(config.default_timeout, Duration::from_millis(2500));
    assert_eq!(config.max_pending, 64);
    assert_eq!(config.pending_ttl, Duration::from_secs(30));
    assert_eq!(config.cleanup_interval, Duration::from_secs(5));
    assert_eq!(config.metrics_max_topics, 3);

    clear_env();
}

#[test]
#[serial]
fn test_unparsable_value_names_the_variable() {
    clear_env();
    unsafe {
        std::env::set_var("AGENTBUS_MAX_PENDING", "lots");
    }

    match PubSubConfig::from_env() {
        Err(ConfigError::InvalidEnvVar { key, .. }) => assert_eq!(key, "AGENTBUS_MAX_PENDING"),
        other => panic!("expected InvalidEnvVar, got {other:?}"),
    }

    clear_env();
}

#[test]
#[serial]
fn test_inconsistent_values_fail_validation() {
    clear_env();
    unsafe {
        std::env::set_var("AGENTBUS_DEFAULT_TIMEOUT_MS", "120000");
        std::env::set_var("AGENTBUS_PENDING_TTL_SECS", "60");
    }

    assert!(matches!(
        PubSubConfig::from_env(),
        Err(ConfigError::ValidationError(_))
    ));

    clear_env();
}

#[test]
#[serial]
fn test_observability_format_from_env() {
    clear_env();
    unsafe {
        std::env::set_var("AGENTBUS_LOG_FORMAT", "pretty");
    }
    assert_eq!(
        ObservabilityConfig::from_env().unwrap().format,
        LogFormat::Pretty
    );

    unsafe {
        std::env::set_var("AGENTBUS_LOG_FORMAT", "yaml");
    }
    assert!(ObservabilityConfig::from_env().is_err());

    clear_env();
}
