// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests for the configuration system.

use std::path::Path;

use metered_config::diagnostic::ConfigError;
use metered_config::model::MeteredConfig;
use metered_config::{load_and_validate_str, load_config_from_path, load_config_from_str};
use serial_test::serial;

/// Valid TOML with every known section deserializes successfully.
#[test]
fn valid_toml_deserializes_into_config() {
    let toml = r#"
[service]
name = "billing-ledger"
log_level = "debug"

[storage]
database_path = "/tmp/ledger.db"
wal_mode = false
busy_timeout_ms = 2000

[ledger]
settle_max_retries = 8
retry_base_delay_ms = 10
retry_max_delay_ms = 500

[driver]
enabled = false
poll_interval_secs = 5
max_attempts = 4
batch_size = 20
stale_pending_secs = 120

[reconcile]
interval_secs = 60
grace_period_secs = 900
batch_size = 50
"#;

    let config = load_config_from_str(toml).expect("valid TOML should deserialize");
    assert_eq!(config.service.name, "billing-ledger");
    assert_eq!(config.service.log_level, "debug");
    assert_eq!(config.storage.database_path, "/tmp/ledger.db");
    assert!(!config.storage.wal_mode);
    assert_eq!(config.storage.busy_timeout().as_millis(), 2000);
    assert_eq!(config.ledger.settle_max_retries, 8);
    assert_eq!(config.ledger.base_delay().as_millis(), 10);
    assert!(!config.driver.enabled);
    assert_eq!(config.driver.max_attempts, 4);
    assert_eq!(config.driver.stale_pending_secs, Some(120));
    assert_eq!(config.reconcile.grace_period().as_secs(), 900);
    assert_eq!(config.reconcile.batch_size, 50);
}

/// An empty file yields the compiled defaults.
#[test]
fn missing_sections_use_defaults() {
    let config = load_config_from_str("").expect("empty TOML should use defaults");

    assert_eq!(config.service.name, "metered");
    assert_eq!(config.service.log_level, "info");
    assert!(config.storage.database_path.ends_with("metered.db"));
    assert!(config.storage.wal_mode);
    assert_eq!(config.ledger.settle_max_retries, 5);
    assert!(config.driver.enabled);
    assert_eq!(config.driver.max_attempts, 3);
    assert_eq!(config.driver.stale_pending_secs, None);
    assert_eq!(config.reconcile.grace_period_secs, 600);
}

/// Unknown keys are rejected with a suggestion.
#[test]
fn unknown_key_gets_suggestion() {
    let toml = r#"
[driver]
max_atempts = 3
"#;

    let errors = load_and_validate_str(toml).expect_err("should reject unknown field");
    let suggestion = errors.iter().find_map(|e| match e {
        ConfigError::UnknownKey { key, suggestion, .. } if key == "max_atempts" => {
            suggestion.clone()
        }
        _ => None,
    });
    assert_eq!(suggestion.as_deref(), Some("max_attempts"));
}

/// A value of the wrong type is reported, not silently defaulted.
#[test]
fn wrong_type_is_reported() {
    let toml = r#"
[ledger]
settle_max_retries = "many"
"#;

    let errors = load_and_validate_str(toml).expect_err("should reject string");
    assert!(
        errors
            .iter()
            .any(|e| matches!(e, ConfigError::InvalidType { .. } | ConfigError::Other(_))),
        "got: {errors:?}"
    );
}

/// Semantic validation runs after deserialization.
#[test]
fn validation_runs_after_parse() {
    let toml = r#"
[driver]
max_attempts = 0
"#;

    let errors = load_and_validate_str(toml).expect_err("zero attempts is invalid");
    assert!(errors.iter().any(
        |e| matches!(e, ConfigError::Validation { message } if message.contains("max_attempts"))
    ));
}

/// `METERED_RECONCILE_GRACE_PERIOD_SECS` maps to `reconcile.grace_period_secs`,
/// not `reconcile.grace.period.secs`.
#[test]
#[serial]
fn env_var_with_underscored_key_maps_to_section() {
    // SAFETY: serialized with every other test touching the environment.
    unsafe {
        std::env::set_var("METERED_RECONCILE_GRACE_PERIOD_SECS", "1234");
        std::env::set_var("METERED_STORAGE_DATABASE_PATH", "/tmp/from-env.db");
    }

    let result = load_config_from_path(Path::new("/nonexistent/metered.toml"));

    unsafe {
        std::env::remove_var("METERED_RECONCILE_GRACE_PERIOD_SECS");
        std::env::remove_var("METERED_STORAGE_DATABASE_PATH");
    }

    let config: MeteredConfig = result.expect("env overrides should apply");
    assert_eq!(config.reconcile.grace_period_secs, 1234);
    assert_eq!(config.storage.database_path, "/tmp/from-env.db");
}

/// Missing config files are silently skipped.
#[test]
#[serial]
fn missing_config_file_is_skipped() {
    let config = load_config_from_path(Path::new("/nonexistent/metered.toml"))
        .expect("missing file should be silently skipped");
    assert_eq!(config.service.name, "metered");
}

/// Upper-case variables for numeric driver keys override the file.
#[test]
#[serial]
fn env_var_overrides_driver_attempts() {
    // SAFETY: serialized with every other test touching the environment.
    unsafe {
        std::env::set_var("METERED_DRIVER_MAX_ATTEMPTS", "7");
    }

    let result = load_config_from_path(Path::new("/nonexistent/metered.toml"));

    unsafe {
        std::env::remove_var("METERED_DRIVER_MAX_ATTEMPTS");
    }

    let config = result.expect("driver override should apply");
    assert_eq!(config.driver.max_attempts, 7);
}
