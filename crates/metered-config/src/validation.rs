// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Post-deserialization validation for configuration values.

use crate::diagnostic::ConfigError;
use crate::model::MeteredConfig;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Validate a deserialized configuration for semantic correctness.
///
/// Collects every failure instead of stopping at the first one.
pub fn validate_config(config: &MeteredConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();
    let mut fail = |message: String| errors.push(ConfigError::Validation { message });

    if !LOG_LEVELS.contains(&config.service.log_level.to_ascii_lowercase().as_str()) {
        fail(format!(
            "service.log_level `{}` must be one of {}",
            config.service.log_level,
            LOG_LEVELS.join(", ")
        ));
    }

    if config.storage.database_path.trim().is_empty() {
        fail("storage.database_path must not be empty".to_string());
    }

    if config.ledger.retry_base_delay_ms > config.ledger.retry_max_delay_ms {
        fail(format!(
            "ledger.retry_base_delay_ms ({}) must not exceed ledger.retry_max_delay_ms ({})",
            config.ledger.retry_base_delay_ms, config.ledger.retry_max_delay_ms
        ));
    }

    if config.driver.max_attempts == 0 {
        fail("driver.max_attempts must be at least 1".to_string());
    }

    if config.driver.poll_interval_secs == 0 {
        fail("driver.poll_interval_secs must be at least 1".to_string());
    }

    if config.driver.batch_size == 0 {
        fail("driver.batch_size must be at least 1".to_string());
    }

    if config.reconcile.interval_secs == 0 {
        fail("reconcile.interval_secs must be at least 1".to_string());
    }

    if config.reconcile.batch_size == 0 {
        fail("reconcile.batch_size must be at least 1".to_string());
    }

    // An orphan check younger than the busy timeout could race a start that
    // is still waiting on the write lock.
    let busy_secs = config.storage.busy_timeout_ms.div_ceil(1_000);
    if config.reconcile.grace_period_secs <= busy_secs {
        fail(format!(
            "reconcile.grace_period_secs ({}) must exceed storage.busy_timeout_ms ({} ms)",
            config.reconcile.grace_period_secs, config.storage.busy_timeout_ms
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
