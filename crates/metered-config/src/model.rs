// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration model structs for the metered usage ledger.
//!
//! All structs use `#[serde(deny_unknown_fields)]` to reject unrecognized
//! config keys at startup, providing actionable error messages.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
///
/// Loaded from TOML files following XDG hierarchy, with environment variable overrides.
/// All sections are optional and default to sensible values.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MeteredConfig {
    /// Service identity and logging.
    #[serde(default)]
    pub service: ServiceConfig,

    /// SQLite storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Settlement retry policy.
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Retry/refund driver for asynchronous jobs.
    #[serde(default)]
    pub driver: DriverConfig,

    /// Reconciliation sweep for orphaned reservations and unsettled operations.
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

/// Service identity and logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Name used in log output.
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
        }
    }
}

fn default_service_name() -> String {
    "metered".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Storage backend configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Enable WAL (Write-Ahead Logging) mode for SQLite.
    #[serde(default = "default_wal_mode")]
    pub wal_mode: bool,

    /// How long a writer waits on a locked database before reporting a conflict.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            wal_mode: default_wal_mode(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StorageConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn default_database_path() -> String {
    dirs::data_dir()
        .map(|p| p.join("metered").join("metered.db"))
        .unwrap_or_else(|| std::path::PathBuf::from("metered.db"))
        .to_string_lossy()
        .into_owned()
}

fn default_wal_mode() -> bool {
    true
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

/// Settlement retry policy.
///
/// Settlement runs after the status transition has committed, so it is
/// retried with exponential backoff on transient store errors.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    /// Attempts after the first before settlement is left to the reconciler.
    #[serde(default = "default_settle_max_retries")]
    pub settle_max_retries: u32,

    /// Delay before the first retry; doubles on each attempt.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Upper bound on a single retry delay.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            settle_max_retries: default_settle_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl LedgerConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

fn default_settle_max_retries() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    50
}

fn default_retry_max_delay_ms() -> u64 {
    2_000
}

/// Retry/refund driver configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DriverConfig {
    /// Run the driver loop under `metered serve`.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between polls of pending operations.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Failed job attempts after which the operation is refunded.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Maximum pending operations examined per poll.
    #[serde(default = "default_driver_batch_size")]
    pub batch_size: usize,

    /// Pending operations with no tracked job older than this are refunded.
    /// Unset by default: the caller that cancelled untracked work refunds it.
    #[serde(default = "default_stale_pending_secs")]
    pub stale_pending_secs: Option<u64>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: default_poll_interval_secs(),
            max_attempts: default_max_attempts(),
            batch_size: default_driver_batch_size(),
            stale_pending_secs: default_stale_pending_secs(),
        }
    }
}

impl DriverConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_driver_batch_size() -> usize {
    100
}

fn default_stale_pending_secs() -> Option<u64> {
    None
}

/// Reconciliation sweep configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ReconcileConfig {
    /// Run the sweep loop under `metered serve`.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between sweeps.
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,

    /// Minimum age before a reservation or unsettled operation is touched.
    ///
    /// Must comfortably exceed the time `start` needs between reserving and
    /// creating the record, or in-flight starts get refunded.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    /// Maximum entries examined per sweep.
    #[serde(default = "default_reconcile_batch_size")]
    pub batch_size: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_reconcile_interval_secs(),
            grace_period_secs: default_grace_period_secs(),
            batch_size: default_reconcile_batch_size(),
        }
    }
}

impl ReconcileConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

fn default_reconcile_interval_secs() -> u64 {
    300
}

fn default_grace_period_secs() -> u64 {
    600
}

fn default_reconcile_batch_size() -> usize {
    500
}
