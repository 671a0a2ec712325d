// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test harness for end-to-end ledger tests.
//!
//! `TestHarness` assembles a [`Ledger`] over a temp SQLite database with the
//! real stores and job queue, and exposes the pieces for assertions.

use std::sync::Arc;

use metered_config::model::{DriverConfig, LedgerConfig, MeteredConfig, StorageConfig};
use metered_core::{Credits, JobSource, MeteredError, OperationId, UserId};
use metered_ledger::{Ledger, Reconciler, RetryDriver};
use metered_storage::{Database, SqliteBalanceStore, SqliteJobQueue, SqliteOperationStore};
use rusqlite::params;

use crate::scripted_jobs::ScriptedJobs;

/// Builder for creating test environments with configurable options.
pub struct TestHarnessBuilder {
    grants: Vec<(UserId, Credits)>,
    ledger: LedgerConfig,
    driver: DriverConfig,
    busy_timeout_ms: Option<u64>,
}

impl TestHarnessBuilder {
    fn new() -> Self {
        Self {
            grants: Vec::new(),
            ledger: LedgerConfig::default(),
            driver: DriverConfig::default(),
            busy_timeout_ms: None,
        }
    }

    /// Fund `user` with `credits` before the test starts.
    pub fn with_credits(mut self, user: &str, credits: Credits) -> Self {
        self.grants.push((UserId::new(user), credits));
        self
    }

    /// Override the settlement retry policy.
    pub fn with_ledger_config(mut self, config: LedgerConfig) -> Self {
        self.ledger = config;
        self
    }

    /// Override the retry driver settings.
    pub fn with_driver_config(mut self, config: DriverConfig) -> Self {
        self.driver = config;
        self
    }

    /// How long a connection waits on another connection's write lock.
    ///
    /// A short timeout makes cross-connection contention surface as
    /// `TransactionConflict` instead of being absorbed by SQLite.
    pub fn with_busy_timeout_ms(mut self, ms: u64) -> Self {
        self.busy_timeout_ms = Some(ms);
        self
    }

    /// Build the harness, creating the temp database and all stores.
    pub async fn build(self) -> Result<TestHarness, MeteredError> {
        let temp_dir = tempfile::TempDir::new().map_err(MeteredError::storage)?;
        let db_path = temp_dir.path().join("ledger.db");

        let defaults = StorageConfig::default();
        let storage = StorageConfig {
            database_path: db_path.to_string_lossy().to_string(),
            busy_timeout_ms: self.busy_timeout_ms.unwrap_or(defaults.busy_timeout_ms),
            ..defaults
        };
        let db = Database::open_with_config(&storage).await?;

        let balances = Arc::new(SqliteBalanceStore::new(db.clone()));
        let operations = Arc::new(SqliteOperationStore::new(db.clone()));
        let jobs = Arc::new(SqliteJobQueue::new(db.clone()));
        let ledger = Arc::new(Ledger::new(
            balances.clone(),
            operations.clone(),
            self.ledger.clone(),
        ));

        for (user, credits) in &self.grants {
            ledger.grant(user, *credits).await?;
        }

        let config = MeteredConfig {
            storage,
            ledger: self.ledger,
            driver: self.driver,
            ..MeteredConfig::default()
        };

        Ok(TestHarness {
            ledger,
            balances,
            operations,
            jobs,
            scripted_jobs: Arc::new(ScriptedJobs::new()),
            db,
            config,
            _temp_dir: temp_dir,
        })
    }
}

/// A ledger over a temp SQLite database, cleaned up on drop.
pub struct TestHarness {
    pub ledger: Arc<Ledger>,
    pub balances: Arc<SqliteBalanceStore>,
    pub operations: Arc<SqliteOperationStore>,
    /// SQLite job queue sharing the ledger database.
    pub jobs: Arc<SqliteJobQueue>,
    /// Scripted job source for driver tests that do not need a queue.
    pub scripted_jobs: Arc<ScriptedJobs>,
    pub db: Database,
    pub config: MeteredConfig,
    _temp_dir: tempfile::TempDir,
}

impl TestHarness {
    pub fn builder() -> TestHarnessBuilder {
        TestHarnessBuilder::new()
    }

    /// A second ledger over the same database file through its own connection.
    ///
    /// Shares no memory with [`TestHarness::ledger`], like another process would.
    pub async fn open_peer(&self) -> Result<Arc<Ledger>, MeteredError> {
        let db = Database::open_with_config(&self.config.storage).await?;
        Ok(Arc::new(Ledger::new(
            Arc::new(SqliteBalanceStore::new(db.clone())),
            Arc::new(SqliteOperationStore::new(db)),
            self.config.ledger.clone(),
        )))
    }

    /// Retry driver reading job state from the SQLite queue.
    pub fn queue_driver(&self) -> RetryDriver {
        self.driver_with(self.jobs.clone())
    }

    /// Retry driver reading job state from [`ScriptedJobs`].
    pub fn scripted_driver(&self) -> RetryDriver {
        self.driver_with(self.scripted_jobs.clone())
    }

    fn driver_with(&self, jobs: Arc<dyn JobSource>) -> RetryDriver {
        RetryDriver::new(self.ledger.clone(), jobs, self.config.driver.clone())
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.ledger.clone(), self.config.reconcile.clone())
    }

    /// Move every journal entry `secs` seconds into the past.
    pub async fn age_journal(&self, secs: i64) -> Result<(), MeteredError> {
        let modifier = format!("-{secs} seconds");
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE credit_journal
                     SET created_at = strftime('%Y-%m-%dT%H:%M:%fZ', created_at, ?1)",
                    params![modifier],
                )
                .map_err(MeteredError::storage)?;
                Ok(())
            })
            .await
    }

    /// Move an operation's timestamps `secs` seconds into the past.
    pub async fn age_operation(&self, id: &OperationId, secs: i64) -> Result<(), MeteredError> {
        let modifier = format!("-{secs} seconds");
        let id = id.as_str().to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE usage_operations
                     SET created_at = strftime('%Y-%m-%dT%H:%M:%fZ', created_at, ?1),
                         updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', updated_at, ?1)
                     WHERE id = ?2",
                    params![modifier, id],
                )
                .map_err(MeteredError::storage)?;
                Ok(())
            })
            .await
    }
}
