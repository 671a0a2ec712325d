// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Database connection management with PRAGMA setup, WAL mode, and lifecycle.
//!
//! All statements run on tokio-rusqlite's single background thread. Clones of
//! [`Database`] share that thread, so writes from one process never contend
//! with each other. Writers in other processes are held off by
//! `BEGIN IMMEDIATE` plus the busy timeout; a timeout surfaces as
//! [`MeteredError::TransactionConflict`].

use chrono::{DateTime, Utc};
use metered_config::model::StorageConfig;
use metered_core::{Credits, MeteredError};
use rusqlite::ErrorCode;
use tracing::debug;

use crate::migrations;

/// Convert a tokio-rusqlite error into `MeteredError::Storage`.
pub(crate) fn map_tr_err(e: tokio_rusqlite::Error<rusqlite::Error>) -> MeteredError {
    MeteredError::storage(e)
}

/// Classify a rusqlite error; lock contention is a retryable conflict.
pub(crate) fn sql_err(e: rusqlite::Error) -> MeteredError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            MeteredError::TransactionConflict(e.to_string())
        }
        _ => MeteredError::storage(e),
    }
}

/// `?`-friendly conversion of rusqlite results inside `Database::call` closures.
pub(crate) trait SqlResultExt<T> {
    fn sql(self) -> Result<T, MeteredError>;
}

impl<T> SqlResultExt<T> for Result<T, rusqlite::Error> {
    fn sql(self) -> Result<T, MeteredError> {
        self.map_err(sql_err)
    }
}

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Fixed-width UTC timestamp; sorts lexically in chronological order.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Credits are stored as SQLite INTEGER (i64).
pub(crate) fn credits_to_sql(amount: Credits) -> Result<i64, MeteredError> {
    i64::try_from(amount)
        .map_err(|_| MeteredError::Validation(format!("credit amount {amount} is out of range")))
}

pub(crate) fn credits_from_sql(idx: usize, raw: i64) -> rusqlite::Result<Credits> {
    Credits::try_from(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Integer, Box::new(e))
    })
}

/// Handle to the ledger database.
#[derive(Clone)]
pub struct Database {
    conn: tokio_rusqlite::Connection,
}

impl Database {
    /// Open (or create) the database at `path` with default storage settings.
    pub async fn open(path: &str) -> Result<Self, MeteredError> {
        let config = StorageConfig {
            database_path: path.to_string(),
            ..StorageConfig::default()
        };
        Self::open_with_config(&config).await
    }

    /// Open the database described by `config`, apply PRAGMAs, and run migrations.
    pub async fn open_with_config(config: &StorageConfig) -> Result<Self, MeteredError> {
        if let Some(parent) = std::path::Path::new(&config.database_path).parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(MeteredError::storage)?;
        }
        let conn = tokio_rusqlite::Connection::open(&config.database_path)
            .await
            .map_err(MeteredError::storage)?;
        let db = Self { conn };
        db.prepare(config.wal_mode, config.busy_timeout()).await?;
        debug!(path = %config.database_path, "database opened");
        Ok(db)
    }

    /// Open a private in-memory database (tests, one-shot tooling).
    pub async fn open_in_memory() -> Result<Self, MeteredError> {
        let conn = tokio_rusqlite::Connection::open_in_memory()
            .await
            .map_err(MeteredError::storage)?;
        let db = Self { conn };
        db.prepare(false, StorageConfig::default().busy_timeout())
            .await?;
        Ok(db)
    }

    async fn prepare(
        &self,
        wal_mode: bool,
        busy_timeout: std::time::Duration,
    ) -> Result<(), MeteredError> {
        self.call(move |conn| {
            conn.busy_timeout(busy_timeout).sql()?;
            if wal_mode {
                let mode: String = conn
                    .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
                    .sql()?;
                debug!(journal_mode = %mode, "journal mode set");
                conn.pragma_update(None, "synchronous", "NORMAL").sql()?;
            }
            conn.pragma_update(None, "foreign_keys", "ON").sql()?;
            migrations::run_migrations(conn)
        })
        .await
    }

    /// The underlying tokio-rusqlite connection.
    pub fn connection(&self) -> &tokio_rusqlite::Connection {
        &self.conn
    }

    /// Run `f` on the database thread.
    ///
    /// The closure reports domain outcomes as `MeteredError`; only a closed
    /// connection surfaces as a tokio-rusqlite error.
    pub async fn call<T, F>(&self, f: F) -> Result<T, MeteredError>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, MeteredError> + Send + 'static,
        T: Send + 'static,
    {
        self.conn
            .call(move |conn| Ok::<_, rusqlite::Error>(f(conn)))
            .await
            .map_err(map_tr_err)?
    }

    /// Checkpoint the WAL so the database file is self-contained.
    pub async fn close(&self) -> Result<(), MeteredError> {
        self.call(|conn| {
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);").sql()?;
            Ok(())
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn open_runs_migrations() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/ledger.db");
        let db = Database::open(path.to_str().unwrap()).await.unwrap();

        let tables: Vec<String> = db
            .call(|conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT name FROM sqlite_master WHERE type = 'table' \
                         AND name NOT LIKE 'sqlite_%' AND name NOT LIKE 'refinery_%' \
                         ORDER BY name",
                    )
                    .sql()?;
                let names = stmt
                    .query_map([], |row| row.get(0))
                    .sql()?
                    .collect::<Result<Vec<String>, _>>()
                    .sql()?;
                Ok(names)
            })
            .await
            .unwrap();

        assert_eq!(
            tables,
            vec!["credit_balances", "credit_journal", "job_queue", "usage_operations"]
        );
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn reopen_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let path = path.to_str().unwrap();
        Database::open(path).await.unwrap().close().await.unwrap();
        let db = Database::open(path).await.unwrap();
        db.close().await.unwrap();
    }

    #[test]
    fn timestamps_round_trip_at_millisecond_precision() {
        let now = Utc::now();
        let formatted = format_ts(now);
        let parsed = parse_ts(0, &formatted).unwrap();
        assert_eq!(
            parsed.timestamp_millis(),
            now.timestamp_millis(),
            "{formatted}"
        );
    }

    #[test]
    fn busy_errors_are_conflicts() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        assert!(sql_err(busy).is_transient());
        assert!(!sql_err(rusqlite::Error::QueryReturnedNoRows).is_transient());
    }

    #[test]
    fn oversized_credit_amounts_are_rejected() {
        assert!(credits_to_sql(u64::MAX).is_err());
        assert_eq!(credits_to_sql(42).unwrap(), 42);
        assert!(credits_from_sql(0, -1).is_err());
    }
}
