// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `metered serve`: run the retry driver and the reconciler until shutdown.

use std::sync::Arc;

use metered_config::model::MeteredConfig;
use metered_core::MeteredError;
use metered_ledger::{Ledger, Reconciler, RetryDriver};
use metered_storage::{Database, SqliteBalanceStore, SqliteJobQueue, SqliteOperationStore};
use tracing::info;

use crate::shutdown;

/// The ledger and its SQLite backing, opened from configuration.
pub struct Services {
    pub db: Database,
    pub ledger: Arc<Ledger>,
    pub jobs: Arc<SqliteJobQueue>,
}

impl Services {
    pub async fn open(config: &MeteredConfig) -> Result<Self, MeteredError> {
        let db = Database::open_with_config(&config.storage).await?;
        let ledger = Arc::new(Ledger::new(
            Arc::new(SqliteBalanceStore::new(db.clone())),
            Arc::new(SqliteOperationStore::new(db.clone())),
            config.ledger.clone(),
        ));
        let jobs = Arc::new(SqliteJobQueue::new(db.clone()));
        Ok(Self { db, ledger, jobs })
    }

    pub fn driver(&self, config: &MeteredConfig) -> RetryDriver {
        RetryDriver::new(self.ledger.clone(), self.jobs.clone(), config.driver.clone())
    }

    pub fn reconciler(&self, config: &MeteredConfig) -> Reconciler {
        Reconciler::new(self.ledger.clone(), config.reconcile.clone())
    }
}

/// Runs the background loops until SIGINT/SIGTERM.
pub async fn run_serve(config: MeteredConfig) -> Result<(), MeteredError> {
    info!(
        name = %config.service.name,
        database = %config.storage.database_path,
        "starting metered serve"
    );
    let services = Services::open(&config).await?;
    let cancel = shutdown::install_signal_handler();
    let mut tasks = Vec::new();

    if config.driver.enabled {
        let driver = services.driver(&config);
        let driver_cancel = cancel.clone();
        info!(
            poll_interval_secs = config.driver.poll_interval_secs,
            max_attempts = config.driver.max_attempts,
            "retry driver enabled"
        );
        tasks.push(tokio::spawn(async move {
            driver.run(driver_cancel).await;
        }));
    } else {
        info!("retry driver disabled");
    }

    if config.reconcile.enabled {
        let reconciler = services.reconciler(&config);
        let reconcile_cancel = cancel.clone();
        info!(
            interval_secs = config.reconcile.interval_secs,
            grace_period_secs = config.reconcile.grace_period_secs,
            "reconciler enabled"
        );
        tasks.push(tokio::spawn(async move {
            reconciler.run(reconcile_cancel).await;
        }));
    } else {
        info!("reconciler disabled");
    }

    cancel.cancelled().await;
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "background task ended abnormally");
        }
    }

    services.db.close().await?;
    info!("metered serve shutdown complete");
    Ok(())
}

/// Initialize tracing with the configured level; `RUST_LOG` takes precedence.
pub fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "metered={log_level},metered_ledger={log_level},metered_storage={log_level},warn"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}
