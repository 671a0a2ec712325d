// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reconciliation sweep for the two crash windows of the ledger.
//!
//! A process that dies between reserving credits and writing the operation
//! record leaves a `reserve` journal entry with no operation: the sweep
//! returns those credits. A process that dies between the status transition
//! and the balance settlement leaves a terminal operation without
//! `settled_at`: the sweep settles it again. Both repairs only touch entries
//! older than the grace period, so in-flight calls are never raced.

use std::sync::Arc;

use chrono::Utc;
use metered_config::model::ReconcileConfig;
use metered_core::{JournalEntry, MeteredError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ledger::Ledger;

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Reservations examined.
    pub checked: usize,
    /// Orphaned reservations refunded.
    pub compensated: usize,
    /// Terminal operations whose settlement was re-applied.
    pub resettled: usize,
    pub errors: usize,
}

pub struct Reconciler {
    ledger: Arc<Ledger>,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(ledger: Arc<Ledger>, config: ReconcileConfig) -> Self {
        Self { ledger, config }
    }

    /// Returns whether the reservation was orphaned and has been refunded.
    async fn reconcile_reservation(&self, entry: &JournalEntry) -> Result<bool, MeteredError> {
        let balances = self.ledger.balances();
        if let Some(operation_id) = &entry.operation_id {
            match self.ledger.operation(operation_id).await {
                Ok(_) => {
                    balances.mark_reconciled(entry.id).await?;
                    return Ok(false);
                }
                Err(MeteredError::OperationNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let refunded = balances.compensate(entry).await?;
        if refunded {
            warn!(
                entry_id = entry.id,
                operation_id = ?entry.operation_id.as_ref().map(|id| id.as_str()),
                user_id = %entry.user_id,
                credits = entry.delta.unsigned_abs(),
                "orphaned reservation compensated"
            );
        }
        Ok(refunded)
    }

    /// One pass: compensate orphaned reservations, then re-settle stuck operations.
    pub async fn sweep(&self) -> Result<SweepReport, MeteredError> {
        let grace = chrono::Duration::from_std(self.config.grace_period())
            .map_err(|e| MeteredError::Config(format!("grace period out of range: {e}")))?;
        let cutoff = Utc::now() - grace;
        let mut report = SweepReport::default();

        let reservations = self
            .ledger
            .balances()
            .unreconciled_reservations(cutoff, self.config.batch_size)
            .await?;
        report.checked = reservations.len();
        for entry in &reservations {
            match self.reconcile_reservation(entry).await {
                Ok(true) => report.compensated += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(entry_id = entry.id, error = %e, "could not reconcile reservation");
                    report.errors += 1;
                }
            }
        }

        let unsettled = self
            .ledger
            .operations()
            .list_unsettled(cutoff, self.config.batch_size)
            .await?;
        for operation in &unsettled {
            match self.ledger.settle(operation).await {
                Ok(settlement) => {
                    warn!(
                        operation_id = %operation.id,
                        ?settlement,
                        "settlement re-applied for unsettled operation"
                    );
                    report.resettled += 1;
                }
                Err(e) => {
                    warn!(operation_id = %operation.id, error = %e, "could not settle operation");
                    report.errors += 1;
                }
            }
        }

        if report.compensated > 0 || report.resettled > 0 || report.errors > 0 {
            info!(?report, "reconciliation sweep complete");
        } else {
            debug!(?report, "reconciliation sweep complete");
        }
        Ok(report)
    }

    /// Sweep on `interval` until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "reconciliation sweep failed (non-fatal)");
                    }
                }
                _ = cancel.cancelled() => {
                    info!("reconciler shutting down");
                    break;
                }
            }
        }
    }
}
