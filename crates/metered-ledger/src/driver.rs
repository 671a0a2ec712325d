// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Retry/refund driver for operations backed by asynchronous jobs.
//!
//! Each poll walks the pending operations, asks the [`JobSource`] how the
//! underlying job is doing, and finalizes the operations whose jobs have
//! resolved: a success is charged at its actual cost, a job that used up its
//! attempts is refunded. Before a refund the job is abandoned at the source,
//! so refunded work can never be claimed and delivered afterwards. Polling is
//! at-least-once; repeated finalization is absorbed by [`Ledger::finalize`].

use std::sync::Arc;

use chrono::Utc;
use metered_config::model::DriverConfig;
use metered_core::{JobSource, JobStatus, MeteredError, Transition, UsageOperation};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ledger::Ledger;

/// Counts from one driver poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub examined: usize,
    pub charged: usize,
    pub refunded: usize,
    pub waiting: usize,
    pub errors: usize,
}

enum Action {
    Charge(Transition),
    Refund(Transition),
    Wait,
}

/// Polls pending operations and finalizes those whose jobs have resolved.
pub struct RetryDriver {
    ledger: Arc<Ledger>,
    jobs: Arc<dyn JobSource>,
    config: DriverConfig,
}

impl RetryDriver {
    pub fn new(ledger: Arc<Ledger>, jobs: Arc<dyn JobSource>, config: DriverConfig) -> Self {
        Self {
            ledger,
            jobs,
            config,
        }
    }

    fn decide(&self, operation: &UsageOperation, status: JobStatus) -> Action {
        match status {
            JobStatus::Succeeded { cost, result } => {
                Action::Charge(Transition::success(cost, result))
            }
            JobStatus::Exhausted { attempts, error } => Action::Refund(Transition::refund(
                None,
                Some(format!("job gave up after {attempts} attempts: {error}")),
            )),
            JobStatus::Failed { attempts, error } if attempts >= self.config.max_attempts => {
                Action::Refund(Transition::refund(
                    None,
                    Some(format!("job failed after {attempts} attempts: {error}")),
                ))
            }
            JobStatus::Failed { attempts, .. } => {
                debug!(operation_id = %operation.id, attempts, "job failed, awaiting retry");
                Action::Wait
            }
            JobStatus::Running => Action::Wait,
            JobStatus::Untracked => {
                let Some(stale_secs) = self.config.stale_pending_secs else {
                    return Action::Wait;
                };
                let age = Utc::now().signed_duration_since(operation.created_at);
                if age.num_seconds() >= i64::try_from(stale_secs).unwrap_or(i64::MAX) {
                    Action::Refund(Transition::refund(
                        None,
                        Some(format!(
                            "no job tracked after {} seconds",
                            age.num_seconds()
                        )),
                    ))
                } else {
                    Action::Wait
                }
            }
        }
    }

    async fn drive(&self, operation: &UsageOperation, report: &mut PollReport) -> Result<(), MeteredError> {
        let status = self.jobs.status(&operation.id).await?;
        match self.decide(operation, status) {
            Action::Charge(transition) => {
                let cost = transition.cost;
                if self.ledger.finalize(&operation.id, transition).await? {
                    info!(operation_id = %operation.id, cost, "job succeeded, operation charged");
                    report.charged += 1;
                }
            }
            Action::Refund(transition) => {
                if !self.jobs.abandon(&operation.id).await? {
                    debug!(operation_id = %operation.id, "job still held by a worker, refund deferred");
                    report.waiting += 1;
                    return Ok(());
                }
                let reason = transition.error_message.clone().unwrap_or_default();
                if self.ledger.finalize(&operation.id, transition).await? {
                    warn!(
                        operation_id = %operation.id,
                        user_id = %operation.user_id,
                        estimate = operation.estimate,
                        reason = %reason,
                        "job abandoned, operation refunded"
                    );
                    report.refunded += 1;
                }
            }
            Action::Wait => report.waiting += 1,
        }
        Ok(())
    }

    /// One pass over up to `batch_size` pending operations.
    ///
    /// A failure on one operation is logged and counted; the pass continues.
    pub async fn poll_once(&self) -> Result<PollReport, MeteredError> {
        let pending = self.ledger.pending(self.config.batch_size).await?;
        let mut report = PollReport {
            examined: pending.len(),
            ..PollReport::default()
        };
        for operation in &pending {
            if let Err(e) = self.drive(operation, &mut report).await {
                warn!(operation_id = %operation.id, error = %e, "driver could not process operation");
                report.errors += 1;
            }
        }
        debug!(?report, "driver poll complete");
        Ok(report)
    }

    /// Poll on `poll_interval` until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!(error = %e, "driver poll failed (non-fatal)");
                    }
                }
                _ = cancel.cancelled() => {
                    info!("retry driver shutting down");
                    break;
                }
            }
        }
    }
}
