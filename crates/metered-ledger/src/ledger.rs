// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Two-phase credit charging: reserve an estimate, then settle to the actual cost.
//!
//! [`Ledger::start`] withholds the estimate and records a pending operation.
//! [`Ledger::finalize`] moves the operation to a terminal state with a
//! compare-and-swap, and only the call that wins the swap settles the
//! balance. Settlement runs after the transition has committed, so it is
//! retried on conflicts and, failing that, picked up by the reconciler.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metered_config::model::LedgerConfig;
use metered_core::{
    BalanceStore, Credits, Feature, JournalEntry, JournalKind, MeteredError, OperationId,
    OperationStatus, OperationStore, Posting, Settlement, Transition, UsageOperation, UserId,
};
use tracing::{debug, error, info, warn};

/// Reservation and settlement over injected balance and operation stores.
pub struct Ledger {
    balances: Arc<dyn BalanceStore>,
    operations: Arc<dyn OperationStore>,
    config: LedgerConfig,
}

impl Ledger {
    pub fn new(
        balances: Arc<dyn BalanceStore>,
        operations: Arc<dyn OperationStore>,
        config: LedgerConfig,
    ) -> Self {
        Self {
            balances,
            operations,
            config,
        }
    }

    pub fn balances(&self) -> &Arc<dyn BalanceStore> {
        &self.balances
    }

    pub fn operations(&self) -> &Arc<dyn OperationStore> {
        &self.operations
    }

    /// Reserve `estimate` credits and open a pending operation.
    ///
    /// Fails with `InsufficientCredits` when the balance cannot cover the
    /// estimate; in that case nothing is recorded and the balance is untouched.
    pub async fn start(
        &self,
        user_id: &UserId,
        feature: Feature,
        estimate: Credits,
        metadata: serde_json::Value,
    ) -> Result<OperationId, MeteredError> {
        let id = OperationId::generate();
        let reserve = Posting::for_operation(&id, JournalKind::Reserve);

        let remaining = self
            .with_retry("reserve", || {
                self.balances.decrement(user_id, estimate, &reserve)
            })
            .await?;

        let operation = UsageOperation::pending(id.clone(), user_id.clone(), feature, estimate, metadata);
        if let Err(e) = self
            .with_retry("create operation", || self.operations.create(&operation))
            .await
        {
            self.release_orphan(&operation, &e).await;
            return Err(e);
        }

        info!(
            operation_id = %id,
            user_id = %user_id,
            feature = %feature,
            estimate,
            remaining,
            "credits reserved"
        );
        Ok(id)
    }

    /// Return a reservation whose record could not be written.
    ///
    /// Uses the same `compensate` posting as the reconciler, so a later sweep
    /// over the reservation cannot refund it twice.
    async fn release_orphan(&self, operation: &UsageOperation, cause: &MeteredError) {
        let posting = Posting::for_operation(&operation.id, JournalKind::Compensate);
        match self
            .balances
            .increment(&operation.user_id, operation.estimate, &posting)
            .await
        {
            Ok(_) => warn!(
                operation_id = %operation.id,
                user_id = %operation.user_id,
                estimate = operation.estimate,
                error = %cause,
                "operation record not written, reservation returned"
            ),
            Err(e) => error!(
                operation_id = %operation.id,
                user_id = %operation.user_id,
                estimate = operation.estimate,
                error = %e,
                "reservation could not be returned, leaving it to the reconciler"
            ),
        }
    }

    /// Move a pending operation to its terminal state and settle the balance.
    ///
    /// Safe to call any number of times: only the first call that observes
    /// the operation pending has an effect. Returns whether this call applied
    /// the transition. A settlement failure after the transition committed is
    /// logged and left for the reconciler rather than returned.
    pub async fn finalize(
        &self,
        id: &OperationId,
        transition: Transition,
    ) -> Result<bool, MeteredError> {
        if !transition.is_well_formed() {
            return Err(MeteredError::Validation(format!(
                "operation {id} cannot be finalized as {} with refund={} and cost={}",
                transition.status, transition.refund, transition.cost
            )));
        }

        let applied = self
            .with_retry("transition", || {
                self.operations
                    .compare_and_transition(id, OperationStatus::Pending, &transition)
            })
            .await?;
        if !applied {
            debug!(operation_id = %id, "operation already finalized, nothing to do");
            return Ok(false);
        }

        let operation = match self
            .with_retry("load operation", || self.operations.get(id))
            .await
        {
            Ok(operation) => operation,
            Err(e) => {
                error!(
                    operation_id = %id,
                    error = %e,
                    "operation unreadable after transition, leaving settlement to the reconciler"
                );
                return Ok(true);
            }
        };
        if let Err(e) = self.settle(&operation).await {
            error!(
                operation_id = %id,
                error = %e,
                "settlement failed after transition, leaving it to the reconciler"
            );
        }
        Ok(true)
    }

    /// Apply the balance correction owed by a terminal operation and mark it settled.
    ///
    /// Idempotent: the journal admits one release or surcharge per operation.
    pub async fn settle(&self, operation: &UsageOperation) -> Result<Settlement, MeteredError> {
        let settlement = Settlement::for_operation(operation).ok_or_else(|| {
            MeteredError::Validation(format!(
                "operation {} is still pending and cannot be settled",
                operation.id
            ))
        })?;
        let user_id = &operation.user_id;

        match settlement {
            Settlement::Even => {}
            Settlement::Release(amount) => {
                let posting = Posting::for_operation(&operation.id, JournalKind::Release);
                self.with_retry("release", || {
                    self.balances.increment(user_id, amount, &posting)
                })
                .await?;
            }
            Settlement::Surcharge(amount) => {
                let posting = Posting::for_operation(&operation.id, JournalKind::Surcharge);
                let taken = self
                    .with_retry("surcharge", || {
                        self.balances.charge_available(user_id, amount, &posting)
                    })
                    .await?;
                if taken < amount {
                    warn!(
                        operation_id = %operation.id,
                        user_id = %user_id,
                        owed = amount,
                        charged = taken,
                        shortfall = amount - taken,
                        "surcharge exceeded balance, shortfall not collected"
                    );
                }
            }
        }

        self.with_retry("mark settled", || self.operations.mark_settled(&operation.id))
            .await?;
        info!(
            operation_id = %operation.id,
            user_id = %user_id,
            status = %operation.status,
            cost = operation.cost.unwrap_or(0),
            estimate = operation.estimate,
            refund = operation.refund,
            ?settlement,
            "operation settled"
        );
        Ok(settlement)
    }

    /// Add purchased or bonus credits.
    pub async fn grant(&self, user_id: &UserId, amount: Credits) -> Result<Credits, MeteredError> {
        if amount == 0 {
            return Err(MeteredError::Validation(
                "grant amount must be at least 1".into(),
            ));
        }
        let posting = Posting::grant();
        let balance = self
            .with_retry("grant", || self.balances.increment(user_id, amount, &posting))
            .await?;
        info!(user_id = %user_id, amount, balance, "credits granted");
        Ok(balance)
    }

    pub async fn balance(&self, user_id: &UserId) -> Result<Credits, MeteredError> {
        self.balances.balance(user_id).await
    }

    pub async fn operation(&self, id: &OperationId) -> Result<UsageOperation, MeteredError> {
        self.operations.get(id).await
    }

    pub async fn journal(&self, user_id: &UserId) -> Result<Vec<JournalEntry>, MeteredError> {
        self.balances.journal(user_id).await
    }

    pub async fn pending(&self, limit: usize) -> Result<Vec<UsageOperation>, MeteredError> {
        self.operations.list_pending(limit).await
    }

    /// Delay before retry number `attempt` (zero-based), doubling up to the cap.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.config
            .base_delay()
            .saturating_mul(factor)
            .min(self.config.max_delay())
    }

    /// Run `op`, retrying transient conflicts with exponential backoff.
    async fn with_retry<T, F, Fut>(&self, what: &'static str, mut op: F) -> Result<T, MeteredError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, MeteredError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if e.is_transient() && attempt < self.config.settle_max_retries => {
                    let delay = self.backoff(attempt);
                    warn!(step = what, attempt, ?delay, error = %e, "transient conflict, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
