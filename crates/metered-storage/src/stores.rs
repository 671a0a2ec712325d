// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite implementations of the ledger store traits.
//!
//! Each store wraps a shared [`Database`] handle and delegates to the typed
//! query modules.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use metered_core::{
    BalanceStore, Credits, JobSource, JobStatus, JournalEntry, MeteredError, OperationId,
    OperationStatus, OperationStore, Posting, Transition, UsageOperation, UserId,
};

use crate::database::Database;
use crate::models::JobEntry;
use crate::queries::balances::{self, Mutation};
use crate::queries::{jobs, operations};

/// Balance store backed by `credit_balances` and `credit_journal`.
#[derive(Clone)]
pub struct SqliteBalanceStore {
    db: Database,
}

impl SqliteBalanceStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl BalanceStore for SqliteBalanceStore {
    async fn balance(&self, user_id: &UserId) -> Result<Credits, MeteredError> {
        balances::balance(&self.db, user_id).await
    }

    async fn decrement(
        &self,
        user_id: &UserId,
        amount: Credits,
        posting: &Posting,
    ) -> Result<Credits, MeteredError> {
        let applied =
            balances::apply(&self.db, user_id, amount, posting, Mutation::Decrement).await?;
        Ok(applied.balance_after)
    }

    async fn increment(
        &self,
        user_id: &UserId,
        amount: Credits,
        posting: &Posting,
    ) -> Result<Credits, MeteredError> {
        let applied =
            balances::apply(&self.db, user_id, amount, posting, Mutation::Increment).await?;
        if !applied.fresh {
            debug!(user_id = %user_id, kind = %posting.kind, "posting already applied");
        }
        Ok(applied.balance_after)
    }

    async fn charge_available(
        &self,
        user_id: &UserId,
        amount: Credits,
        posting: &Posting,
    ) -> Result<Credits, MeteredError> {
        let applied = balances::apply(
            &self.db,
            user_id,
            amount,
            posting,
            Mutation::ChargeAvailable,
        )
        .await?;
        Ok(applied.moved)
    }

    async fn journal(&self, user_id: &UserId) -> Result<Vec<JournalEntry>, MeteredError> {
        balances::journal(&self.db, user_id).await
    }

    async fn unreconciled_reservations(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JournalEntry>, MeteredError> {
        balances::unreconciled_reservations(&self.db, before, limit).await
    }

    async fn mark_reconciled(&self, entry_id: i64) -> Result<(), MeteredError> {
        balances::mark_reconciled(&self.db, entry_id).await
    }

    async fn compensate(&self, entry: &JournalEntry) -> Result<bool, MeteredError> {
        balances::compensate(&self.db, entry).await
    }
}

/// Operation store backed by `usage_operations`.
#[derive(Clone)]
pub struct SqliteOperationStore {
    db: Database,
}

impl SqliteOperationStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl OperationStore for SqliteOperationStore {
    async fn create(&self, operation: &UsageOperation) -> Result<OperationId, MeteredError> {
        operations::create_operation(&self.db, operation).await
    }

    async fn get(&self, id: &OperationId) -> Result<UsageOperation, MeteredError> {
        operations::get_operation(&self.db, id).await
    }

    async fn compare_and_transition(
        &self,
        id: &OperationId,
        expected: OperationStatus,
        transition: &Transition,
    ) -> Result<bool, MeteredError> {
        operations::compare_and_transition(&self.db, id, expected, transition).await
    }

    async fn mark_settled(&self, id: &OperationId) -> Result<(), MeteredError> {
        operations::mark_settled(&self.db, id).await
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<UsageOperation>, MeteredError> {
        operations::list_pending(&self.db, limit).await
    }

    async fn list_unsettled(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<UsageOperation>, MeteredError> {
        operations::list_unsettled(&self.db, before, limit).await
    }
}

/// Job queue that doubles as the retry driver's [`JobSource`].
#[derive(Clone)]
pub struct SqliteJobQueue {
    db: Database,
}

impl SqliteJobQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn enqueue(
        &self,
        operation_id: &OperationId,
        payload: &str,
        max_attempts: u32,
    ) -> Result<i64, MeteredError> {
        jobs::enqueue(&self.db, operation_id, payload, max_attempts).await
    }

    pub async fn claim(&self) -> Result<Option<JobEntry>, MeteredError> {
        jobs::claim(&self.db).await
    }

    pub async fn complete(
        &self,
        job_id: i64,
        cost: Credits,
        result: Option<&serde_json::Value>,
    ) -> Result<(), MeteredError> {
        jobs::complete(&self.db, job_id, cost, result).await
    }

    pub async fn fail(&self, job_id: i64, error: &str) -> Result<(), MeteredError> {
        jobs::fail(&self.db, job_id, error).await
    }

    pub async fn find(&self, operation_id: &OperationId) -> Result<Option<JobEntry>, MeteredError> {
        jobs::find_by_operation(&self.db, operation_id).await
    }
}

#[async_trait]
impl JobSource for SqliteJobQueue {
    async fn status(&self, operation_id: &OperationId) -> Result<JobStatus, MeteredError> {
        let entry = jobs::find_by_operation(&self.db, operation_id).await?;
        Ok(jobs::job_status(entry.as_ref()))
    }

    async fn abandon(&self, operation_id: &OperationId) -> Result<bool, MeteredError> {
        jobs::abandon(&self.db, operation_id).await
    }
}
