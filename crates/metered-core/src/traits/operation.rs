// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Usage operation record store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::MeteredError;
use crate::types::{OperationId, OperationStatus, Transition, UsageOperation};

/// Owns `UsageOperation` records. Records are never deleted.
///
/// `compare_and_transition` is linearizable per operation id and is the
/// idempotency guard for settlement.
#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Persist a new pending record under its pre-generated id.
    async fn create(&self, operation: &UsageOperation) -> Result<OperationId, MeteredError>;

    /// Fetch a record, or `OperationNotFound`.
    async fn get(&self, id: &OperationId) -> Result<UsageOperation, MeteredError>;

    /// Apply `transition` iff the record is currently in `expected`.
    ///
    /// Returns `Ok(false)` without mutating anything when the status differs,
    /// and `OperationNotFound` when the record does not exist.
    async fn compare_and_transition(
        &self,
        id: &OperationId,
        expected: OperationStatus,
        transition: &Transition,
    ) -> Result<bool, MeteredError>;

    /// Record that the balance settlement for a terminal operation is done.
    async fn mark_settled(&self, id: &OperationId) -> Result<(), MeteredError>;

    /// Pending operations, oldest first.
    async fn list_pending(&self, limit: usize) -> Result<Vec<UsageOperation>, MeteredError>;

    /// Terminal operations updated before `before` whose settlement never completed.
    async fn list_unsettled(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<UsageOperation>, MeteredError>;
}
