// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-user credit balance store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::MeteredError;
use crate::types::{Credits, JournalEntry, Posting, UserId};

/// Owns one non-negative credit balance per user plus the journal of every
/// mutation applied to it.
///
/// Every method is linearizable per `user_id`. Implementations never lock
/// across users. A balance row that does not exist yet reads as zero and is
/// created by the first increment.
#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// Current balance; zero for unknown users.
    async fn balance(&self, user_id: &UserId) -> Result<Credits, MeteredError>;

    /// Atomically subtract `amount` if the balance covers it.
    ///
    /// Returns the new balance, or `InsufficientCredits` with nothing changed.
    async fn decrement(
        &self,
        user_id: &UserId,
        amount: Credits,
        posting: &Posting,
    ) -> Result<Credits, MeteredError>;

    /// Atomically add `amount`. Never rejected for balance reasons.
    async fn increment(
        &self,
        user_id: &UserId,
        amount: Credits,
        posting: &Posting,
    ) -> Result<Credits, MeteredError>;

    /// Subtract up to `amount`, flooring the balance at zero.
    ///
    /// Returns the credits actually taken.
    async fn charge_available(
        &self,
        user_id: &UserId,
        amount: Credits,
        posting: &Posting,
    ) -> Result<Credits, MeteredError>;

    /// Journal entries for a user, oldest first.
    async fn journal(&self, user_id: &UserId) -> Result<Vec<JournalEntry>, MeteredError>;

    /// `reserve` entries created before `before` that the sweep has not checked yet.
    async fn unreconciled_reservations(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JournalEntry>, MeteredError>;

    /// Mark a `reserve` entry as checked without touching the balance.
    async fn mark_reconciled(&self, entry_id: i64) -> Result<(), MeteredError>;

    /// Refund an orphaned `reserve` entry and mark it reconciled in one step.
    ///
    /// Returns `false` if the entry had already been reconciled or its
    /// refund had already been posted.
    async fn compensate(&self, entry: &JournalEntry) -> Result<bool, MeteredError>;
}
