// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory stores with the same atomicity contract as the SQLite backend.
//!
//! Each user's balance, journal and applied postings live in one account
//! guarded by the map's entry lock, so a posting and its balance change are
//! applied together or not at all, and users never wait on each other.
//! Operation records are guarded per id the same way.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use metered_core::{
    BalanceStore, Credits, JournalEntry, JournalKind, MeteredError, OperationId,
    OperationStatus, OperationStore, Posting, Transition, UsageOperation, UserId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mutation {
    Decrement,
    Increment,
    ChargeAvailable,
}

/// One user's balance with its journal.
#[derive(Default)]
struct Account {
    credits: Credits,
    entries: Vec<JournalEntry>,
    /// `(operation, kind)` pairs already posted for this user.
    postings: HashSet<(OperationId, JournalKind)>,
}

impl Account {
    fn prior_delta(&self, posting: &Posting) -> Option<i64> {
        let operation_id = posting.operation_id.as_ref()?;
        if !self
            .postings
            .contains(&(operation_id.clone(), posting.kind))
        {
            return None;
        }
        self.entries
            .iter()
            .find(|e| e.operation_id.as_ref() == Some(operation_id) && e.kind == posting.kind)
            .map(|e| e.delta)
    }
}

/// Balance store held entirely in memory.
#[derive(Default)]
pub struct MemoryBalanceStore {
    accounts: DashMap<UserId, Account>,
    next_entry_id: AtomicI64,
}

impl MemoryBalanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `(balance_after, moved)`.
    fn apply(
        &self,
        account: &mut Account,
        user_id: &UserId,
        amount: Credits,
        posting: &Posting,
        mutation: Mutation,
    ) -> Result<(Credits, Credits), MeteredError> {
        let current = account.credits;
        if let Some(delta) = account.prior_delta(posting) {
            return Ok((current, delta.unsigned_abs()));
        }

        let (next, moved) = match mutation {
            Mutation::Decrement => {
                if current < amount {
                    return Err(MeteredError::InsufficientCredits {
                        user_id: user_id.to_string(),
                        requested: amount,
                        available: current,
                    });
                }
                (current - amount, amount)
            }
            Mutation::Increment => {
                let next = current.checked_add(amount).ok_or_else(|| {
                    MeteredError::Validation(format!("balance overflow for {user_id}"))
                })?;
                (next, amount)
            }
            Mutation::ChargeAvailable => {
                let taken = amount.min(current);
                (current - taken, taken)
            }
        };
        let moved_signed = i64::try_from(moved).map_err(|_| {
            MeteredError::Validation(format!("credit amount {moved} is out of range"))
        })?;
        let delta = if mutation == Mutation::Increment {
            moved_signed
        } else {
            -moved_signed
        };

        account.credits = next;
        if let Some(operation_id) = &posting.operation_id {
            account
                .postings
                .insert((operation_id.clone(), posting.kind));
        }
        account.entries.push(JournalEntry {
            id: self.next_entry_id.fetch_add(1, Ordering::Relaxed) + 1,
            user_id: user_id.clone(),
            operation_id: posting.operation_id.clone(),
            kind: posting.kind,
            delta,
            balance_after: next,
            reconciled: false,
            created_at: Utc::now(),
        });
        Ok((next, moved))
    }

    fn mutate(
        &self,
        user_id: &UserId,
        amount: Credits,
        posting: &Posting,
        mutation: Mutation,
    ) -> Result<(Credits, Credits), MeteredError> {
        let mut account = self.accounts.entry(user_id.clone()).or_default();
        self.apply(&mut account, user_id, amount, posting, mutation)
    }

    /// Shift the timestamp of every journal entry back by `age`.
    ///
    /// Lets tests age reservations past the reconciliation grace period.
    pub fn backdate(&self, age: chrono::Duration) {
        for mut account in self.accounts.iter_mut() {
            for entry in &mut account.entries {
                entry.created_at -= age;
            }
        }
    }
}

#[async_trait]
impl BalanceStore for MemoryBalanceStore {
    async fn balance(&self, user_id: &UserId) -> Result<Credits, MeteredError> {
        Ok(self.accounts.get(user_id).map(|a| a.credits).unwrap_or(0))
    }

    async fn decrement(
        &self,
        user_id: &UserId,
        amount: Credits,
        posting: &Posting,
    ) -> Result<Credits, MeteredError> {
        self.mutate(user_id, amount, posting, Mutation::Decrement)
            .map(|(after, _)| after)
    }

    async fn increment(
        &self,
        user_id: &UserId,
        amount: Credits,
        posting: &Posting,
    ) -> Result<Credits, MeteredError> {
        self.mutate(user_id, amount, posting, Mutation::Increment)
            .map(|(after, _)| after)
    }

    async fn charge_available(
        &self,
        user_id: &UserId,
        amount: Credits,
        posting: &Posting,
    ) -> Result<Credits, MeteredError> {
        self.mutate(user_id, amount, posting, Mutation::ChargeAvailable)
            .map(|(_, moved)| moved)
    }

    async fn journal(&self, user_id: &UserId) -> Result<Vec<JournalEntry>, MeteredError> {
        Ok(self
            .accounts
            .get(user_id)
            .map(|a| a.entries.clone())
            .unwrap_or_default())
    }

    async fn unreconciled_reservations(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JournalEntry>, MeteredError> {
        let mut found: Vec<JournalEntry> = self
            .accounts
            .iter()
            .flat_map(|account| {
                account
                    .entries
                    .iter()
                    .filter(|e| {
                        e.kind == JournalKind::Reserve && !e.reconciled && e.created_at <= before
                    })
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        found.sort_by_key(|e| e.id);
        found.truncate(limit);
        Ok(found)
    }

    async fn mark_reconciled(&self, entry_id: i64) -> Result<(), MeteredError> {
        for mut account in self.accounts.iter_mut() {
            if let Some(entry) = account.entries.iter_mut().find(|e| e.id == entry_id) {
                entry.reconciled = true;
                break;
            }
        }
        Ok(())
    }

    async fn compensate(&self, entry: &JournalEntry) -> Result<bool, MeteredError> {
        if entry.kind != JournalKind::Reserve {
            return Err(MeteredError::Validation(format!(
                "journal entry {} is a {} entry, not a reservation",
                entry.id, entry.kind
            )));
        }
        let Some(mut account) = self.accounts.get_mut(&entry.user_id) else {
            return Ok(false);
        };
        let Some(index) = account.entries.iter().position(|e| e.id == entry.id) else {
            return Ok(false);
        };
        if account.entries[index].reconciled {
            return Ok(false);
        }
        let posting = Posting {
            operation_id: entry.operation_id.clone(),
            kind: JournalKind::Compensate,
        };
        let fresh = account.prior_delta(&posting).is_none();
        self.apply(
            &mut account,
            &entry.user_id,
            entry.delta.unsigned_abs(),
            &posting,
            Mutation::Increment,
        )?;
        account.entries[index].reconciled = true;
        Ok(fresh)
    }
}


/// Operation store held entirely in memory.
#[derive(Default)]
pub struct MemoryOperationStore {
    operations: DashMap<OperationId, UsageOperation>,
}

impl MemoryOperationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shift `created_at` and `updated_at` of one record back by `age`.
    pub fn backdate(&self, id: &OperationId, age: chrono::Duration) {
        if let Some(mut op) = self.operations.get_mut(id) {
            op.created_at -= age;
            op.updated_at -= age;
        }
    }
}

#[async_trait]
impl OperationStore for MemoryOperationStore {
    async fn create(&self, operation: &UsageOperation) -> Result<OperationId, MeteredError> {
        if operation.status != OperationStatus::Pending {
            return Err(MeteredError::Validation(format!(
                "operation {} must be created pending, not {}",
                operation.id, operation.status
            )));
        }
        match self.operations.entry(operation.id.clone()) {
            Entry::Occupied(_) => Err(MeteredError::Validation(format!(
                "operation {} already exists",
                operation.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(operation.clone());
                Ok(operation.id.clone())
            }
        }
    }

    async fn get(&self, id: &OperationId) -> Result<UsageOperation, MeteredError> {
        self.operations
            .get(id)
            .map(|op| op.clone())
            .ok_or_else(|| MeteredError::OperationNotFound(id.to_string()))
    }

    async fn compare_and_transition(
        &self,
        id: &OperationId,
        expected: OperationStatus,
        transition: &Transition,
    ) -> Result<bool, MeteredError> {
        let mut op = self
            .operations
            .get_mut(id)
            .ok_or_else(|| MeteredError::OperationNotFound(id.to_string()))?;
        if op.status != expected {
            return Ok(false);
        }
        op.status = transition.status;
        op.cost = Some(transition.cost);
        op.refund = transition.refund;
        op.result = transition.result.clone();
        op.error_message = transition.error_message.clone();
        op.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_settled(&self, id: &OperationId) -> Result<(), MeteredError> {
        if let Some(mut op) = self.operations.get_mut(id)
            && op.status.is_terminal()
            && op.settled_at.is_none()
        {
            op.settled_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<UsageOperation>, MeteredError> {
        let mut pending: Vec<UsageOperation> = self
            .operations
            .iter()
            .filter(|op| op.status == OperationStatus::Pending)
            .map(|op| op.clone())
            .collect();
        pending.sort_by_key(|op| op.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn list_unsettled(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<UsageOperation>, MeteredError> {
        let mut unsettled: Vec<UsageOperation> = self
            .operations
            .iter()
            .filter(|op| {
                op.status.is_terminal() && op.settled_at.is_none() && op.updated_at <= before
            })
            .map(|op| op.clone())
            .collect();
        unsettled.sort_by_key(|op| op.updated_at);
        unsettled.truncate(limit);
        Ok(unsettled)
    }
}
