// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Settlement arithmetic: how a reservation is squared with the actual cost.

use crate::types::{Credits, JournalKind, OperationStatus, UsageOperation};

/// The balance correction owed once an operation reaches a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Estimate matched the cost exactly.
    Even,
    /// Return unused credits to the user.
    Release(Credits),
    /// Charge credits consumed beyond the estimate.
    Surcharge(Credits),
}

impl Settlement {
    /// Plan the correction for a reservation of `estimate`.
    ///
    /// A refund returns the whole estimate regardless of `cost`.
    pub fn plan(estimate: Credits, cost: Credits, refund: bool) -> Self {
        if refund {
            return if estimate == 0 {
                Settlement::Even
            } else {
                Settlement::Release(estimate)
            };
        }
        match estimate.cmp(&cost) {
            std::cmp::Ordering::Greater => Settlement::Release(estimate - cost),
            std::cmp::Ordering::Less => Settlement::Surcharge(cost - estimate),
            std::cmp::Ordering::Equal => Settlement::Even,
        }
    }

    /// Plan from a finalized record. `None` while the record is still pending.
    pub fn for_operation(operation: &UsageOperation) -> Option<Self> {
        if operation.status == OperationStatus::Pending {
            return None;
        }
        Some(Self::plan(
            operation.estimate,
            operation.cost.unwrap_or(0),
            operation.refund,
        ))
    }

    /// Journal kind used for the posting, if any.
    pub fn journal_kind(self) -> Option<JournalKind> {
        match self {
            Settlement::Even => None,
            Settlement::Release(_) => Some(JournalKind::Release),
            Settlement::Surcharge(_) => Some(JournalKind::Surcharge),
        }
    }

    /// Signed balance change this settlement applies.
    pub fn delta(self) -> i128 {
        match self {
            Settlement::Even => 0,
            Settlement::Release(n) => i128::from(n),
            Settlement::Surcharge(n) => -i128::from(n),
        }
    }
}
