// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for the metered usage ledger.

use thiserror::Error;

use crate::types::Credits;

/// The primary error type used across the store traits and the ledger.
#[derive(Debug, Error)]
pub enum MeteredError {
    /// A reservation or debit cannot be covered by the user's balance.
    #[error("insufficient credits for {user_id}: requested {requested}, available {available}")]
    InsufficientCredits {
        user_id: String,
        requested: Credits,
        available: Credits,
    },

    /// The referenced usage operation does not exist.
    #[error("usage operation not found: {0}")]
    OperationNotFound(String),

    /// A store transaction lost a race with a concurrent writer. Retryable.
    #[error("transaction conflict: {0}")]
    TransactionConflict(String),

    /// A caller-supplied value was rejected (negative amount, bad tag).
    #[error("validation error: {0}")]
    Validation(String),

    /// Configuration errors (invalid TOML, missing fields, bad values).
    #[error("configuration error: {0}")]
    Config(String),

    /// Storage backend errors (connection, query failure, serialization).
    #[error("storage error: {source}")]
    Storage {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Internal or unexpected errors.
    #[error("internal error: {0}")]
    Internal(String),
}

impl MeteredError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, MeteredError::TransactionConflict(_))
    }

    /// Wraps any error as a storage failure.
    pub fn storage<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        MeteredError::Storage {
            source: Box::new(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflicts_are_transient() {
        assert!(MeteredError::TransactionConflict("busy".into()).is_transient());
        assert!(!MeteredError::OperationNotFound("op".into()).is_transient());
        assert!(
            !MeteredError::InsufficientCredits {
                user_id: "u".into(),
                requested: 5,
                available: 3,
            }
            .is_transient()
        );
        assert!(!MeteredError::storage(std::io::Error::other("disk")).is_transient());
    }

    #[test]
    fn insufficient_credits_message_names_amounts() {
        let err = MeteredError::InsufficientCredits {
            user_id: "user-1".into(),
            requested: 5,
            available: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("user-1"));
        assert!(msg.contains("requested 5"));
        assert!(msg.contains("available 3"));
    }
}
