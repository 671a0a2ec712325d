// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core library for the metered usage ledger.
//!
//! This crate provides the error type, the domain types (balances, usage
//! operations, journal entries), settlement arithmetic, and the store traits
//! that the ledger is composed from. Storage backends implement the traits
//! defined here.

pub mod error;
pub mod settlement;
pub mod traits;
pub mod types;

// Re-export key items at crate root for ergonomic imports.
pub use error::MeteredError;
pub use settlement::Settlement;
pub use traits::{BalanceStore, JobSource, OperationStore};
pub use types::{
    Credits, Feature, JobStatus, JournalEntry, JournalKind, OperationId, OperationStatus,
    Posting, Transition, UsageOperation, UserId,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_has_all_variants() {
        let _insufficient = MeteredError::InsufficientCredits {
            user_id: "u".into(),
            requested: 1,
            available: 0,
        };
        let _not_found = MeteredError::OperationNotFound("op".into());
        let _conflict = MeteredError::TransactionConflict("busy".into());
        let _validation = MeteredError::Validation("bad".into());
        let _config = MeteredError::Config("test".into());
        let _storage = MeteredError::Storage {
            source: Box::new(std::io::Error::other("test")),
        };
        let _internal = MeteredError::Internal("test".into());
    }

    #[test]
    fn all_traits_are_object_safe() {
        fn _balance(_: &dyn BalanceStore) {}
        fn _operations(_: &dyn OperationStore) {}
        fn _jobs(_: &dyn JobSource) {}
    }
}
