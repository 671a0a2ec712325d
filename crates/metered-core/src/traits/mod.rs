// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Store and collaborator traits the ledger is composed from.
//!
//! All traits use `#[async_trait]` so implementations can be held as
//! `Arc<dyn Trait>` and swapped between SQLite and in-memory backends.

pub mod balance;
pub mod job;
pub mod operation;

pub use balance::BalanceStore;
pub use job::JobSource;
pub use operation::OperationStore;
