// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Usage operation ledger: reserve credits before metered work, settle them after.
//!
//! The [`Ledger`] is composed from a [`BalanceStore`](metered_core::BalanceStore)
//! and an [`OperationStore`](metered_core::OperationStore). The
//! [`RetryDriver`] finalizes operations backed by asynchronous jobs and the
//! [`Reconciler`] repairs what a crash can leave behind. In-memory stores are
//! provided for tests and embedding.

pub mod driver;
pub mod ledger;
pub mod memory;
pub mod reconcile;

pub use driver::{PollReport, RetryDriver};
pub use ledger::Ledger;
pub use memory::{MemoryBalanceStore, MemoryOperationStore};
pub use reconcile::{Reconciler, SweepReport};
