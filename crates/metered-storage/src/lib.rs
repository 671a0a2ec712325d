// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite persistence layer for the metered usage ledger.
//!
//! Provides WAL-mode SQLite storage with embedded migrations, a single-writer
//! concurrency model via `tokio-rusqlite`, and typed queries for credit
//! balances, the credit journal, usage operations, and a crash-safe job queue.

pub mod database;
pub mod migrations;
pub mod models;
pub mod queries;
pub mod stores;

pub use database::Database;
pub use models::*;
pub use stores::{SqliteBalanceStore, SqliteJobQueue, SqliteOperationStore};
