// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test utilities for metered integration tests.
//!
//! # Components
//!
//! - [`TestHarness`] - Ledger over a temp SQLite database, with helpers to
//!   age records past the reconciliation grace period
//! - [`ScriptedJobs`] - [`JobSource`](metered_core::JobSource) whose answers
//!   are set by the test

pub mod harness;
pub mod scripted_jobs;

pub use harness::TestHarness;
pub use scripted_jobs::ScriptedJobs;
