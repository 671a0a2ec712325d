// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Row types that only exist at the storage layer.

use metered_core::{Credits, OperationId};

/// One row of the job queue.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEntry {
    pub id: i64,
    pub operation_id: OperationId,
    pub payload: String,
    /// One of `pending`, `processing`, `completed`, `failed`.
    pub status: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub cost: Option<Credits>,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub locked_until: Option<String>,
}
