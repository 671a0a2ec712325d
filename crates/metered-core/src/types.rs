// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Domain types shared by the stores, the ledger, and the operator binary.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Credits are whole, non-negative units of payment.
pub type Credits = u64;

/// Identifier of a user as supplied by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Globally unique identifier of a usage operation (UUID v4).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(pub String);

impl OperationId {
    /// Generate a fresh identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The kind of metered work an operation pays for.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// Text generation.
    Text,
    /// Image generation.
    Image,
    /// Video generation.
    Video,
    /// Content analysis.
    Analyze,
}

/// Lifecycle state of a usage operation.
///
/// `Pending` is the only non-terminal state; an operation leaves it exactly once.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Success,
    Failed,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OperationStatus::Pending)
    }
}

/// One metered unit of work, from reservation to settlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageOperation {
    pub id: OperationId,
    pub user_id: UserId,
    pub feature: Feature,
    pub status: OperationStatus,
    /// Credits reserved at start.
    pub estimate: Credits,
    /// Credits actually charged; `None` while pending.
    pub cost: Option<Credits>,
    /// True iff the operation was fully reversed.
    pub refund: bool,
    /// Caller-supplied request context, written once at start.
    pub metadata: serde_json::Value,
    /// Reference to the produced artifact, written once at finalize.
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once the balance settlement for a terminal operation has been applied.
    pub settled_at: Option<DateTime<Utc>>,
}

impl UsageOperation {
    /// Build a fresh pending record.
    pub fn pending(
        id: OperationId,
        user_id: UserId,
        feature: Feature,
        estimate: Credits,
        metadata: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            feature,
            status: OperationStatus::Pending,
            estimate,
            cost: None,
            refund: false,
            metadata,
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            settled_at: None,
        }
    }
}

/// The terminal state and write-once fields applied by a status transition.
///
/// Build one with [`Transition::success`] or [`Transition::refund`]; any
/// other combination is rejected by [`Transition::is_well_formed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// `success` for charged work, `failed` for refunded work.
    pub status: OperationStatus,
    /// Credits charged; always 0 for a refund.
    pub cost: Credits,
    /// Whether the whole reservation goes back to the user.
    pub refund: bool,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

impl Transition {
    /// Completed work charged at `cost`.
    pub fn success(cost: Credits, result: Option<serde_json::Value>) -> Self {
        Self {
            status: OperationStatus::Success,
            cost,
            refund: false,
            result,
            error_message: None,
        }
    }

    /// Failed work; the whole reservation goes back to the user.
    pub fn refund(result: Option<serde_json::Value>, error_message: Option<String>) -> Self {
        Self {
            status: OperationStatus::Failed,
            cost: 0,
            refund: true,
            result,
            error_message,
        }
    }

    /// True for the two shapes a pending operation may finish in: a
    /// non-refunded success, or a refunded failure that costs nothing.
    pub fn is_well_formed(&self) -> bool {
        match self.status {
            OperationStatus::Success => !self.refund,
            OperationStatus::Failed => self.refund && self.cost == 0,
            OperationStatus::Pending => false,
        }
    }
}

/// Why a balance changed. Stored with every journal entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JournalKind {
    /// Credits added by an external collaborator (purchase, sign-up bonus).
    Grant,
    /// Estimate withheld at start.
    Reserve,
    /// Unused reservation returned at settlement.
    Release,
    /// Cost above the estimate charged at settlement.
    Surcharge,
    /// Orphaned reservation refunded by the reconciliation sweep.
    Compensate,
}

/// Describes a balance mutation for the journal.
///
/// A posting that names an operation is applied at most once per
/// `(operation_id, kind)`; repeating it leaves the balance untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
    /// Operation the posting belongs to; `None` postings are never deduplicated.
    pub operation_id: Option<OperationId>,
    /// Reason recorded with the journal entry.
    pub kind: JournalKind,
}

impl Posting {
    pub fn grant() -> Self {
        Self {
            operation_id: None,
            kind: JournalKind::Grant,
        }
    }

    pub fn for_operation(operation_id: &OperationId, kind: JournalKind) -> Self {
        Self {
            operation_id: Some(operation_id.clone()),
            kind,
        }
    }
}

/// A recorded balance mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Monotonic entry id; later entries have larger ids.
    pub id: i64,
    /// Owner of the balance that changed.
    pub user_id: UserId,
    /// Operation the mutation belongs to; `None` for grants.
    pub operation_id: Option<OperationId>,
    pub kind: JournalKind,
    /// Signed change applied to the balance.
    pub delta: i64,
    /// Balance immediately after the change.
    pub balance_after: Credits,
    /// Set on `reserve` entries once the reconciliation sweep has checked them.
    pub reconciled: bool,
    pub created_at: DateTime<Utc>,
}

/// State of the asynchronous job behind a pending operation.
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    /// No job is tracked for this operation.
    Untracked,
    /// Queued or currently executing.
    Running,
    /// Finished; charge `cost`.
    Succeeded {
        /// Actual cost reported by the worker.
        cost: Credits,
        /// Reference to the produced artifact.
        result: Option<serde_json::Value>,
    },
    /// The last attempt failed, but the backend may still run the job again.
    Failed {
        /// Attempts made so far.
        attempts: u32,
        /// Error from the last attempt.
        error: String,
    },
    /// The backend gave up on the job and will never run it again.
    Exhausted {
        /// Attempts made before giving up.
        attempts: u32,
        /// Error from the last attempt.
        error: String,
    },
}
