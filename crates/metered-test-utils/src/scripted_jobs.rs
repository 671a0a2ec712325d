// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Job source with scripted answers.

use async_trait::async_trait;
use dashmap::DashMap;

use metered_core::{JobSource, JobStatus, MeteredError, OperationId};

/// A job source that reports whatever the test last set for an operation.
///
/// Operations never set are `Untracked`.
#[derive(Default)]
pub struct ScriptedJobs {
    statuses: DashMap<OperationId, JobStatus>,
}

impl ScriptedJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the status reported for `operation_id`.
    pub fn set(&self, operation_id: &OperationId, status: JobStatus) {
        self.statuses.insert(operation_id.clone(), status);
    }

    /// Stop tracking `operation_id`.
    pub fn forget(&self, operation_id: &OperationId) {
        self.statuses.remove(operation_id);
    }
}

#[async_trait]
impl JobSource for ScriptedJobs {
    async fn status(&self, operation_id: &OperationId) -> Result<JobStatus, MeteredError> {
        Ok(self
            .statuses
            .get(operation_id)
            .map(|status| status.clone())
            .unwrap_or(JobStatus::Untracked))
    }

    /// Refuses while the scripted job is running or has succeeded; otherwise
    /// scripts it as exhausted.
    async fn abandon(&self, operation_id: &OperationId) -> Result<bool, MeteredError> {
        let Some(mut status) = self.statuses.get_mut(operation_id) else {
            return Ok(true);
        };
        let abandoned = match &*status {
            JobStatus::Running | JobStatus::Succeeded { .. } => return Ok(false),
            JobStatus::Failed { attempts, error } | JobStatus::Exhausted { attempts, error } => {
                JobStatus::Exhausted {
                    attempts: *attempts,
                    error: error.clone(),
                }
            }
            JobStatus::Untracked => return Ok(true),
        };
        *status = abandoned;
        Ok(true)
    }
}
