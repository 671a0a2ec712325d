// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Crash-safe job queue, one job per usage operation.
//!
//! Workers claim the oldest runnable job with a five minute lock. A worker
//! that dies mid-job leaves the row in `processing`; once the lock expires
//! the job becomes claimable again.

use metered_core::{Credits, JobStatus, MeteredError, OperationId};
use rusqlite::{OptionalExtension, Row, TransactionBehavior, params};

use crate::database::{Database, SqlResultExt, credits_from_sql, credits_to_sql};
use crate::models::JobEntry;

const JOB_COLUMNS: &str = "id, operation_id, payload, status, attempts, max_attempts, cost, \
     result, last_error, created_at, updated_at, locked_until";

const NOW: &str = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<JobEntry> {
    let result: Option<String> = row.get(7)?;
    Ok(JobEntry {
        id: row.get(0)?,
        operation_id: OperationId(row.get(1)?),
        payload: row.get(2)?,
        status: row.get(3)?,
        attempts: row.get(4)?,
        max_attempts: row.get(5)?,
        cost: row
            .get::<_, Option<i64>>(6)?
            .map(|raw| credits_from_sql(6, raw))
            .transpose()?,
        result: result
            .map(|raw| {
                serde_json::from_str(&raw).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        7,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })
            })
            .transpose()?,
        last_error: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
        locked_until: row.get(11)?,
    })
}

/// Enqueue the job for an operation. Returns the job id.
///
/// Each operation has at most one job; enqueuing twice is a validation error.
pub async fn enqueue(
    db: &Database,
    operation_id: &OperationId,
    payload: &str,
    max_attempts: u32,
) -> Result<i64, MeteredError> {
    if max_attempts == 0 {
        return Err(MeteredError::Validation(
            "job max_attempts must be at least 1".into(),
        ));
    }
    let operation_id = operation_id.as_str().to_string();
    let payload = payload.to_string();
    db.call(move |conn| {
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM job_queue WHERE operation_id = ?1",
                params![operation_id],
                |row| row.get(0),
            )
            .optional()
            .sql()?;
        if existing.is_some() {
            return Err(MeteredError::Validation(format!(
                "operation {operation_id} already has a job"
            )));
        }
        conn.execute(
            "INSERT INTO job_queue (operation_id, payload, max_attempts) VALUES (?1, ?2, ?3)",
            params![operation_id, payload, max_attempts],
        )
        .sql()?;
        Ok(conn.last_insert_rowid())
    })
    .await
}

/// Claim the next runnable job.
///
/// Atomically selects the oldest pending job (or a processing job whose lock
/// expired) and marks it `processing` with a 5-minute lock. Returns `None`
/// when nothing is runnable.
pub async fn claim(db: &Database) -> Result<Option<JobEntry>, MeteredError> {
    db.call(move |conn| {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .sql()?;
        let entry = tx
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM job_queue
                     WHERE status = 'pending'
                        OR (status = 'processing' AND locked_until < {NOW})
                     ORDER BY id ASC
                     LIMIT 1"
                ),
                [],
                job_from_row,
            )
            .optional()
            .sql()?;

        let Some(entry) = entry else {
            tx.commit().sql()?;
            return Ok(None);
        };

        tx.execute(
            &format!(
                "UPDATE job_queue SET status = 'processing',
                 locked_until = strftime('%Y-%m-%dT%H:%M:%fZ', 'now', '+5 minutes'),
                 updated_at = {NOW}
                 WHERE id = ?1"
            ),
            params![entry.id],
        )
        .sql()?;
        tx.commit().sql()?;

        Ok(Some(JobEntry {
            status: "processing".to_string(),
            ..entry
        }))
    })
    .await
}

/// Record a finished job with its actual cost.
pub async fn complete(
    db: &Database,
    job_id: i64,
    cost: Credits,
    result: Option<&serde_json::Value>,
) -> Result<(), MeteredError> {
    let cost = credits_to_sql(cost)?;
    let result = result
        .map(serde_json::to_string)
        .transpose()
        .map_err(MeteredError::storage)?;
    db.call(move |conn| {
        let changed = conn
            .execute(
                &format!(
                    "UPDATE job_queue SET status = 'completed', cost = ?1, result = ?2,
                     locked_until = NULL, updated_at = {NOW}
                     WHERE id = ?3"
                ),
                params![cost, result, job_id],
            )
            .sql()?;
        if changed == 0 {
            return Err(MeteredError::Validation(format!("no job with id {job_id}")));
        }
        Ok(())
    })
    .await
}

/// Record a failed attempt.
///
/// Increments attempts. At `max_attempts` the job is parked as `failed`;
/// otherwise it returns to `pending` with the lock cleared.
pub async fn fail(db: &Database, job_id: i64, error: &str) -> Result<(), MeteredError> {
    let error = error.to_string();
    db.call(move |conn| {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .sql()?;
        let counts: Option<(u32, u32)> = tx
            .query_row(
                "SELECT attempts, max_attempts FROM job_queue WHERE id = ?1",
                params![job_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .sql()?;
        let Some((attempts, max_attempts)) = counts else {
            return Err(MeteredError::Validation(format!("no job with id {job_id}")));
        };

        let attempts = attempts + 1;
        let status = if attempts >= max_attempts {
            "failed"
        } else {
            "pending"
        };
        tx.execute(
            &format!(
                "UPDATE job_queue SET status = ?1, attempts = ?2, last_error = ?3,
                 locked_until = NULL, updated_at = {NOW}
                 WHERE id = ?4"
            ),
            params![status, attempts, error, job_id],
        )
        .sql()?;
        tx.commit().sql()?;
        Ok(())
    })
    .await
}

/// Park an operation's job as `failed` so no worker claims it again.
///
/// Only a job waiting for its next attempt (or already failed) can be
/// abandoned. Returns `false` when the job is being processed or has
/// completed, and `true` when no job exists for the operation.
pub async fn abandon(db: &Database, operation_id: &OperationId) -> Result<bool, MeteredError> {
    let operation_id = operation_id.as_str().to_string();
    db.call(move |conn| {
        let changed = conn
            .execute(
                &format!(
                    "UPDATE job_queue SET status = 'failed', locked_until = NULL, updated_at = {NOW}
                     WHERE operation_id = ?1 AND status IN ('pending', 'failed')"
                ),
                params![operation_id],
            )
            .sql()?;
        if changed > 0 {
            return Ok(true);
        }
        let exists: Option<i64> = conn
            .query_row(
                "SELECT id FROM job_queue WHERE operation_id = ?1",
                params![operation_id],
                |row| row.get(0),
            )
            .optional()
            .sql()?;
        Ok(exists.is_none())
    })
    .await
}

/// The queue row for an operation, if any.
pub async fn find_by_operation(
    db: &Database,
    operation_id: &OperationId,
) -> Result<Option<JobEntry>, MeteredError> {
    let operation_id = operation_id.as_str().to_string();
    db.call(move |conn| {
        conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM job_queue WHERE operation_id = ?1"),
            params![operation_id],
            job_from_row,
        )
        .optional()
        .sql()
    })
    .await
}

/// Project a queue row onto the status the retry driver consumes.
pub fn job_status(entry: Option<&JobEntry>) -> JobStatus {
    let Some(entry) = entry else {
        return JobStatus::Untracked;
    };
    let error = || {
        entry
            .last_error
            .clone()
            .unwrap_or_else(|| "unknown error".to_string())
    };
    match entry.status.as_str() {
        "completed" => JobStatus::Succeeded {
            cost: entry.cost.unwrap_or(0),
            result: entry.result.clone(),
        },
        "failed" => JobStatus::Exhausted {
            attempts: entry.attempts,
            error: error(),
        },
        "pending" if entry.attempts > 0 => JobStatus::Failed {
            attempts: entry.attempts,
            error: error(),
        },
        _ => JobStatus::Running,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn db_with_job(max_attempts: u32) -> (Database, OperationId, i64) {
        let db = Database::open_in_memory().await.unwrap();
        let op = OperationId::generate();
        let id = enqueue(&db, &op, r#"{"prompt":"a cat"}"#, max_attempts)
            .await
            .unwrap();
        (db, op, id)
    }

    async fn status_of(db: &Database, op: &OperationId) -> JobStatus {
        job_status(find_by_operation(db, op).await.unwrap().as_ref())
    }

    #[tokio::test]
    async fn untracked_without_row() {
        let db = Database::open_in_memory().await.unwrap();
        assert_eq!(
            status_of(&db, &OperationId::generate()).await,
            JobStatus::Untracked
        );
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_rejected() {
        let (db, op, _) = db_with_job(3).await;
        let err = enqueue(&db, &op, "{}", 3).await.unwrap_err();
        assert!(matches!(err, MeteredError::Validation(_)));
    }

    #[tokio::test]
    async fn claim_then_complete() {
        let (db, op, id) = db_with_job(3).await;
        assert_eq!(status_of(&db, &op).await, JobStatus::Running);

        let claimed = claim(&db).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, "processing");
        assert!(claim(&db).await.unwrap().is_none(), "locked job is not claimable");

        complete(&db, id, 7, Some(&serde_json::json!({"frames": 24})))
            .await
            .unwrap();
        match status_of(&db, &op).await {
            JobStatus::Succeeded { cost, result } => {
                assert_eq!(cost, 7);
                assert_eq!(result.unwrap()["frames"], 24);
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failures_count_up_to_max_attempts() {
        let (db, op, id) = db_with_job(2).await;

        claim(&db).await.unwrap().unwrap();
        fail(&db, id, "gpu timeout").await.unwrap();
        assert_eq!(
            status_of(&db, &op).await,
            JobStatus::Failed {
                attempts: 1,
                error: "gpu timeout".into()
            }
        );
        let retried = claim(&db).await.unwrap().unwrap();
        assert_eq!(retried.attempts, 1);

        fail(&db, id, "gpu timeout again").await.unwrap();
        let entry = find_by_operation(&db, &op).await.unwrap().unwrap();
        assert_eq!(entry.status, "failed");
        assert_eq!(entry.attempts, 2);
        assert!(claim(&db).await.unwrap().is_none());
        assert_eq!(
            status_of(&db, &op).await,
            JobStatus::Exhausted {
                attempts: 2,
                error: "gpu timeout again".into()
            }
        );
    }

    #[tokio::test]
    async fn abandoned_job_is_never_claimed_again() {
        let (db, op, id) = db_with_job(5).await;
        claim(&db).await.unwrap().unwrap();
        fail(&db, id, "oom").await.unwrap();

        assert!(abandon(&db, &op).await.unwrap());
        assert!(claim(&db).await.unwrap().is_none());
        assert!(matches!(
            status_of(&db, &op).await,
            JobStatus::Exhausted { attempts: 1, .. }
        ));
        assert!(abandon(&db, &op).await.unwrap(), "abandoning twice is harmless");
    }

    #[tokio::test]
    async fn held_or_completed_jobs_cannot_be_abandoned() {
        let (db, op, id) = db_with_job(3).await;
        claim(&db).await.unwrap().unwrap();
        assert!(!abandon(&db, &op).await.unwrap());

        complete(&db, id, 2, None).await.unwrap();
        assert!(!abandon(&db, &op).await.unwrap());

        assert!(abandon(&db, &OperationId::generate()).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_is_reclaimable() {
        let (db, _, id) = db_with_job(3).await;
        claim(&db).await.unwrap().unwrap();
        db.call(move |conn| {
            conn.execute(
                "UPDATE job_queue SET locked_until = '2000-01-01T00:00:00.000Z' WHERE id = ?1",
                params![id],
            )
            .sql()?;
            Ok(())
        })
        .await
        .unwrap();

        let reclaimed = claim(&db).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, id);
    }

    #[tokio::test]
    async fn unknown_job_ids_are_rejected() {
        let db = Database::open_in_memory().await.unwrap();
        assert!(complete(&db, 99, 1, None).await.is_err());
        assert!(fail(&db, 99, "boom").await.is_err());
    }
}
