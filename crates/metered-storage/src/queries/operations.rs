// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Usage operation record queries.

use chrono::{DateTime, Utc};
use metered_core::{
    MeteredError, OperationId, OperationStatus, Transition, UsageOperation, UserId,
};
use rusqlite::{OptionalExtension, Row, params};

use crate::database::{
    Database, SqlResultExt, credits_from_sql, credits_to_sql, format_ts, parse_ts,
};

const OPERATION_COLUMNS: &str = "id, user_id, feature, status, estimate, cost, refund, \
     metadata, result, error_message, created_at, updated_at, settled_at";

fn conversion_err(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn operation_from_row(row: &Row<'_>) -> rusqlite::Result<UsageOperation> {
    let feature: String = row.get(2)?;
    let status: String = row.get(3)?;
    let metadata: String = row.get(7)?;
    let result: Option<String> = row.get(8)?;
    let created_at: String = row.get(10)?;
    let updated_at: String = row.get(11)?;
    let settled_at: Option<String> = row.get(12)?;

    Ok(UsageOperation {
        id: OperationId(row.get(0)?),
        user_id: UserId(row.get(1)?),
        feature: feature.parse().map_err(|e| conversion_err(2, e))?,
        status: status.parse().map_err(|e| conversion_err(3, e))?,
        estimate: credits_from_sql(4, row.get(4)?)?,
        cost: row
            .get::<_, Option<i64>>(5)?
            .map(|raw| credits_from_sql(5, raw))
            .transpose()?,
        refund: row.get(6)?,
        metadata: serde_json::from_str(&metadata).map_err(|e| conversion_err(7, e))?,
        result: result
            .map(|raw| serde_json::from_str(&raw).map_err(|e| conversion_err(8, e)))
            .transpose()?,
        error_message: row.get(9)?,
        created_at: parse_ts(10, &created_at)?,
        updated_at: parse_ts(11, &updated_at)?,
        settled_at: settled_at.map(|raw| parse_ts(12, &raw)).transpose()?,
    })
}

fn to_json(value: &serde_json::Value) -> Result<String, MeteredError> {
    serde_json::to_string(value).map_err(MeteredError::storage)
}

/// Insert a new pending operation.
pub async fn create_operation(
    db: &Database,
    operation: &UsageOperation,
) -> Result<OperationId, MeteredError> {
    if operation.status != OperationStatus::Pending {
        return Err(MeteredError::Validation(format!(
            "operation {} must be created pending, not {}",
            operation.id, operation.status
        )));
    }
    let id = operation.id.as_str().to_string();
    let user_id = operation.user_id.as_str().to_string();
    let feature = operation.feature.to_string();
    let estimate = credits_to_sql(operation.estimate)?;
    let metadata = to_json(&operation.metadata)?;
    let created_at = format_ts(operation.created_at);
    let updated_at = format_ts(operation.updated_at);

    db.call(move |conn| {
        conn.execute(
            "INSERT INTO usage_operations (id, user_id, feature, status, estimate, metadata, \
             created_at, updated_at) VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?7)",
            params![id, user_id, feature, estimate, metadata, created_at, updated_at],
        )
        .sql()?;
        Ok(OperationId(id))
    })
    .await
}

/// Fetch an operation by id.
pub async fn get_operation(
    db: &Database,
    id: &OperationId,
) -> Result<UsageOperation, MeteredError> {
    let id = id.as_str().to_string();
    db.call(move |conn| {
        conn.query_row(
            &format!("SELECT {OPERATION_COLUMNS} FROM usage_operations WHERE id = ?1"),
            params![id],
            operation_from_row,
        )
        .optional()
        .sql()?
        .ok_or(MeteredError::OperationNotFound(id))
    })
    .await
}

/// Conditionally move an operation out of `expected`.
///
/// A single `UPDATE ... WHERE status = ?` is the compare-and-swap; when it
/// touches no row the record either moved on already or never existed.
pub async fn compare_and_transition(
    db: &Database,
    id: &OperationId,
    expected: OperationStatus,
    transition: &Transition,
) -> Result<bool, MeteredError> {
    let id = id.as_str().to_string();
    let expected = expected.to_string();
    let status = transition.status.to_string();
    let cost = credits_to_sql(transition.cost)?;
    let refund = transition.refund;
    let result = transition.result.as_ref().map(to_json).transpose()?;
    let error_message = transition.error_message.clone();
    let now = format_ts(Utc::now());

    db.call(move |conn| {
        let changed = conn
            .execute(
                "UPDATE usage_operations
                 SET status = ?1, cost = ?2, refund = ?3, result = ?4, error_message = ?5,
                     updated_at = ?6
                 WHERE id = ?7 AND status = ?8",
                params![status, cost, refund, result, error_message, now, id, expected],
            )
            .sql()?;
        if changed == 1 {
            return Ok(true);
        }
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM usage_operations WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .sql()?;
        match exists {
            Some(_) => Ok(false),
            None => Err(MeteredError::OperationNotFound(id)),
        }
    })
    .await
}

/// Stamp `settled_at` on a terminal operation. Repeat calls keep the first stamp.
pub async fn mark_settled(db: &Database, id: &OperationId) -> Result<(), MeteredError> {
    let id = id.as_str().to_string();
    let now = format_ts(Utc::now());
    db.call(move |conn| {
        conn.execute(
            "UPDATE usage_operations SET settled_at = ?1
             WHERE id = ?2 AND status != 'pending' AND settled_at IS NULL",
            params![now, id],
        )
        .sql()?;
        Ok(())
    })
    .await
}

/// Pending operations, oldest first.
pub async fn list_pending(
    db: &Database,
    limit: usize,
) -> Result<Vec<UsageOperation>, MeteredError> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    db.call(move |conn| {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {OPERATION_COLUMNS} FROM usage_operations
                 WHERE status = 'pending' ORDER BY created_at ASC LIMIT ?1"
            ))
            .sql()?;
        let operations = stmt
            .query_map(params![limit], operation_from_row)
            .sql()?
            .collect::<Result<Vec<_>, _>>()
            .sql()?;
        Ok(operations)
    })
    .await
}

/// Terminal operations last updated at or before `before` and never settled.
pub async fn list_unsettled(
    db: &Database,
    before: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<UsageOperation>, MeteredError> {
    let before = format_ts(before);
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    db.call(move |conn| {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {OPERATION_COLUMNS} FROM usage_operations
                 WHERE status != 'pending' AND settled_at IS NULL AND updated_at <= ?1
                 ORDER BY updated_at ASC LIMIT ?2"
            ))
            .sql()?;
        let operations = stmt
            .query_map(params![before, limit], operation_from_row)
            .sql()?
            .collect::<Result<Vec<_>, _>>()
            .sql()?;
        Ok(operations)
    })
    .await
}

#[cfg(test)]
mod tests {
    use metered_core::Feature;

    use super::*;

    fn pending(estimate: u64) -> UsageOperation {
        UsageOperation::pending(
            OperationId::generate(),
            UserId::new("user-1"),
            Feature::Analyze,
            estimate,
            serde_json::json!({"model": "vision-large", "pages": 3}),
        )
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let db = Database::open_in_memory().await.unwrap();
        let op = pending(5);
        let id = create_operation(&db, &op).await.unwrap();
        assert_eq!(id, op.id);

        let loaded = get_operation(&db, &id).await.unwrap();
        assert_eq!(loaded.status, OperationStatus::Pending);
        assert_eq!(loaded.feature, Feature::Analyze);
        assert_eq!(loaded.estimate, 5);
        assert_eq!(loaded.cost, None);
        assert_eq!(loaded.metadata["pages"], 3);
        assert!(loaded.settled_at.is_none());
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let db = Database::open_in_memory().await.unwrap();
        let err = get_operation(&db, &OperationId("missing".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, MeteredError::OperationNotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn transition_applies_once() {
        let db = Database::open_in_memory().await.unwrap();
        let op = pending(5);
        create_operation(&db, &op).await.unwrap();

        let success = Transition::success(3, Some(serde_json::json!({"url": "s3://a"})));
        assert!(
            compare_and_transition(&db, &op.id, OperationStatus::Pending, &success)
                .await
                .unwrap()
        );
        let refund = Transition::refund(None, Some("late failure".into()));
        assert!(
            !compare_and_transition(&db, &op.id, OperationStatus::Pending, &refund)
                .await
                .unwrap()
        );

        let loaded = get_operation(&db, &op.id).await.unwrap();
        assert_eq!(loaded.status, OperationStatus::Success);
        assert_eq!(loaded.cost, Some(3));
        assert!(!loaded.refund);
        assert_eq!(loaded.result.unwrap()["url"], "s3://a");
        assert!(loaded.error_message.is_none());
    }

    #[tokio::test]
    async fn transition_of_unknown_is_not_found() {
        let db = Database::open_in_memory().await.unwrap();
        let err = compare_and_transition(
            &db,
            &OperationId("ghost".into()),
            OperationStatus::Pending,
            &Transition::success(1, None),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MeteredError::OperationNotFound(_)));
    }

    #[tokio::test]
    async fn unsettled_listing_tracks_settlement() {
        let db = Database::open_in_memory().await.unwrap();
        let op = pending(5);
        create_operation(&db, &op).await.unwrap();

        mark_settled(&db, &op.id).await.unwrap();
        assert!(
            get_operation(&db, &op.id).await.unwrap().settled_at.is_none(),
            "pending operations cannot be settled"
        );

        compare_and_transition(
            &db,
            &op.id,
            OperationStatus::Pending,
            &Transition::refund(None, None),
        )
        .await
        .unwrap();
        let unsettled = list_unsettled(&db, Utc::now(), 10).await.unwrap();
        assert_eq!(unsettled.len(), 1);

        mark_settled(&db, &op.id).await.unwrap();
        assert!(list_unsettled(&db, Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_pending_orders_oldest_first() {
        let db = Database::open_in_memory().await.unwrap();
        let mut first = pending(1);
        first.created_at -= chrono::Duration::seconds(30);
        let second = pending(2);
        create_operation(&db, &second).await.unwrap();
        create_operation(&db, &first).await.unwrap();

        let listed = list_pending(&db, 10).await.unwrap();
        let ids: Vec<_> = listed.iter().map(|op| op.id.clone()).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }
}
