// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Credit balance and journal queries.
//!
//! Every mutation reads the balance, checks the invariant, writes the new
//! balance and appends a journal entry inside one `BEGIN IMMEDIATE`
//! transaction, so a reader never observes a negative or half-applied
//! balance.

use chrono::{DateTime, Utc};
use metered_core::{Credits, JournalEntry, JournalKind, MeteredError, OperationId, Posting, UserId};
use rusqlite::{OptionalExtension, Row, Transaction, TransactionBehavior, params};

use crate::database::{
    Database, SqlResultExt, credits_from_sql, credits_to_sql, format_ts, parse_ts,
};

/// How a mutation treats the current balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    /// Subtract exactly `amount` or fail with `InsufficientCredits`.
    Decrement,
    /// Add `amount`.
    Increment,
    /// Subtract `min(amount, balance)`.
    ChargeAvailable,
}

/// Outcome of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    pub balance_after: Credits,
    /// Credits actually moved (always non-negative).
    pub moved: Credits,
    /// False when the posting had already been applied.
    pub fresh: bool,
}

const JOURNAL_COLUMNS: &str =
    "id, user_id, operation_id, kind, delta, balance_after, reconciled, created_at";

fn journal_from_row(row: &Row<'_>) -> rusqlite::Result<JournalEntry> {
    let kind: String = row.get(3)?;
    let created_at: String = row.get(7)?;
    Ok(JournalEntry {
        id: row.get(0)?,
        user_id: UserId(row.get(1)?),
        operation_id: row.get::<_, Option<String>>(2)?.map(OperationId),
        kind: kind.parse().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?,
        delta: row.get(4)?,
        balance_after: credits_from_sql(5, row.get(5)?)?,
        reconciled: row.get(6)?,
        created_at: parse_ts(7, &created_at)?,
    })
}

fn read_balance(tx: &Transaction<'_>, user_id: &str) -> Result<Credits, MeteredError> {
    let raw: Option<i64> = tx
        .query_row(
            "SELECT credits FROM credit_balances WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()
        .sql()?;
    match raw {
        Some(raw) => credits_from_sql(0, raw).sql(),
        None => Ok(0),
    }
}

/// Apply one mutation inside an open transaction.
///
/// A posting naming an operation is applied at most once per kind; a repeat
/// returns the current balance and the credits moved the first time.
pub(crate) fn apply_in_tx(
    tx: &Transaction<'_>,
    user_id: &UserId,
    amount: Credits,
    posting: &Posting,
    mutation: Mutation,
) -> Result<Applied, MeteredError> {
    let current = read_balance(tx, user_id.as_str())?;

    if let Some(operation_id) = &posting.operation_id {
        let prior: Option<i64> = tx
            .query_row(
                "SELECT delta FROM credit_journal WHERE operation_id = ?1 AND kind = ?2",
                params![operation_id.as_str(), posting.kind.to_string()],
                |row| row.get(0),
            )
            .optional()
            .sql()?;
        if let Some(delta) = prior {
            return Ok(Applied {
                balance_after: current,
                moved: delta.unsigned_abs(),
                fresh: false,
            });
        }
    }

    let (next, moved) = match mutation {
        Mutation::Decrement => {
            if current < amount {
                return Err(MeteredError::InsufficientCredits {
                    user_id: user_id.to_string(),
                    requested: amount,
                    available: current,
                });
            }
            (current - amount, amount)
        }
        Mutation::Increment => {
            let next = current.checked_add(amount).ok_or_else(|| {
                MeteredError::Validation(format!("balance overflow for {user_id}"))
            })?;
            (next, amount)
        }
        Mutation::ChargeAvailable => {
            let taken = amount.min(current);
            (current - taken, taken)
        }
    };

    let next_sql = credits_to_sql(next)?;
    let moved_sql = credits_to_sql(moved)?;
    let delta = if mutation == Mutation::Increment {
        moved_sql
    } else {
        -moved_sql
    };
    let now = format_ts(Utc::now());

    tx.execute(
        "INSERT INTO credit_balances (user_id, credits, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(user_id) DO UPDATE SET credits = excluded.credits,
                                            updated_at = excluded.updated_at",
        params![user_id.as_str(), next_sql, now],
    )
    .sql()?;

    tx.execute(
        "INSERT INTO credit_journal (user_id, operation_id, kind, delta, balance_after, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            user_id.as_str(),
            posting.operation_id.as_ref().map(|id| id.as_str().to_string()),
            posting.kind.to_string(),
            delta,
            next_sql,
            now,
        ],
    )
    .sql()?;

    Ok(Applied {
        balance_after: next,
        moved,
        fresh: true,
    })
}

/// Current balance for a user; zero if no row exists.
pub async fn balance(db: &Database, user_id: &UserId) -> Result<Credits, MeteredError> {
    let user_id = user_id.as_str().to_string();
    db.call(move |conn| {
        let tx = conn.transaction().sql()?;
        let credits = read_balance(&tx, &user_id)?;
        tx.commit().sql()?;
        Ok(credits)
    })
    .await
}

/// Apply a mutation atomically.
pub async fn apply(
    db: &Database,
    user_id: &UserId,
    amount: Credits,
    posting: &Posting,
    mutation: Mutation,
) -> Result<Applied, MeteredError> {
    let user_id = user_id.clone();
    let posting = posting.clone();
    db.call(move |conn| {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .sql()?;
        let applied = apply_in_tx(&tx, &user_id, amount, &posting, mutation)?;
        tx.commit().sql()?;
        Ok(applied)
    })
    .await
}

/// Journal entries for a user, oldest first.
pub async fn journal(db: &Database, user_id: &UserId) -> Result<Vec<JournalEntry>, MeteredError> {
    let user_id = user_id.as_str().to_string();
    db.call(move |conn| {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {JOURNAL_COLUMNS} FROM credit_journal WHERE user_id = ?1 ORDER BY id ASC"
            ))
            .sql()?;
        let entries = stmt
            .query_map(params![user_id], journal_from_row)
            .sql()?
            .collect::<Result<Vec<_>, _>>()
            .sql()?;
        Ok(entries)
    })
    .await
}

/// Unchecked `reserve` entries created at or before `before`.
pub async fn unreconciled_reservations(
    db: &Database,
    before: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<JournalEntry>, MeteredError> {
    let before = format_ts(before);
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    db.call(move |conn| {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {JOURNAL_COLUMNS} FROM credit_journal
                 WHERE kind = 'reserve' AND reconciled = 0 AND created_at <= ?1
                 ORDER BY id ASC LIMIT ?2"
            ))
            .sql()?;
        let entries = stmt
            .query_map(params![before, limit], journal_from_row)
            .sql()?
            .collect::<Result<Vec<_>, _>>()
            .sql()?;
        Ok(entries)
    })
    .await
}

/// Flag a journal entry as checked by the reconciliation sweep.
pub async fn mark_reconciled(db: &Database, entry_id: i64) -> Result<(), MeteredError> {
    db.call(move |conn| {
        conn.execute(
            "UPDATE credit_journal SET reconciled = 1 WHERE id = ?1",
            params![entry_id],
        )
        .sql()?;
        Ok(())
    })
    .await
}

/// Refund an orphaned reservation and flag it, in one transaction.
///
/// Returns `false` if the entry was already reconciled or its refund had
/// already been posted.
pub async fn compensate(db: &Database, entry: &JournalEntry) -> Result<bool, MeteredError> {
    if entry.kind != JournalKind::Reserve {
        return Err(MeteredError::Validation(format!(
            "journal entry {} is a {} entry, not a reservation",
            entry.id, entry.kind
        )));
    }
    let entry = entry.clone();
    db.call(move |conn| {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .sql()?;
        let reconciled: Option<bool> = tx
            .query_row(
                "SELECT reconciled FROM credit_journal WHERE id = ?1",
                params![entry.id],
                |row| row.get(0),
            )
            .optional()
            .sql()?;
        if reconciled != Some(false) {
            return Ok(false);
        }

        let refund = entry.delta.unsigned_abs();
        let posting = match &entry.operation_id {
            Some(id) => Posting::for_operation(id, JournalKind::Compensate),
            None => Posting {
                operation_id: None,
                kind: JournalKind::Compensate,
            },
        };
        let applied = apply_in_tx(&tx, &entry.user_id, refund, &posting, Mutation::Increment)?;
        tx.execute(
            "UPDATE credit_journal SET reconciled = 1 WHERE id = ?1",
            params![entry.id],
        )
        .sql()?;
        tx.commit().sql()?;
        Ok(applied.fresh)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserId {
        UserId::new("user-1")
    }

    async fn funded(credits: Credits) -> Database {
        let db = Database::open_in_memory().await.unwrap();
        apply(&db, &user(), credits, &Posting::grant(), Mutation::Increment)
            .await
            .unwrap();
        db
    }

    #[tokio::test]
    async fn unknown_user_has_zero_balance() {
        let db = Database::open_in_memory().await.unwrap();
        assert_eq!(balance(&db, &UserId::new("nobody")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn decrement_rejects_overdraw_without_change() {
        let db = funded(3).await;
        let op = OperationId::generate();
        let err = apply(
            &db,
            &user(),
            5,
            &Posting::for_operation(&op, JournalKind::Reserve),
            Mutation::Decrement,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            MeteredError::InsufficientCredits {
                requested: 5,
                available: 3,
                ..
            }
        ));
        assert_eq!(balance(&db, &user()).await.unwrap(), 3);
        assert_eq!(journal(&db, &user()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn repeated_posting_is_applied_once() {
        let db = funded(10).await;
        let op = OperationId::generate();
        let posting = Posting::for_operation(&op, JournalKind::Release);

        let first = apply(&db, &user(), 2, &posting, Mutation::Increment)
            .await
            .unwrap();
        let second = apply(&db, &user(), 2, &posting, Mutation::Increment)
            .await
            .unwrap();

        assert!(first.fresh);
        assert!(!second.fresh);
        assert_eq!(second.moved, 2);
        assert_eq!(balance(&db, &user()).await.unwrap(), 12);
    }

    #[tokio::test]
    async fn charge_available_floors_at_zero() {
        let db = funded(2).await;
        let op = OperationId::generate();
        let applied = apply(
            &db,
            &user(),
            5,
            &Posting::for_operation(&op, JournalKind::Surcharge),
            Mutation::ChargeAvailable,
        )
        .await
        .unwrap();
        assert_eq!(applied.moved, 2);
        assert_eq!(applied.balance_after, 0);

        let entries = journal(&db, &user()).await.unwrap();
        let last = entries.last().unwrap();
        assert_eq!(last.kind, JournalKind::Surcharge);
        assert_eq!(last.delta, -2);
        assert_eq!(last.balance_after, 0);
    }

    #[tokio::test]
    async fn compensate_refunds_once() {
        let db = funded(10).await;
        let op = OperationId::generate();
        apply(
            &db,
            &user(),
            4,
            &Posting::for_operation(&op, JournalKind::Reserve),
            Mutation::Decrement,
        )
        .await
        .unwrap();

        let pending = unreconciled_reservations(&db, Utc::now(), 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        let entry = &pending[0];

        assert!(compensate(&db, entry).await.unwrap());
        assert!(!compensate(&db, entry).await.unwrap());
        assert_eq!(balance(&db, &user()).await.unwrap(), 10);
        assert!(
            unreconciled_reservations(&db, Utc::now(), 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn reservations_newer_than_cutoff_are_skipped() {
        let db = funded(10).await;
        let op = OperationId::generate();
        apply(
            &db,
            &user(),
            1,
            &Posting::for_operation(&op, JournalKind::Reserve),
            Mutation::Decrement,
        )
        .await
        .unwrap();

        let cutoff = Utc::now() - chrono::Duration::minutes(10);
        assert!(
            unreconciled_reservations(&db, cutoff, 10)
                .await
                .unwrap()
                .is_empty()
        );
    }
}
