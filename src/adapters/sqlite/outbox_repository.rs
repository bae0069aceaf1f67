//! Transactional outbox.
//!
//! Domain writes enlist [`append_event_in_transaction`] in their own
//! transaction; the relay reads pending records back in creation order.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use super::{format_timestamp, parse_datetime, parse_enum, parse_optional_datetime};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Event, OutboxRecord, OutboxStatus, StageName, Topic};

/// Append `event` to the outbox inside the caller's transaction.
///
/// Returns the record's sequence number. A second event with the same
/// idempotency key is rejected with [`DomainError::DuplicateEvent`].
pub async fn append_event_in_transaction(tx: &mut SqliteConnection, event: &Event) -> DomainResult<i64> {
    append_with_key(tx, event, &event.idempotency_key).await
}

/// Append `event` under an explicit idempotency key, used to requeue stage work.
pub async fn append_with_key(
    tx: &mut SqliteConnection,
    event: &Event,
    idempotency_key: &str,
) -> DomainResult<i64> {
    let payload = serde_json::to_string(event)?;
    let result = sqlx::query(
        r#"INSERT OR IGNORE INTO outbox (event_id, topic, partition_key, event_type, idempotency_key, payload, status, attempts, created_at)
           VALUES (?, ?, ?, ?, ?, ?, 'pending', 0, ?)"#,
    )
    .bind(event.id.to_string())
    .bind(event.topic.as_str())
    .bind(&event.partition_key)
    .bind(event.payload.event_type())
    .bind(idempotency_key)
    .bind(payload)
    .bind(format_timestamp(Utc::now()))
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DomainError::DuplicateEvent {
            idempotency_key: idempotency_key.to_string(),
        });
    }
    Ok(result.last_insert_rowid())
}

#[derive(Clone)]
pub struct SqliteOutboxRepository {
    pool: SqlitePool,
}

impl SqliteOutboxRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Pending records, oldest first.
    pub async fn fetch_pending(&self, limit: usize) -> DomainResult<Vec<OutboxRecord>> {
        let rows: Vec<OutboxRow> = sqlx::query_as(
            "SELECT sequence, idempotency_key, payload, status, attempts, last_error, created_at, published_at
             FROM outbox WHERE status = 'pending' ORDER BY sequence ASC LIMIT ?",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Most recent records in any status, newest first.
    pub async fn list(&self, status: Option<OutboxStatus>, limit: usize) -> DomainResult<Vec<OutboxRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<OutboxRow> = match status {
            Some(status) => {
                sqlx::query_as(
                    "SELECT sequence, idempotency_key, payload, status, attempts, last_error, created_at, published_at
                     FROM outbox WHERE status = ? ORDER BY sequence DESC LIMIT ?",
                )
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT sequence, idempotency_key, payload, status, attempts, last_error, created_at, published_at
                     FROM outbox ORDER BY sequence DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(TryInto::try_into).collect()
    }

    pub async fn mark_published(&self, sequence: i64, at: DateTime<Utc>) -> DomainResult<()> {
        sqlx::query("UPDATE outbox SET status = 'published', published_at = ?, attempts = attempts + 1 WHERE sequence = ?")
            .bind(format_timestamp(at))
            .bind(sequence)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Count a failed publish attempt; the record stays pending.
    pub async fn record_attempt_failure(&self, sequence: i64, error: &str) -> DomainResult<()> {
        sqlx::query("UPDATE outbox SET attempts = attempts + 1, last_error = ? WHERE sequence = ?")
            .bind(error)
            .bind(sequence)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Take a record out of relay rotation for good.
    pub async fn mark_failed(&self, sequence: i64, error: &str) -> DomainResult<()> {
        sqlx::query("UPDATE outbox SET status = 'failed', attempts = attempts + 1, last_error = ? WHERE sequence = ?")
            .bind(error)
            .bind(sequence)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count_by_status(&self, status: OutboxStatus) -> DomainResult<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM outbox WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Delete published records older than `before` whose event every
    /// consuming stage has finished with.
    pub async fn purge_published(&self, before: DateTime<Utc>) -> DomainResult<u64> {
        let mut purged = 0;
        for topic in Topic::ALL {
            let mut sql = String::from(
                "DELETE FROM outbox WHERE status = 'published' AND published_at < ? AND topic = ?",
            );
            let consumers = StageName::consumers_of(topic);
            for _ in &consumers {
                sql.push_str(
                    " AND EXISTS (SELECT 1 FROM stage_records sr WHERE sr.event_id = outbox.event_id
                       AND sr.stage = ? AND (sr.status IN ('success', 'skipped') OR sr.terminal = 1))",
                );
            }

            let mut query = sqlx::query(&sql)
                .bind(format_timestamp(before))
                .bind(topic.as_str());
            for stage in &consumers {
                query = query.bind(stage.as_str());
            }
            purged += query.execute(&self.pool).await?.rows_affected();
        }
        Ok(purged)
    }
}

#[derive(sqlx::FromRow)]
struct OutboxRow {
    sequence: i64,
    idempotency_key: String,
    payload: String,
    status: String,
    attempts: i64,
    last_error: Option<String>,
    created_at: String,
    published_at: Option<String>,
}

impl TryFrom<OutboxRow> for OutboxRecord {
    type Error = DomainError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        Ok(OutboxRecord {
            sequence: row.sequence,
            event: serde_json::from_str(&row.payload)?,
            idempotency_key: row.idempotency_key,
            status: parse_enum(&row.status, "outbox status", OutboxStatus::from_str)?,
            attempts: u32::try_from(row.attempts).unwrap_or(u32::MAX),
            last_error: row.last_error,
            created_at: parse_datetime(&row.created_at)?,
            published_at: parse_optional_datetime(row.published_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;
    use crate::domain::models::{Domain, EnergyDynamic, EventPayload, QuestionId};
    use uuid::Uuid;

    fn answer_event(key: &str) -> Event {
        Event::new(
            EventPayload::AnswerSubmitted {
                session_id: Uuid::new_v4(),
                user_id: "user-1".into(),
                question_id: QuestionId::new("q-1"),
                domain: Domain::Identity,
                energy: EnergyDynamic::Opening,
                depth_level: 1,
                answer_text: "hello".into(),
                responded_at: Utc::now(),
            },
            "session-1",
            key,
        )
    }

    #[tokio::test]
    async fn test_append_and_fetch_in_creation_order() {
        let pool = create_migrated_test_pool().await.unwrap();
        let repo = SqliteOutboxRepository::new(pool.clone());

        let mut tx = pool.begin().await.unwrap();
        let first = append_event_in_transaction(&mut tx, &answer_event("k1")).await.unwrap();
        let second = append_event_in_transaction(&mut tx, &answer_event("k2")).await.unwrap();
        tx.commit().await.unwrap();
        assert!(second > first);

        let pending = repo.fetch_pending(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].sequence, first);
        assert_eq!(pending[0].idempotency_key, "k1");
        assert_eq!(pending[0].status, OutboxStatus::Pending);
    }

    #[tokio::test]
    async fn test_duplicate_idempotency_key_rejected() {
        let pool = create_migrated_test_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        append_event_in_transaction(&mut conn, &answer_event("same")).await.unwrap();
        let err = append_event_in_transaction(&mut conn, &answer_event("same")).await.unwrap_err();
        assert!(matches!(err, DomainError::DuplicateEvent { .. }));
    }

    #[tokio::test]
    async fn test_rolled_back_transaction_leaves_no_record() {
        let pool = create_migrated_test_pool().await.unwrap();
        let repo = SqliteOutboxRepository::new(pool.clone());

        let mut tx = pool.begin().await.unwrap();
        append_event_in_transaction(&mut tx, &answer_event("k1")).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(repo.fetch_pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_attempt_keeps_record_pending() {
        let pool = create_migrated_test_pool().await.unwrap();
        let repo = SqliteOutboxRepository::new(pool.clone());
        let mut conn = pool.acquire().await.unwrap();
        let seq = append_event_in_transaction(&mut conn, &answer_event("k1")).await.unwrap();
        drop(conn);

        repo.record_attempt_failure(seq, "transport down").await.unwrap();
        let pending = repo.fetch_pending(10).await.unwrap();
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("transport down"));

        repo.mark_published(seq, Utc::now()).await.unwrap();
        assert_eq!(repo.count_by_status(OutboxStatus::Pending).await.unwrap(), 0);
        assert_eq!(repo.count_by_status(OutboxStatus::Published).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_purge_waits_for_consuming_stage() {
        let pool = create_migrated_test_pool().await.unwrap();
        let repo = SqliteOutboxRepository::new(pool.clone());
        let event = answer_event("k1");
        let mut conn = pool.acquire().await.unwrap();
        let seq = append_event_in_transaction(&mut conn, &event).await.unwrap();
        drop(conn);
        repo.mark_published(seq, Utc::now() - chrono::Duration::hours(2)).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(repo.purge_published(cutoff).await.unwrap(), 0);

        sqlx::query(
            "INSERT INTO stage_records (event_id, stage, status, event_json, created_at) VALUES (?, 'analysis', 'success', '{}', ?)",
        )
        .bind(event.id.to_string())
        .bind(format_timestamp(Utc::now()))
        .execute(&pool)
        .await
        .unwrap();

        assert_eq!(repo.purge_published(cutoff).await.unwrap(), 1);
    }
}
