//! Durable consumer-group transport on SQLite.
//!
//! Streams, group cursors and pending-entry lists live in the same database
//! as the outbox, so a restarted `serve` resumes exactly where it stopped.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use super::format_timestamp;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::Event;
use crate::domain::ports::{Delivery, MessageId, Transport};

#[derive(Clone)]
pub struct SqliteTransport {
    pool: SqlitePool,
}

impl SqliteTransport {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load(
        &self,
        conn: &mut SqliteConnection,
        stream: &str,
        group: &str,
        claimed: Vec<(i64, i64)>,
    ) -> DomainResult<Vec<Delivery>> {
        let mut deliveries = Vec::with_capacity(claimed.len());
        for (id, delivery_count) in claimed {
            let row: Option<(String,)> = sqlx::query_as("SELECT payload FROM stream_entries WHERE stream = ? AND id = ?")
                .bind(stream)
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?;
            let Some((payload,)) = row else {
                drop_pending(conn, stream, group, id).await?;
                continue;
            };
            match serde_json::from_str::<Event>(&payload) {
                Ok(event) => deliveries.push(Delivery {
                    id: MessageId(u64::try_from(id).unwrap_or(0)),
                    stream: stream.to_string(),
                    event,
                    delivery_count: u32::try_from(delivery_count).unwrap_or(u32::MAX),
                }),
                Err(e) => {
                    tracing::warn!(stream, id, error = %e, "dropping undecodable stream entry");
                    drop_pending(conn, stream, group, id).await?;
                }
            }
        }
        Ok(deliveries)
    }
}

async fn drop_pending(conn: &mut SqliteConnection, stream: &str, group: &str, id: i64) -> DomainResult<()> {
    sqlx::query("DELETE FROM stream_pending WHERE stream = ? AND group_name = ? AND id = ?")
        .bind(stream)
        .bind(group)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn transient(e: sqlx::Error) -> DomainError {
    DomainError::TransientTransport(e.to_string())
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait]
impl Transport for SqliteTransport {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> DomainResult<()> {
        sqlx::query("INSERT OR IGNORE INTO stream_groups (stream, group_name, last_delivered_id) VALUES (?, ?, 0)")
            .bind(stream)
            .bind(group)
            .execute(&self.pool)
            .await
            .map_err(transient)?;
        Ok(())
    }

    async fn publish(&self, stream: &str, event: &Event) -> DomainResult<MessageId> {
        let payload = serde_json::to_string(event)?;
        let mut tx = self.pool.begin().await.map_err(transient)?;

        // Ids come from the stream head, not from the surviving entries, so
        // trimming never lets an id fall behind a group cursor.
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO stream_heads (stream, last_id) VALUES (?, 1)
             ON CONFLICT (stream) DO UPDATE SET last_id = last_id + 1
             RETURNING last_id",
        )
        .bind(stream)
        .fetch_one(&mut *tx)
        .await
        .map_err(transient)?;

        sqlx::query("INSERT INTO stream_entries (stream, id, payload, created_at) VALUES (?, ?, ?, ?)")
            .bind(stream)
            .bind(id)
            .bind(payload)
            .bind(format_timestamp(Utc::now()))
            .execute(&mut *tx)
            .await
            .map_err(transient)?;
        tx.commit().await.map_err(transient)?;
        Ok(MessageId(u64::try_from(id).unwrap_or(0)))
    }

    async fn read_batch(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max: usize,
    ) -> DomainResult<Vec<Delivery>> {
        let mut tx = self.pool.begin().await.map_err(transient)?;

        // Write first so the cursor is locked for the rest of the transaction.
        let touched = sqlx::query(
            "UPDATE stream_groups SET last_delivered_id = last_delivered_id WHERE stream = ? AND group_name = ?",
        )
        .bind(stream)
        .bind(group)
        .execute(&mut *tx)
        .await
        .map_err(transient)?;
        if touched.rows_affected() == 0 {
            return Err(DomainError::ValidationFailed(format!("unknown group {group} on {stream}")));
        }

        let (cursor,): (i64,) =
            sqlx::query_as("SELECT last_delivered_id FROM stream_groups WHERE stream = ? AND group_name = ?")
                .bind(stream)
                .bind(group)
                .fetch_one(&mut *tx)
                .await
                .map_err(transient)?;

        let ids: Vec<(i64,)> =
            sqlx::query_as("SELECT id FROM stream_entries WHERE stream = ? AND id > ? ORDER BY id ASC LIMIT ?")
                .bind(stream)
                .bind(cursor)
                .bind(i64::try_from(max).unwrap_or(i64::MAX))
                .fetch_all(&mut *tx)
                .await
                .map_err(transient)?;

        let Some(&(last,)) = ids.last() else {
            tx.commit().await.map_err(transient)?;
            return Ok(Vec::new());
        };

        let delivered_at = now_ms();
        for (id,) in &ids {
            sqlx::query(
                "INSERT OR REPLACE INTO stream_pending (stream, group_name, id, consumer, delivered_at_ms, delivery_count)
                 VALUES (?, ?, ?, ?, ?, 1)",
            )
            .bind(stream)
            .bind(group)
            .bind(id)
            .bind(consumer)
            .bind(delivered_at)
            .execute(&mut *tx)
            .await
            .map_err(transient)?;
        }
        sqlx::query("UPDATE stream_groups SET last_delivered_id = ? WHERE stream = ? AND group_name = ?")
            .bind(last)
            .bind(stream)
            .bind(group)
            .execute(&mut *tx)
            .await
            .map_err(transient)?;

        let claimed = ids.into_iter().map(|(id,)| (id, 1)).collect();
        let deliveries = self.load(&mut tx, stream, group, claimed).await?;
        tx.commit().await.map_err(transient)?;
        Ok(deliveries)
    }

    async fn ack(&self, stream: &str, group: &str, id: MessageId) -> DomainResult<()> {
        let mut conn = self.pool.acquire().await.map_err(transient)?;
        drop_pending(&mut conn, stream, group, i64::try_from(id.0).unwrap_or(i64::MAX)).await
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> DomainResult<Vec<Delivery>> {
        let now = now_ms();
        let idle_ms = i64::try_from(min_idle.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now.saturating_sub(idle_ms);

        let mut tx = self.pool.begin().await.map_err(transient)?;
        let mut claimed: Vec<(i64, i64)> = sqlx::query_as(
            "UPDATE stream_pending SET consumer = ?, delivered_at_ms = ?, delivery_count = delivery_count + 1
             WHERE stream = ? AND group_name = ? AND delivered_at_ms <= ?
             RETURNING id, delivery_count",
        )
        .bind(consumer)
        .bind(now)
        .bind(stream)
        .bind(group)
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(transient)?;
        claimed.sort_unstable();

        let deliveries = self.load(&mut tx, stream, group, claimed).await?;
        tx.commit().await.map_err(transient)?;
        Ok(deliveries)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> DomainResult<usize> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM stream_pending WHERE stream = ? AND group_name = ?")
            .bind(stream)
            .bind(group)
            .fetch_one(&self.pool)
            .await
            .map_err(transient)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn trim_acknowledged(&self, before: DateTime<Utc>) -> DomainResult<u64> {
        let result = sqlx::query(
            "DELETE FROM stream_entries
             WHERE created_at < ?
               AND NOT EXISTS (SELECT 1 FROM stream_pending p WHERE p.stream = stream_entries.stream AND p.id = stream_entries.id)
               AND NOT EXISTS (SELECT 1 FROM stream_groups g WHERE g.stream = stream_entries.stream AND g.last_delivered_id < stream_entries.id)",
        )
        .bind(format_timestamp(before))
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;
    use crate::domain::models::{Domain, EnergyDynamic, EventPayload, QuestionId};
    use uuid::Uuid;

    fn event(n: usize) -> Event {
        Event::new(
            EventPayload::AnswerSubmitted {
                session_id: Uuid::new_v4(),
                user_id: "user-1".into(),
                question_id: QuestionId::new(format!("q-{n}")),
                domain: Domain::Values,
                energy: EnergyDynamic::Neutral,
                depth_level: 1,
                answer_text: format!("answer {n}"),
                responded_at: Utc::now(),
            },
            "session-1",
            format!("answer:{n}"),
        )
    }

    #[tokio::test]
    async fn test_group_reads_in_order_and_tracks_pending() {
        let pool = create_migrated_test_pool().await.unwrap();
        let transport = SqliteTransport::new(pool);
        transport.ensure_group("answers.p0", "stage.analysis").await.unwrap();

        for n in 0..3 {
            transport.publish("answers.p0", &event(n)).await.unwrap();
        }

        let batch = transport.read_batch("answers.p0", "stage.analysis", "w0", 2).await.unwrap();
        assert_eq!(batch.iter().map(|d| d.id).collect::<Vec<_>>(), vec![MessageId(1), MessageId(2)]);
        let rest = transport.read_batch("answers.p0", "stage.analysis", "w0", 10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(transport.pending_count("answers.p0", "stage.analysis").await.unwrap(), 3);

        for d in batch.iter().chain(&rest) {
            transport.ack("answers.p0", "stage.analysis", d.id).await.unwrap();
        }
        assert_eq!(transport.pending_count("answers.p0", "stage.analysis").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_new_group_starts_from_beginning() {
        let pool = create_migrated_test_pool().await.unwrap();
        let transport = SqliteTransport::new(pool);
        transport.publish("answers.p1", &event(0)).await.unwrap();
        transport.ensure_group("answers.p1", "late").await.unwrap();

        let batch = transport.read_batch("answers.p1", "late", "w0", 10).await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_group_is_rejected() {
        let pool = create_migrated_test_pool().await.unwrap();
        let transport = SqliteTransport::new(pool);
        let err = transport.read_batch("answers.p0", "nobody", "w0", 10).await.unwrap_err();
        assert!(matches!(err, DomainError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn test_claim_stale_transfers_ownership() {
        let pool = create_migrated_test_pool().await.unwrap();
        let transport = SqliteTransport::new(pool);
        transport.ensure_group("answers.p0", "g").await.unwrap();
        transport.publish("answers.p0", &event(0)).await.unwrap();

        let first = transport.read_batch("answers.p0", "g", "crashed", 10).await.unwrap();
        assert_eq!(first[0].delivery_count, 1);

        let none = transport
            .claim_stale("answers.p0", "g", "rescuer", Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(none.is_empty());

        let claimed = transport
            .claim_stale("answers.p0", "g", "rescuer", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].delivery_count, 2);
        assert_eq!(claimed[0].event, first[0].event);
    }

    #[tokio::test]
    async fn test_trim_keeps_unacknowledged_entries() {
        let pool = create_migrated_test_pool().await.unwrap();
        let transport = SqliteTransport::new(pool);
        transport.ensure_group("answers.p0", "g").await.unwrap();
        transport.publish("answers.p0", &event(0)).await.unwrap();
        transport.publish("answers.p0", &event(1)).await.unwrap();

        let batch = transport.read_batch("answers.p0", "g", "w", 1).await.unwrap();
        let later = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(transport.trim_acknowledged(later).await.unwrap(), 0);

        transport.ack("answers.p0", "g", batch[0].id).await.unwrap();
        assert_eq!(transport.trim_acknowledged(later).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ids_keep_growing_after_a_full_trim() {
        let pool = create_migrated_test_pool().await.unwrap();
        let transport = SqliteTransport::new(pool);
        transport.ensure_group("answers.p0", "g").await.unwrap();
        transport.publish("answers.p0", &event(0)).await.unwrap();
        transport.publish("answers.p0", &event(1)).await.unwrap();

        for d in transport.read_batch("answers.p0", "g", "w", 10).await.unwrap() {
            transport.ack("answers.p0", "g", d.id).await.unwrap();
        }
        let later = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(transport.trim_acknowledged(later).await.unwrap(), 2);

        let id = transport.publish("answers.p0", &event(2)).await.unwrap();
        assert_eq!(id, MessageId(3));
        let batch = transport.read_batch("answers.p0", "g", "w", 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].event.idempotency_key, "answer:2");
    }
}
