//! Per-(event, stage) processing records.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use super::{format_timestamp, parse_enum, parse_optional_datetime};
use crate::domain::errors::{DomainError, DomainResult, ErrorKind};
use crate::domain::models::{AttemptDecision, Event, EventId, StageName, StageRecord, StageStatus};

const RECORD_COLUMNS: &str = "event_id, stage, status, terminal, retry_count, error_kind, last_error, last_attempt_at, completed_at, event_json";

#[derive(Clone)]
pub struct SqliteStageRepository {
    pool: SqlitePool,
}

impl SqliteStageRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register a delivery of `event` to `stage` and decide whether to run it.
    pub async fn begin_attempt(
        &self,
        event: &Event,
        stage: StageName,
        now: DateTime<Utc>,
    ) -> DomainResult<AttemptDecision> {
        let event_json = serde_json::to_string(event)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT OR IGNORE INTO stage_records (event_id, stage, status, terminal, retry_count, event_json, created_at)
             VALUES (?, ?, 'pending', 0, 0, ?, ?)",
        )
        .bind(event.id.to_string())
        .bind(stage.as_str())
        .bind(event_json)
        .bind(format_timestamp(now))
        .execute(&mut *tx)
        .await?;

        let (status, terminal): (String, bool) =
            sqlx::query_as("SELECT status, terminal FROM stage_records WHERE event_id = ? AND stage = ?")
                .bind(event.id.to_string())
                .bind(stage.as_str())
                .fetch_one(&mut *tx)
                .await?;
        let status = parse_enum(&status, "stage status", StageStatus::from_str)?;

        let decision = match status {
            StageStatus::Success | StageStatus::Skipped => AttemptDecision::AlreadyTerminal,
            StageStatus::Failed if terminal => AttemptDecision::AlreadyTerminal,
            StageStatus::Failed => AttemptDecision::AwaitingRetry,
            StageStatus::Pending => {
                sqlx::query("UPDATE stage_records SET last_attempt_at = ? WHERE event_id = ? AND stage = ?")
                    .bind(format_timestamp(now))
                    .bind(event.id.to_string())
                    .bind(stage.as_str())
                    .execute(&mut *tx)
                    .await?;
                AttemptDecision::Proceed
            }
        };

        tx.commit().await?;
        Ok(decision)
    }

    pub async fn get(&self, event_id: EventId, stage: StageName) -> DomainResult<Option<StageRecord>> {
        let mut conn = self.pool.acquire().await?;
        get_in(&mut conn, event_id, stage).await
    }

    /// Move a pending record to `failed`. `terminal` removes it from automatic retry.
    pub async fn record_failure(
        &self,
        event_id: EventId,
        stage: StageName,
        kind: ErrorKind,
        error: &str,
        terminal: bool,
        now: DateTime<Utc>,
    ) -> DomainResult<Option<StageRecord>> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE stage_records SET status = 'failed', terminal = ?, error_kind = ?, last_error = ?, last_attempt_at = ?
             WHERE event_id = ? AND stage = ? AND status = 'pending'",
        )
        .bind(terminal)
        .bind(kind.as_str())
        .bind(error)
        .bind(format_timestamp(now))
        .bind(event_id.to_string())
        .bind(stage.as_str())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let record = get_in(&mut tx, event_id, stage).await?;
        tx.commit().await?;
        Ok(record)
    }

    /// Flag a failed record as terminal without touching its retry count.
    pub async fn mark_terminal(&self, event_id: EventId, stage: StageName) -> DomainResult<bool> {
        let result = sqlx::query(
            "UPDATE stage_records SET terminal = 1 WHERE event_id = ? AND stage = ? AND status = 'failed' AND terminal = 0",
        )
        .bind(event_id.to_string())
        .bind(stage.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Failed, non-terminal records, least recently attempted first.
    pub async fn retry_candidates(&self, limit: usize) -> DomainResult<Vec<StageRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM stage_records WHERE status = 'failed' AND terminal = 0
             ORDER BY last_attempt_at ASC LIMIT ?"
        );
        let rows: Vec<StageRow> = sqlx::query_as(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Failed records, most recent first.
    pub async fn list_failures(&self, terminal_only: bool, limit: usize) -> DomainResult<Vec<StageRecord>> {
        let filter = if terminal_only { " AND terminal = 1" } else { "" };
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM stage_records WHERE status = 'failed'{filter}
             ORDER BY last_attempt_at DESC LIMIT ?"
        );
        let rows: Vec<StageRow> = sqlx::query_as(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    pub async fn terminal_failure_count(&self) -> DomainResult<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM stage_records WHERE status = 'failed' AND terminal = 1")
                .fetch_one(&self.pool)
                .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Share of attempts since `since` that ended in failure.
    pub async fn failure_rate_since(&self, since: DateTime<Utc>) -> DomainResult<f64> {
        let (failed, finished): (i64, i64) = sqlx::query_as(
            "SELECT COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status IN ('failed', 'success') THEN 1 ELSE 0 END), 0)
             FROM stage_records WHERE last_attempt_at >= ?",
        )
        .bind(format_timestamp(since))
        .fetch_one(&self.pool)
        .await?;

        if finished == 0 {
            return Ok(0.0);
        }
        Ok(failed as f64 / finished as f64)
    }
}

pub async fn get_in(
    conn: &mut SqliteConnection,
    event_id: EventId,
    stage: StageName,
) -> DomainResult<Option<StageRecord>> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM stage_records WHERE event_id = ? AND stage = ?");
    let row: Option<StageRow> = sqlx::query_as(&sql)
        .bind(event_id.to_string())
        .bind(stage.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    row.map(TryInto::try_into).transpose()
}

/// Close a pending record inside the caller's transaction.
///
/// Returns `false` if another delivery already closed it; the caller must
/// then roll back its effects.
pub async fn complete_in_transaction(
    tx: &mut SqliteConnection,
    event_id: EventId,
    stage: StageName,
    status: StageStatus,
    now: DateTime<Utc>,
) -> DomainResult<bool> {
    let result = sqlx::query(
        "UPDATE stage_records SET status = ?, error_kind = NULL, completed_at = ?, last_attempt_at = ?
         WHERE event_id = ? AND stage = ? AND status = 'pending'",
    )
    .bind(status.as_str())
    .bind(format_timestamp(now))
    .bind(format_timestamp(now))
    .bind(event_id.to_string())
    .bind(stage.as_str())
    .execute(&mut *tx)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Move a failed, non-terminal record back to pending, bumping its retry count.
/// `expected_retry_count` guards against two coordinators requeueing the same work.
pub async fn requeue_in_transaction(
    tx: &mut SqliteConnection,
    event_id: EventId,
    stage: StageName,
    expected_retry_count: u32,
) -> DomainResult<bool> {
    let result = sqlx::query(
        "UPDATE stage_records SET status = 'pending', retry_count = retry_count + 1
         WHERE event_id = ? AND stage = ? AND status = 'failed' AND terminal = 0 AND retry_count = ?",
    )
    .bind(event_id.to_string())
    .bind(stage.as_str())
    .bind(i64::from(expected_retry_count))
    .execute(&mut *tx)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Operator replay: reopen a terminal failure.
pub async fn reopen_terminal_in_transaction(
    tx: &mut SqliteConnection,
    event_id: EventId,
    stage: StageName,
) -> DomainResult<bool> {
    let result = sqlx::query(
        "UPDATE stage_records SET status = 'pending', terminal = 0, retry_count = retry_count + 1
         WHERE event_id = ? AND stage = ? AND status = 'failed' AND terminal = 1",
    )
    .bind(event_id.to_string())
    .bind(stage.as_str())
    .execute(&mut *tx)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[derive(sqlx::FromRow)]
struct StageRow {
    event_id: String,
    stage: String,
    status: String,
    terminal: bool,
    retry_count: i64,
    error_kind: Option<String>,
    last_error: Option<String>,
    last_attempt_at: Option<String>,
    completed_at: Option<String>,
    event_json: String,
}

impl TryFrom<StageRow> for StageRecord {
    type Error = DomainError;

    fn try_from(row: StageRow) -> Result<Self, Self::Error> {
        let event: Event = serde_json::from_str(&row.event_json)?;
        let event_id = EventId(super::parse_uuid(&row.event_id)?);
        Ok(StageRecord {
            event_id,
            stage: parse_enum(&row.stage, "stage", StageName::from_str)?,
            status: parse_enum(&row.status, "stage status", StageStatus::from_str)?,
            terminal: row.terminal,
            retry_count: u32::try_from(row.retry_count).unwrap_or(u32::MAX),
            error_kind: row.error_kind.as_deref().and_then(ErrorKind::from_str),
            last_error: row.last_error,
            last_attempt_at: parse_optional_datetime(row.last_attempt_at)?,
            completed_at: parse_optional_datetime(row.completed_at)?,
            event,
        })
    }
}
