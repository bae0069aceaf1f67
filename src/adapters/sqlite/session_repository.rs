//! SQLite persistence for sessions, answers, skips and fatigue snapshots.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::{format_timestamp, parse_datetime, parse_enum, parse_json_or_default, parse_optional_datetime, parse_uuid};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    AnswerRecord, Domain, EnergyDynamic, FatigueComponents, FatigueLevel, FatigueSnapshot, Phase, QuestionId,
    Session, SessionStatus, SuggestedAction,
};

const SESSION_COLUMNS: &str = "id, user_id, status, questions_answered, answered_domain_counts, answered_depth_by_domain, \
    last_question_energy, previous_question_energy, last_question_id, question_served_at, phase, min_safety_level, \
    started_at, last_activity_at, paused_until, ended_at";

#[derive(Clone)]
pub struct SqliteSessionRepository {
    pool: SqlitePool,
}

impl SqliteSessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn create(&self, session: &Session) -> DomainResult<()> {
        sqlx::query(
            r#"INSERT INTO sessions (id, user_id, status, questions_answered, answered_domain_counts, answered_depth_by_domain,
               last_question_energy, previous_question_energy, last_question_id, question_served_at, phase, min_safety_level,
               started_at, last_activity_at, paused_until, ended_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(session.id.to_string())
        .bind(&session.user_id)
        .bind(session.status.as_str())
        .bind(i64::from(session.questions_answered))
        .bind(serde_json::to_string(&session.answered_domain_counts)?)
        .bind(serde_json::to_string(&session.answered_depth_by_domain)?)
        .bind(session.last_question_energy.map(|e| e.as_str()))
        .bind(session.previous_question_energy.map(|e| e.as_str()))
        .bind(session.last_question_id.as_ref().map(QuestionId::as_str))
        .bind(session.question_served_at.map(format_timestamp))
        .bind(session.phase.as_str())
        .bind(i64::from(session.min_safety_level))
        .bind(format_timestamp(session.started_at))
        .bind(format_timestamp(session.last_activity_at))
        .bind(session.paused_until.map(format_timestamp))
        .bind(session.ended_at.map(format_timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> DomainResult<Option<Session>> {
        let mut conn = self.pool.acquire().await?;
        get_in(&mut conn, id).await
    }

    pub async fn update(&self, session: &Session) -> DomainResult<()> {
        let mut conn = self.pool.acquire().await?;
        update_in(&mut conn, session).await
    }

    /// Sessions in `status`, most recently active first.
    pub async fn list(&self, status: Option<SessionStatus>, limit: usize) -> DomainResult<Vec<Session>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<SessionRow> = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions WHERE status = ? ORDER BY last_activity_at DESC LIMIT ?"
                );
                sqlx::query_as(&sql).bind(status.as_str()).bind(limit).fetch_all(&self.pool).await?
            }
            None => {
                let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions ORDER BY last_activity_at DESC LIMIT ?");
                sqlx::query_as(&sql).bind(limit).fetch_all(&self.pool).await?
            }
        };
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Active or paused sessions with no activity since `before`.
    pub async fn idle_since(&self, before: DateTime<Utc>) -> DomainResult<Vec<Session>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE status IN ('active', 'paused') AND last_activity_at < ?"
        );
        let rows: Vec<SessionRow> = sqlx::query_as(&sql)
            .bind(format_timestamp(before))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// The last `limit` answers of a session, oldest first.
    pub async fn recent_answers(&self, session_id: Uuid, limit: usize) -> DomainResult<Vec<AnswerRecord>> {
        let rows: Vec<AnswerRow> = sqlx::query_as(
            "SELECT id, session_id, question_id, domain, energy, depth_level, answer_text, response_time_secs, responded_at
             FROM (SELECT * FROM answers WHERE session_id = ? ORDER BY responded_at DESC, rowid DESC LIMIT ?)
             ORDER BY responded_at ASC",
        )
        .bind(session_id.to_string())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    pub async fn answered_ids(&self, session_id: Uuid) -> DomainResult<HashSet<QuestionId>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT question_id FROM answers WHERE session_id = ?")
            .bind(session_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| QuestionId(id)).collect())
    }

    /// Record a skip. Flagging is sticky: a later unflagged skip keeps the flag.
    pub async fn record_skip(
        &self,
        session_id: Uuid,
        question_id: &QuestionId,
        flagged: bool,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO session_skips (session_id, question_id, flagged, skipped_at) VALUES (?, ?, ?, ?)
             ON CONFLICT (session_id, question_id) DO UPDATE SET flagged = MAX(flagged, excluded.flagged), skipped_at = excluded.skipped_at",
        )
        .bind(session_id.to_string())
        .bind(question_id.as_str())
        .bind(flagged)
        .bind(format_timestamp(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn skips(&self, session_id: Uuid) -> DomainResult<HashMap<QuestionId, bool>> {
        let rows: Vec<(String, bool)> =
            sqlx::query_as("SELECT question_id, flagged FROM session_skips WHERE session_id = ?")
                .bind(session_id.to_string())
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id, flagged)| (QuestionId(id), flagged)).collect())
    }

    pub async fn save_fatigue(&self, snapshot: &FatigueSnapshot) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO fatigue_snapshots (session_id, score, level, components, suggested_action, computed_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(snapshot.session_id.to_string())
        .bind(snapshot.score)
        .bind(snapshot.level.as_str())
        .bind(serde_json::to_string(&snapshot.components)?)
        .bind(serde_json::to_string(&snapshot.suggested_action)?)
        .bind(format_timestamp(snapshot.computed_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn latest_fatigue(&self, session_id: Uuid) -> DomainResult<Option<FatigueSnapshot>> {
        let row: Option<FatigueRow> = sqlx::query_as(
            "SELECT session_id, score, level, components, suggested_action, computed_at
             FROM fatigue_snapshots WHERE session_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(session_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    /// Delete snapshots computed before `before`, keeping each session's latest.
    pub async fn prune_fatigue(&self, before: DateTime<Utc>) -> DomainResult<u64> {
        let result = sqlx::query(
            "DELETE FROM fatigue_snapshots
             WHERE computed_at < ?
               AND id NOT IN (SELECT MAX(id) FROM fatigue_snapshots GROUP BY session_id)",
        )
        .bind(format_timestamp(before))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Latest fatigue level of every active or paused session, counted by level.
    pub async fn fatigue_distribution(&self) -> DomainResult<BTreeMap<FatigueLevel, u64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT f.level, COUNT(*) FROM fatigue_snapshots f
             JOIN sessions s ON s.id = f.session_id
             WHERE s.status IN ('active', 'paused')
               AND f.id = (SELECT MAX(id) FROM fatigue_snapshots WHERE session_id = f.session_id)
             GROUP BY f.level",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut distribution = BTreeMap::new();
        for (level, count) in rows {
            let level = parse_enum(&level, "fatigue level", FatigueLevel::from_str)?;
            distribution.insert(level, u64::try_from(count).unwrap_or(0));
        }
        Ok(distribution)
    }
}

/// Take the session's write lock for the rest of the transaction.
///
/// Issued first so concurrent writers queue on the busy timeout instead of
/// failing on lock upgrade.
pub async fn lock_in(conn: &mut SqliteConnection, id: Uuid) -> DomainResult<()> {
    let result = sqlx::query("UPDATE sessions SET last_activity_at = last_activity_at WHERE id = ?")
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(DomainError::SessionNotFound(id));
    }
    Ok(())
}

pub async fn get_in(conn: &mut SqliteConnection, id: Uuid) -> DomainResult<Option<Session>> {
    let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?");
    let row: Option<SessionRow> = sqlx::query_as(&sql)
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    row.map(TryInto::try_into).transpose()
}

pub async fn update_in(conn: &mut SqliteConnection, session: &Session) -> DomainResult<()> {
    let result = sqlx::query(
        r#"UPDATE sessions SET status = ?, questions_answered = ?, answered_domain_counts = ?, answered_depth_by_domain = ?,
           last_question_energy = ?, previous_question_energy = ?, last_question_id = ?, question_served_at = ?, phase = ?,
           min_safety_level = ?, last_activity_at = ?, paused_until = ?, ended_at = ?
           WHERE id = ?"#,
    )
    .bind(session.status.as_str())
    .bind(i64::from(session.questions_answered))
    .bind(serde_json::to_string(&session.answered_domain_counts)?)
    .bind(serde_json::to_string(&session.answered_depth_by_domain)?)
    .bind(session.last_question_energy.map(|e| e.as_str()))
    .bind(session.previous_question_energy.map(|e| e.as_str()))
    .bind(session.last_question_id.as_ref().map(QuestionId::as_str))
    .bind(session.question_served_at.map(format_timestamp))
    .bind(session.phase.as_str())
    .bind(i64::from(session.min_safety_level))
    .bind(format_timestamp(session.last_activity_at))
    .bind(session.paused_until.map(format_timestamp))
    .bind(session.ended_at.map(format_timestamp))
    .bind(session.id.to_string())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DomainError::SessionNotFound(session.id));
    }
    Ok(())
}

/// Store an answer. Returns `false` if this question was already answered in the session.
pub async fn insert_answer_in(conn: &mut SqliteConnection, answer: &AnswerRecord) -> DomainResult<bool> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO answers (id, session_id, question_id, domain, energy, depth_level, answer_text, response_time_secs, responded_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(answer.id.to_string())
    .bind(answer.session_id.to_string())
    .bind(answer.question_id.as_str())
    .bind(answer.domain.as_str())
    .bind(answer.energy.as_str())
    .bind(i64::from(answer.depth_level))
    .bind(&answer.answer_text)
    .bind(answer.response_time_secs)
    .bind(format_timestamp(answer.responded_at))
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    user_id: String,
    status: String,
    questions_answered: i64,
    answered_domain_counts: Option<String>,
    answered_depth_by_domain: Option<String>,
    last_question_energy: Option<String>,
    previous_question_energy: Option<String>,
    last_question_id: Option<String>,
    question_served_at: Option<String>,
    phase: String,
    min_safety_level: i64,
    started_at: String,
    last_activity_at: String,
    paused_until: Option<String>,
    ended_at: Option<String>,
}

fn parse_energy(s: Option<String>) -> DomainResult<Option<EnergyDynamic>> {
    s.map(|s| parse_enum(&s, "energy", EnergyDynamic::from_str)).transpose()
}

impl TryFrom<SessionRow> for Session {
    type Error = DomainError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Session {
            id: parse_uuid(&row.id)?,
            user_id: row.user_id,
            status: parse_enum(&row.status, "session status", SessionStatus::from_str)?,
            questions_answered: u32::try_from(row.questions_answered).unwrap_or(0),
            answered_domain_counts: parse_json_or_default(row.answered_domain_counts)?,
            answered_depth_by_domain: parse_json_or_default(row.answered_depth_by_domain)?,
            last_question_energy: parse_energy(row.last_question_energy)?,
            previous_question_energy: parse_energy(row.previous_question_energy)?,
            last_question_id: row.last_question_id.map(QuestionId),
            question_served_at: parse_optional_datetime(row.question_served_at)?,
            phase: parse_enum(&row.phase, "phase", Phase::from_str)?,
            min_safety_level: u8::try_from(row.min_safety_level).unwrap_or(u8::MAX),
            started_at: parse_datetime(&row.started_at)?,
            last_activity_at: parse_datetime(&row.last_activity_at)?,
            paused_until: parse_optional_datetime(row.paused_until)?,
            ended_at: parse_optional_datetime(row.ended_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AnswerRow {
    id: String,
    session_id: String,
    question_id: String,
    domain: String,
    energy: String,
    depth_level: i64,
    answer_text: String,
    response_time_secs: f64,
    responded_at: String,
}

impl TryFrom<AnswerRow> for AnswerRecord {
    type Error = DomainError;

    fn try_from(row: AnswerRow) -> Result<Self, Self::Error> {
        Ok(AnswerRecord {
            id: parse_uuid(&row.id)?,
            session_id: parse_uuid(&row.session_id)?,
            question_id: QuestionId(row.question_id),
            domain: parse_enum(&row.domain, "domain", Domain::from_str)?,
            energy: parse_enum(&row.energy, "energy", EnergyDynamic::from_str)?,
            depth_level: u8::try_from(row.depth_level).unwrap_or(0),
            answer_text: row.answer_text,
            response_time_secs: row.response_time_secs,
            responded_at: parse_datetime(&row.responded_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct FatigueRow {
    session_id: String,
    score: f64,
    level: String,
    components: String,
    suggested_action: String,
    computed_at: String,
}

impl TryFrom<FatigueRow> for FatigueSnapshot {
    type Error = DomainError;

    fn try_from(row: FatigueRow) -> Result<Self, Self::Error> {
        let components: FatigueComponents = serde_json::from_str(&row.components)?;
        let suggested_action: SuggestedAction = serde_json::from_str(&row.suggested_action)?;
        Ok(FatigueSnapshot {
            session_id: parse_uuid(&row.session_id)?,
            score: row.score,
            level: parse_enum(&row.level, "fatigue level", FatigueLevel::from_str)?,
            components,
            suggested_action,
            computed_at: parse_datetime(&row.computed_at)?,
        })
    }
}
