//! Profile read model and answer embeddings.
//!
//! Only the profile-update and embedding stages write here, and only inside
//! the transaction that marks their stage record successful.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::{format_timestamp, parse_datetime, parse_json_or_default};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Domain, EventId, Profile, QuestionId, TraitScores};

#[derive(Clone)]
pub struct SqliteProfileRepository {
    pool: SqlitePool,
}

impl SqliteProfileRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, user_id: &str) -> DomainResult<Option<Profile>> {
        let mut conn = self.pool.acquire().await?;
        get_in(&mut conn, user_id).await
    }

    /// Stored embedding for an answer event.
    pub async fn embedding(&self, event_id: EventId) -> DomainResult<Option<Vec<f32>>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT vector FROM answer_embeddings WHERE event_id = ?")
            .bind(event_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(vector,)| serde_json::from_str(&vector).map_err(DomainError::from))
            .transpose()
    }

    pub async fn count(&self) -> DomainResult<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM profiles")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

pub async fn get_in(conn: &mut SqliteConnection, user_id: &str) -> DomainResult<Option<Profile>> {
    let row: Option<ProfileRow> = sqlx::query_as(
        "SELECT user_id, domain_coverage, trait_estimates, completeness, last_updated FROM profiles WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(TryInto::try_into).transpose()
}

/// Merge one analyzed answer into the user's profile.
///
/// Guarded by `profile_applied_events`, so applying the same source event
/// twice leaves the profile unchanged. Returns whether the merge happened.
#[allow(clippy::too_many_arguments)]
pub async fn merge_in_transaction(
    tx: &mut SqliteConnection,
    user_id: &str,
    source_event_id: EventId,
    domain: Domain,
    traits: &TraitScores,
    confidence: f64,
    now: DateTime<Utc>,
) -> DomainResult<bool> {
    let guard = sqlx::query(
        "INSERT OR IGNORE INTO profile_applied_events (user_id, event_id, applied_at) VALUES (?, ?, ?)",
    )
    .bind(user_id)
    .bind(source_event_id.to_string())
    .bind(format_timestamp(now))
    .execute(&mut *tx)
    .await?;
    if guard.rows_affected() == 0 {
        return Ok(false);
    }

    let mut profile = get_in(tx, user_id).await?.unwrap_or_else(|| Profile::new(user_id));
    profile.merge(domain, traits, confidence, now);

    sqlx::query(
        r#"INSERT INTO profiles (user_id, domain_coverage, trait_estimates, completeness, last_updated)
           VALUES (?, ?, ?, ?, ?)
           ON CONFLICT (user_id) DO UPDATE SET
               domain_coverage = excluded.domain_coverage,
               trait_estimates = excluded.trait_estimates,
               completeness = excluded.completeness,
               last_updated = excluded.last_updated"#,
    )
    .bind(&profile.user_id)
    .bind(serde_json::to_string(&profile.domain_coverage)?)
    .bind(serde_json::to_string(&profile.trait_estimates)?)
    .bind(profile.completeness)
    .bind(format_timestamp(profile.last_updated))
    .execute(&mut *tx)
    .await?;
    Ok(true)
}

/// Store an answer embedding once; later writes for the same event are ignored.
pub async fn store_embedding_in_transaction(
    tx: &mut SqliteConnection,
    event_id: EventId,
    session_id: Uuid,
    question_id: &QuestionId,
    vector: &[f32],
    now: DateTime<Utc>,
) -> DomainResult<bool> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO answer_embeddings (event_id, session_id, question_id, dimension, vector, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(event_id.to_string())
    .bind(session_id.to_string())
    .bind(question_id.as_str())
    .bind(i64::try_from(vector.len()).unwrap_or(i64::MAX))
    .bind(serde_json::to_string(vector)?)
    .bind(format_timestamp(now))
    .execute(&mut *tx)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[derive(sqlx::FromRow)]
struct ProfileRow {
    user_id: String,
    domain_coverage: Option<String>,
    trait_estimates: Option<String>,
    completeness: f64,
    last_updated: String,
}

impl TryFrom<ProfileRow> for Profile {
    type Error = DomainError;

    fn try_from(row: ProfileRow) -> Result<Self, Self::Error> {
        Ok(Profile {
            user_id: row.user_id,
            domain_coverage: parse_json_or_default(row.domain_coverage)?,
            trait_estimates: parse_json_or_default(row.trait_estimates)?,
            completeness: row.completeness,
            last_updated: parse_datetime(&row.last_updated)?,
        })
    }
}
