//! Operator control flags shared between the CLI and a running `serve`.

use chrono::Utc;
use sqlx::SqlitePool;

use super::format_timestamp;
use crate::domain::errors::DomainResult;

#[derive(Clone)]
pub struct SqliteControlFlags {
    pool: SqlitePool,
}

impl SqliteControlFlags {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, name: &str) -> DomainResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM control_flags WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(value,)| value))
    }

    pub async fn set(&self, name: &str, value: &str) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO control_flags (name, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT (name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(name)
        .bind(value)
        .bind(format_timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear(&self, name: &str) -> DomainResult<()> {
        sqlx::query("DELETE FROM control_flags WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
