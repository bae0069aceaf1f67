//! SQLite adapters for the Portrait pipeline.
//!
//! Repository functions that must join a caller's transaction take a
//! `&mut SqliteConnection`; pass `&mut *tx` to enlist them.

pub mod connection;
pub mod control_flags;
pub mod migrations;
pub mod outbox_repository;
pub mod profile_repository;
pub mod session_repository;
pub mod stage_repository;
pub mod stream_transport;

pub use connection::{create_pool, create_test_pool, ConnectionError, PoolConfig};
pub use control_flags::SqliteControlFlags;
pub use migrations::{all_embedded_migrations, Migration, MigrationError, Migrator};
pub use outbox_repository::{append_event_in_transaction, SqliteOutboxRepository};
pub use profile_repository::SqliteProfileRepository;
pub use session_repository::SqliteSessionRepository;
pub use stage_repository::SqliteStageRepository;
pub use stream_transport::SqliteTransport;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::DatabaseConfig;

/// Timestamps are stored as fixed-width RFC 3339 so they sort as text.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a UUID string from a SQLite row field.
pub fn parse_uuid(s: &str) -> DomainResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| DomainError::SerializationError(e.to_string()))
}

/// Parse an RFC3339 datetime string from a SQLite row field.
pub fn parse_datetime(s: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map_err(|e| DomainError::SerializationError(e.to_string()))
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse an optional RFC3339 datetime string from a SQLite row field.
pub fn parse_optional_datetime(s: Option<String>) -> DomainResult<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_datetime).transpose()
}

/// Parse a JSON string from a SQLite row field, falling back to the type's default.
pub fn parse_json_or_default<T: serde::de::DeserializeOwned + Default>(s: Option<String>) -> DomainResult<T> {
    s.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| DomainError::SerializationError(e.to_string()))
        .map(Option::unwrap_or_default)
}

/// Parse a stored `as_str` value back into an enum.
pub fn parse_enum<T>(s: &str, what: &str, parse: impl Fn(&str) -> Option<T>) -> DomainResult<T> {
    parse(s).ok_or_else(|| DomainError::SerializationError(format!("invalid {what}: {s}")))
}

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),
}

pub async fn initialize_database(config: &DatabaseConfig) -> Result<SqlitePool, DatabaseError> {
    let pool = create_pool(&config.url(), PoolConfig::from(config)).await?;
    Migrator::new(pool.clone())
        .run_embedded_migrations(all_embedded_migrations())
        .await?;
    Ok(pool)
}

/// Create an in-memory test pool with all migrations applied.
pub async fn create_migrated_test_pool() -> Result<SqlitePool, DatabaseError> {
    let pool = create_test_pool().await?;
    Migrator::new(pool.clone())
        .run_embedded_migrations(all_embedded_migrations())
        .await?;
    Ok(pool)
}
