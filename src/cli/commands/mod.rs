//! CLI command implementations.

pub mod breaker;
pub mod health;
pub mod init;
pub mod outbox;
pub mod serve;
pub mod stage;

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::adapters::sqlite::initialize_database;
use crate::domain::models::Config;

/// Open the configured database, applying any pending migrations.
pub(crate) async fn open_database(config: &Config) -> Result<SqlitePool> {
    initialize_database(&config.database)
        .await
        .with_context(|| format!("Failed to open database at {}", config.database.path))
}
