//! Transport adapters.

pub mod memory;

pub use memory::InMemoryTransport;

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::adapters::sqlite::SqliteTransport;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::TransportConfig;
use crate::domain::ports::Transport;

/// Build the transport named by `config.backend`.
pub fn create_transport(config: &TransportConfig, pool: &SqlitePool) -> DomainResult<Arc<dyn Transport>> {
    match config.backend.as_str() {
        "sqlite" => Ok(Arc::new(SqliteTransport::new(pool.clone()))),
        "memory" => Ok(Arc::new(InMemoryTransport::new())),
        other => Err(DomainError::ValidationFailed(format!("unknown transport backend: {other}"))),
    }
}
