//! Scoring oracle adapters.

pub mod http;
pub mod mock;

pub use http::HttpScoringOracle;
pub use mock::{MockReply, MockScoringOracle};

use std::sync::Arc;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::OracleConfig;
use crate::domain::ports::ScoringOracle;

/// Build the oracle named by `config.backend`.
pub fn create_oracle(config: &OracleConfig) -> DomainResult<Arc<dyn ScoringOracle>> {
    match config.backend.as_str() {
        "http" => Ok(Arc::new(HttpScoringOracle::new(config)?)),
        "mock" => Ok(Arc::new(MockScoringOracle::new())),
        other => Err(DomainError::ValidationFailed(format!("unknown oracle backend: {other}"))),
    }
}
