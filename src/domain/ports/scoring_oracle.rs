//! Scoring oracle port.
//!
//! The oracle turns free-text answers into trait scores. It is an opaque
//! remote collaborator; services only reach it through the guarded wrapper.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Domain, QuestionId, TraitScores};

/// What the oracle is told about the answer it scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisContext {
    pub session_id: Uuid,
    pub question_id: QuestionId,
    pub domain: Domain,
    pub depth_level: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub traits: TraitScores,
    pub confidence: f64,
}

#[async_trait]
pub trait ScoringOracle: Send + Sync {
    fn name(&self) -> &'static str;

    /// Score one answer.
    ///
    /// Failures are reported as `OracleTimeout`, `OracleUnavailable`,
    /// `RateLimited`, `Unauthorized` or `ValidationFailed`.
    async fn analyze(&self, text: &str, context: &AnalysisContext) -> DomainResult<AnalysisResult>;
}
