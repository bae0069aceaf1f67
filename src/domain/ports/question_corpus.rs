use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Question, QuestionCatalog, QuestionFilters, QuestionId, QuestionSummary};

/// Read-only access to the question corpus.
#[async_trait]
pub trait QuestionCorpus: Send + Sync {
    async fn search(&self, filters: &QuestionFilters) -> DomainResult<Vec<QuestionSummary>>;

    async fn get(&self, id: &QuestionId) -> DomainResult<Option<Question>>;

    /// Matching questions as a catalog the router can resolve connections through.
    async fn catalog(&self, filters: &QuestionFilters) -> DomainResult<QuestionCatalog>;
}
