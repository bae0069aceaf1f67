//! Embedding provider port for answer vectors.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider name (e.g., "hashing").
    fn name(&self) -> &'static str;

    /// Embedding dimension for this provider.
    fn dimension(&self) -> usize;

    /// Generate an embedding for a single text.
    async fn embed(&self, text: &str) -> DomainResult<Vec<f32>>;
}
