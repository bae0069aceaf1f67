//! Embedding provider adapters.

pub mod hashing;

pub use hashing::HashingEmbeddingProvider;
