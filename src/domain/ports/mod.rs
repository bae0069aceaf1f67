//! Port trait definitions (Hexagonal Architecture)
//!
//! This module defines async trait interfaces that adapters must implement:
//! - Transport: consumer-group log the relay publishes to and stages read from
//! - ScoringOracle: remote answer analysis
//! - EmbeddingProvider: answer vectors
//! - QuestionCorpus: read-only question catalog
//! - AlertSink: terminal failure notifications

pub mod alert_sink;
pub mod embedding;
pub mod question_corpus;
pub mod scoring_oracle;
pub mod transport;

pub use alert_sink::{AlertSink, TerminalFailureAlert};
pub use embedding::EmbeddingProvider;
pub use question_corpus::QuestionCorpus;
pub use scoring_oracle::{AnalysisContext, AnalysisResult, ScoringOracle};
pub use transport::{Delivery, MessageId, Transport};
