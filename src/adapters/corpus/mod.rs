//! Question corpus adapters.

pub mod yaml;

pub use yaml::InMemoryQuestionCorpus;
