//! Infrastructure adapters for external systems.

pub mod corpus;
pub mod embeddings;
pub mod oracle;
pub mod sqlite;
pub mod transport;
