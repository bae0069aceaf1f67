//! Portrait - reliable answer-to-profile pipeline
//!
//! Portrait asks a person adaptive questions, turns every answer into an
//! event and moves it through analysis, embedding and profile update with
//! at-least-once delivery and idempotent, exactly-once effects.
//!
//! # Architecture
//!
//! The crate follows a hexagonal layout:
//!
//! - **Domain Layer** (`domain`): models, error classification and ports
//! - **Adapters** (`adapters`): SQLite storage and streams, in-memory
//!   transport, scoring oracles, embeddings and the question corpus
//! - **Service Layer** (`services`): outbox relay, stage workers, circuit
//!   breaker, retry coordinator, fatigue estimator, question router and
//!   session service
//! - **Infrastructure Layer** (`infrastructure`): configuration and logging
//! - **CLI Layer** (`cli`): the `portrait` command
//!
//! # Example
//!
//! ```ignore
//! use portrait::services::{Pipeline, PipelineDeps};
//!
//! let pipeline = Pipeline::build(&config, pool, deps);
//! let session = pipeline.sessions.start_session("user-1", None).await?;
//! let turn = pipeline.sessions.next_turn(session.id).await?;
//! ```

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use domain::models::{Config, Event, EventPayload, Session, StageName, Topic};
pub use domain::{DomainError, DomainResult, ErrorKind};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{Pipeline, PipelineDeps, SessionService, Turn};
