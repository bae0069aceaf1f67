pub mod config;
pub mod event;
pub mod fatigue;
pub mod outbox;
pub mod profile;
pub mod question;
pub mod session;
pub mod stage;

pub use config::{
    CircuitBreakerConfig, Config, CorpusConfig, DatabaseConfig, FatigueConfig, LoggingConfig,
    OracleConfig, RelayConfig, RetryConfig, RouterConfig, SessionConfig, TransportConfig,
    WorkersConfig,
};
pub use event::{partition_for, Event, EventId, EventPayload, Topic, TraitScores};
pub use fatigue::{AnswerSample, FatigueComponents, FatigueLevel, FatigueSnapshot, SuggestedAction};
pub use outbox::{OutboxRecord, OutboxStatus, RelayReport, RetentionReport};
pub use profile::{Profile, TraitEstimate};
pub use question::{
    Domain, EnergyDynamic, Question, QuestionCatalog, QuestionFilters, QuestionId, QuestionSummary,
};
pub use session::{
    AnswerRecord, AnswerSubmission, Phase, Session, SessionState, SessionStatus,
};
pub use stage::{
    AttemptDecision, ReadModelMutation, StageEffect, StageName, StageOutcome, StageRecord,
    StageStatus,
};
