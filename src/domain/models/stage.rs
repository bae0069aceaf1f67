//! Per-stage processing state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::event::{Event, EventId, Topic, TraitScores};
use super::question::{Domain, QuestionId};
use crate::domain::errors::ErrorKind;

/// A pipeline stage. Each stage consumes exactly one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Analysis,
    Embedding,
    ProfileUpdate,
}

impl StageName {
    pub const ALL: [StageName; 3] = [Self::Analysis, Self::Embedding, Self::ProfileUpdate];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::Embedding => "embedding",
            Self::ProfileUpdate => "profile_update",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "analysis" => Some(Self::Analysis),
            "embedding" => Some(Self::Embedding),
            "profile_update" | "profile-update" => Some(Self::ProfileUpdate),
            _ => None,
        }
    }

    /// Topic this stage reads.
    pub fn consumes(&self) -> Topic {
        match self {
            Self::Analysis => Topic::Answers,
            Self::Embedding => Topic::Analyses,
            Self::ProfileUpdate => Topic::Embeddings,
        }
    }

    /// Consumer group name on the transport.
    pub fn group(&self) -> String {
        format!("stage.{}", self.as_str())
    }

    /// Stages that consume `topic`.
    pub fn consumers_of(topic: Topic) -> Vec<StageName> {
        Self::ALL
            .into_iter()
            .filter(|stage| stage.consumes() == topic)
            .collect()
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Success,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// Processing record for one `(event, stage)` pair.
///
/// Moves pending → success | skipped | failed. A failed record re-enters
/// pending only through the retry coordinator; once `terminal` is set it
/// stays put until an operator replays it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub event_id: EventId,
    pub stage: StageName,
    pub status: StageStatus,
    pub terminal: bool,
    pub retry_count: u32,
    pub error_kind: Option<ErrorKind>,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// The consumed event, kept so failed work can be requeued.
    pub event: Event,
}

impl StageRecord {
    /// No further automatic processing will happen for this record.
    pub fn is_terminal(&self) -> bool {
        self.terminal || matches!(self.status, StageStatus::Success | StageStatus::Skipped)
    }
}

/// What a stage worker should do with a delivered message before running the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptDecision {
    /// Record is pending; run the handler.
    Proceed,
    /// Record already reached a terminal state; ack and move on.
    AlreadyTerminal,
    /// Record failed and awaits the retry coordinator; ack and move on.
    AwaitingRetry,
}

/// A write against the read model, applied atomically with the stage's success.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadModelMutation {
    StoreEmbedding {
        event_id: EventId,
        session_id: Uuid,
        question_id: QuestionId,
        vector: Vec<f32>,
    },
    MergeProfile {
        user_id: String,
        source_event_id: EventId,
        domain: Domain,
        traits: TraitScores,
        confidence: f64,
    },
}

/// Side effects of a successful handler invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageEffect {
    pub emit: Vec<Event>,
    pub mutation: Option<ReadModelMutation>,
}

impl StageEffect {
    pub fn emit(event: Event) -> Self {
        Self {
            emit: vec![event],
            mutation: None,
        }
    }

    pub fn with_mutation(mut self, mutation: ReadModelMutation) -> Self {
        self.mutation = Some(mutation);
        self
    }
}

/// Explicit handler result; failures travel as `Err(DomainError)`.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Completed(StageEffect),
    Skipped(String),
}
