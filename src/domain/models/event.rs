//! Pipeline event envelope and payloads.
//!
//! Events are immutable once created. Payloads form a closed tagged union on
//! `event_type`; unknown types from newer producers deserialize into
//! [`EventPayload::Unknown`] and unknown fields are ignored, so producers and
//! consumers can evolve independently.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::question::{Domain, EnergyDynamic, QuestionId};

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical topic an event is published to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Raw answers accepted from the front-end.
    Answers,
    /// Oracle analysis results.
    Analyses,
    /// Answers with a stored embedding.
    Embeddings,
    /// Profile read-model changes.
    Profiles,
}

impl Topic {
    pub const ALL: [Topic; 4] = [Self::Answers, Self::Analyses, Self::Embeddings, Self::Profiles];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Answers => "answers",
            Self::Analyses => "analyses",
            Self::Embeddings => "embeddings",
            Self::Profiles => "profiles",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "answers" => Some(Self::Answers),
            "analyses" => Some(Self::Analyses),
            "embeddings" => Some(Self::Embeddings),
            "profiles" => Some(Self::Profiles),
            _ => None,
        }
    }

    /// Name of the transport stream carrying this topic's partition.
    pub fn stream(&self, partition: u32) -> String {
        format!("{}.p{}", self.as_str(), partition)
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a partition key onto one of `partitions` partitions.
///
/// FNV-1a, so every process agrees on the owner of a session.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash % u64::from(partitions.max(1))) as u32
}

/// Trait scores returned by the scoring oracle.
pub type TraitScores = BTreeMap<String, f64>;

/// Event payload, tagged by `event_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A raw answer was durably accepted.
    AnswerSubmitted {
        session_id: Uuid,
        user_id: String,
        question_id: QuestionId,
        domain: Domain,
        energy: EnergyDynamic,
        depth_level: u8,
        answer_text: String,
        responded_at: DateTime<Utc>,
    },
    /// The oracle scored an answer.
    AnswerAnalyzed {
        session_id: Uuid,
        user_id: String,
        question_id: QuestionId,
        domain: Domain,
        depth_level: u8,
        answer_text: String,
        traits: TraitScores,
        confidence: f64,
    },
    /// The answer's embedding was stored.
    AnswerEmbedded {
        session_id: Uuid,
        user_id: String,
        question_id: QuestionId,
        domain: Domain,
        depth_level: u8,
        traits: TraitScores,
        confidence: f64,
        embedding_dimension: usize,
    },
    /// The user's profile absorbed new evidence.
    ProfileUpdated {
        user_id: String,
        session_id: Uuid,
        domain: Domain,
        source_event_id: EventId,
    },
    /// An event type this build does not know.
    #[serde(other)]
    Unknown,
}

impl EventPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AnswerSubmitted { .. } => "answer_submitted",
            Self::AnswerAnalyzed { .. } => "answer_analyzed",
            Self::AnswerEmbedded { .. } => "answer_embedded",
            Self::ProfileUpdated { .. } => "profile_updated",
            Self::Unknown => "unknown",
        }
    }

    /// Topic a payload of this type belongs on.
    pub fn topic(&self) -> Topic {
        match self {
            Self::AnswerSubmitted { .. } | Self::Unknown => Topic::Answers,
            Self::AnswerAnalyzed { .. } => Topic::Analyses,
            Self::AnswerEmbedded { .. } => Topic::Embeddings,
            Self::ProfileUpdated { .. } => Topic::Profiles,
        }
    }
}

/// Immutable event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub topic: Topic,
    /// Session (or user) id; all events of one session share a partition.
    pub partition_key: String,
    pub payload: EventPayload,
    pub occurred_at: DateTime<Utc>,
    pub trace_id: Uuid,
    pub idempotency_key: String,
    /// Event this one was derived from, if any.
    #[serde(default)]
    pub causation_id: Option<EventId>,
}

impl Event {
    /// Create a root event that starts a new trace.
    pub fn new(
        payload: EventPayload,
        partition_key: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            id: EventId::new(),
            topic: payload.topic(),
            partition_key: partition_key.into(),
            payload,
            occurred_at: Utc::now(),
            trace_id: Uuid::new_v4(),
            idempotency_key: idempotency_key.into(),
            causation_id: None,
        }
    }

    /// Create an event caused by this one, inheriting trace and partition.
    pub fn derive(&self, payload: EventPayload, idempotency_key: impl Into<String>) -> Self {
        Self {
            id: EventId::new(),
            topic: payload.topic(),
            partition_key: self.partition_key.clone(),
            payload,
            occurred_at: Utc::now(),
            trace_id: self.trace_id,
            idempotency_key: idempotency_key.into(),
            causation_id: Some(self.id),
        }
    }

    pub fn partition(&self, partitions: u32) -> u32 {
        partition_for(&self.partition_key, partitions)
    }

    pub fn stream(&self, partitions: u32) -> String {
        self.topic.stream(self.partition(partitions))
    }
}
