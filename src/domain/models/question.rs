//! Read-only question catalog model.
//!
//! Questions reference each other through `connections`, which may form
//! cycles. The catalog is an arena: questions live in a `Vec`, an id index
//! maps ids to slots, and connections stay opaque ids resolved on demand.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Opaque question identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuestionId(pub String);

impl QuestionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QuestionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Topical area of a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Domain {
    Identity,
    Relationships,
    Work,
    Values,
    Emotions,
    Growth,
    Lifestyle,
    Beliefs,
}

impl Domain {
    pub const ALL: [Domain; 8] = [
        Self::Identity,
        Self::Relationships,
        Self::Work,
        Self::Values,
        Self::Emotions,
        Self::Growth,
        Self::Lifestyle,
        Self::Beliefs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "IDENTITY",
            Self::Relationships => "RELATIONSHIPS",
            Self::Work => "WORK",
            Self::Values => "VALUES",
            Self::Emotions => "EMOTIONS",
            Self::Growth => "GROWTH",
            Self::Lifestyle => "LIFESTYLE",
            Self::Beliefs => "BELIEFS",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|d| d.as_str().eq_ignore_ascii_case(s))
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emotional intensity of a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnergyDynamic {
    Opening,
    Neutral,
    Processing,
    Heavy,
    Healing,
}

impl EnergyDynamic {
    pub const ALL: [EnergyDynamic; 5] = [
        Self::Opening,
        Self::Neutral,
        Self::Processing,
        Self::Heavy,
        Self::Healing,
    ];

    /// Relative intensity, 0 (restorative) to 4 (heaviest).
    pub fn intensity(&self) -> u8 {
        match self {
            Self::Healing => 0,
            Self::Opening => 1,
            Self::Neutral => 2,
            Self::Processing => 3,
            Self::Heavy => 4,
        }
    }

    /// Weight of this energy in the fatigue estimator's emotional load.
    pub fn emotional_load(&self) -> f64 {
        match self {
            Self::Heavy => 1.0,
            Self::Processing => 0.5,
            _ => 0.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opening => "OPENING",
            Self::Neutral => "NEUTRAL",
            Self::Processing => "PROCESSING",
            Self::Heavy => "HEAVY",
            Self::Healing => "HEALING",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|e| e.as_str().eq_ignore_ascii_case(s))
    }
}

impl std::fmt::Display for EnergyDynamic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A catalog entry. Scales are 1 (lowest) to 5 (highest); a higher
/// `safety_level` means the question is safer to ask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: QuestionId,
    pub domain: Domain,
    pub text: String,
    pub depth_level: u8,
    pub energy_dynamic: EnergyDynamic,
    #[serde(default = "default_scale")]
    pub complexity: u8,
    #[serde(default = "default_scale")]
    pub emotional_weight: u8,
    #[serde(default = "default_safety")]
    pub safety_level: u8,
    #[serde(default = "default_trust")]
    pub trust_requirement: u8,
    #[serde(default)]
    pub connections: Vec<QuestionId>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub flagged: bool,
}

const fn default_scale() -> u8 {
    2
}

const fn default_safety() -> u8 {
    3
}

const fn default_trust() -> u8 {
    1
}

const fn default_true() -> bool {
    true
}

impl Question {
    /// Whether the catalog allows this question to be asked at all.
    pub fn is_askable(&self) -> bool {
        self.active && !self.flagged
    }

    pub fn summary(&self) -> QuestionSummary {
        QuestionSummary {
            id: self.id.clone(),
            domain: self.domain,
            depth_level: self.depth_level,
            energy_dynamic: self.energy_dynamic,
            complexity: self.complexity,
            safety_level: self.safety_level,
            connection_count: self.connections.len(),
        }
    }
}

/// Lightweight search result from the corpus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionSummary {
    pub id: QuestionId,
    pub domain: Domain,
    pub depth_level: u8,
    pub energy_dynamic: EnergyDynamic,
    pub complexity: u8,
    pub safety_level: u8,
    pub connection_count: usize,
}

/// Corpus search filters. Empty lists match everything.
#[derive(Debug, Clone, Default)]
pub struct QuestionFilters {
    pub domains: Vec<Domain>,
    pub energies: Vec<EnergyDynamic>,
    pub max_depth: Option<u8>,
    pub min_safety_level: Option<u8>,
    pub max_complexity: Option<u8>,
    /// Only questions connected to this one.
    pub connected_to: Option<QuestionId>,
    /// Include inactive or flagged entries.
    pub include_unaskable: bool,
}

impl QuestionFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn domains(mut self, domains: Vec<Domain>) -> Self {
        self.domains = domains;
        self
    }

    pub fn energies(mut self, energies: Vec<EnergyDynamic>) -> Self {
        self.energies = energies;
        self
    }

    pub fn max_depth(mut self, depth: u8) -> Self {
        self.max_depth = Some(depth);
        self
    }

    pub fn min_safety_level(mut self, level: u8) -> Self {
        self.min_safety_level = Some(level);
        self
    }

    pub fn connected_to(mut self, id: QuestionId) -> Self {
        self.connected_to = Some(id);
        self
    }

    pub fn matches(&self, question: &Question) -> bool {
        if !self.include_unaskable && !question.is_askable() {
            return false;
        }
        if !self.domains.is_empty() && !self.domains.contains(&question.domain) {
            return false;
        }
        if !self.energies.is_empty() && !self.energies.contains(&question.energy_dynamic) {
            return false;
        }
        if let Some(max) = self.max_depth {
            if question.depth_level > max {
                return false;
            }
        }
        if let Some(min) = self.min_safety_level {
            if question.safety_level < min {
                return false;
            }
        }
        if let Some(max) = self.max_complexity {
            if question.complexity > max {
                return false;
            }
        }
        true
    }
}

/// Arena of questions indexed by id.
#[derive(Debug, Clone, Default)]
pub struct QuestionCatalog {
    questions: Vec<Question>,
    index: HashMap<QuestionId, usize>,
}

impl QuestionCatalog {
    pub fn new(questions: Vec<Question>) -> Self {
        let mut catalog = Self::default();
        for question in questions {
            catalog.insert(question);
        }
        catalog
    }

    /// Insert or replace a question.
    pub fn insert(&mut self, question: Question) {
        if let Some(&slot) = self.index.get(&question.id) {
            self.questions[slot] = question;
        } else {
            self.index.insert(question.id.clone(), self.questions.len());
            self.questions.push(question);
        }
    }

    pub fn get(&self, id: &QuestionId) -> Option<&Question> {
        self.index.get(id).map(|&slot| &self.questions[slot])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Question> {
        self.questions.iter()
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }

    /// Resolve a question's connections. Dangling ids are skipped.
    pub fn connections<'a>(&'a self, id: &QuestionId) -> impl Iterator<Item = &'a Question> + 'a {
        self.get(id)
            .map(|q| q.connections.as_slice())
            .unwrap_or(&[])
            .iter()
            .filter_map(move |cid| self.get(cid))
    }

    /// Whether `to` is a direct connection of `from`.
    pub fn is_connected(&self, from: &QuestionId, to: &QuestionId) -> bool {
        self.get(from)
            .is_some_and(|q| q.connections.iter().any(|c| c == to))
    }

    /// Sub-catalog of questions matching `filters`.
    pub fn filtered(&self, filters: &QuestionFilters) -> QuestionCatalog {
        let connected: Option<Vec<QuestionId>> = filters
            .connected_to
            .as_ref()
            .map(|id| self.connections(id).map(|q| q.id.clone()).collect());
        QuestionCatalog::new(
            self.questions
                .iter()
                .filter(|q| filters.matches(q))
                .filter(|q| connected.as_ref().map_or(true, |ids| ids.contains(&q.id)))
                .cloned()
                .collect(),
        )
    }
}
