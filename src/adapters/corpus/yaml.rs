//! Question corpus held in memory, loaded from a YAML file.
//!
//! ```yaml
//! questions:
//!   - id: identity-001
//!     domain: IDENTITY
//!     text: What three words would a close friend use to describe you?
//!     depth_level: 1
//!     energy_dynamic: OPENING
//!     connections: [identity-002]
//! ```

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Question, QuestionCatalog, QuestionFilters, QuestionId, QuestionSummary};
use crate::domain::ports::QuestionCorpus;

#[derive(Debug, Deserialize)]
struct CorpusFile {
    #[serde(default)]
    questions: Vec<Question>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryQuestionCorpus {
    catalog: QuestionCatalog,
}

impl InMemoryQuestionCorpus {
    pub fn new(questions: Vec<Question>) -> Self {
        Self {
            catalog: QuestionCatalog::new(questions),
        }
    }

    pub fn from_yaml_str(yaml: &str) -> DomainResult<Self> {
        let file: CorpusFile =
            serde_yaml::from_str(yaml).map_err(|e| DomainError::SerializationError(format!("invalid corpus: {e}")))?;
        for question in &file.questions {
            validate(question)?;
        }
        Ok(Self::new(file.questions))
    }

    /// Load the corpus file. A missing file yields an empty corpus.
    pub fn load(path: impl AsRef<Path>) -> DomainResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!(path = %path.display(), "question corpus not found, starting empty");
            return Ok(Self::default());
        }
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| DomainError::ValidationFailed(format!("cannot read {}: {e}", path.display())))?;
        let corpus = Self::from_yaml_str(&yaml)?;
        tracing::info!(path = %path.display(), questions = corpus.catalog.len(), "loaded question corpus");
        Ok(corpus)
    }

    pub fn len(&self) -> usize {
        self.catalog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalog.is_empty()
    }
}

fn validate(question: &Question) -> DomainResult<()> {
    let in_scale = |v: u8| (1..=5).contains(&v);
    if question.text.trim().is_empty() {
        return Err(DomainError::ValidationFailed(format!("question {} has no text", question.id)));
    }
    if !in_scale(question.depth_level) || !in_scale(question.safety_level) || !in_scale(question.complexity) {
        return Err(DomainError::ValidationFailed(format!(
            "question {} has a depth, safety or complexity level outside 1-5",
            question.id
        )));
    }
    Ok(())
}

#[async_trait]
impl QuestionCorpus for InMemoryQuestionCorpus {
    async fn search(&self, filters: &QuestionFilters) -> DomainResult<Vec<QuestionSummary>> {
        Ok(self.catalog.filtered(filters).iter().map(Question::summary).collect())
    }

    async fn get(&self, id: &QuestionId) -> DomainResult<Option<Question>> {
        Ok(self.catalog.get(id).cloned())
    }

    async fn catalog(&self, filters: &QuestionFilters) -> DomainResult<QuestionCatalog> {
        Ok(self.catalog.filtered(filters))
    }
}
