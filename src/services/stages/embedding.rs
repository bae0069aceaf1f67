use std::sync::Arc;

use async_trait::async_trait;

use super::{unexpected, StageHandler};
use crate::domain::errors::DomainResult;
use crate::domain::models::{Event, EventPayload, ReadModelMutation, StageEffect, StageName, StageOutcome};
use crate::domain::ports::EmbeddingProvider;

/// Embeds analyzed answers and stores the vector alongside the answer.
pub struct EmbeddingHandler {
    provider: Arc<dyn EmbeddingProvider>,
}

impl EmbeddingHandler {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl StageHandler for EmbeddingHandler {
    fn stage(&self) -> StageName {
        StageName::Embedding
    }

    async fn handle(&self, event: &Event) -> DomainResult<StageOutcome> {
        let EventPayload::AnswerAnalyzed {
            session_id,
            user_id,
            question_id,
            domain,
            depth_level,
            answer_text,
            traits,
            confidence,
        } = &event.payload
        else {
            return Ok(unexpected(self.stage(), event));
        };

        let vector = self.provider.embed(answer_text).await?;
        let embedded = event.derive(
            EventPayload::AnswerEmbedded {
                session_id: *session_id,
                user_id: user_id.clone(),
                question_id: question_id.clone(),
                domain: *domain,
                depth_level: *depth_level,
                traits: traits.clone(),
                confidence: *confidence,
                embedding_dimension: vector.len(),
            },
            format!("embedded:{}", event.id),
        );

        Ok(StageOutcome::Completed(StageEffect::emit(embedded).with_mutation(
            ReadModelMutation::StoreEmbedding {
                event_id: event.id,
                session_id: *session_id,
                question_id: question_id.clone(),
                vector,
            },
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::embeddings::HashingEmbeddingProvider;
    use crate::domain::models::{Domain, QuestionId, TraitScores};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_stores_vector_and_emits_embedded() {
        let handler = EmbeddingHandler::new(Arc::new(HashingEmbeddingProvider::new(16)));
        let session_id = Uuid::new_v4();
        let event = Event::new(
            EventPayload::AnswerAnalyzed {
                session_id,
                user_id: "user-1".to_string(),
                question_id: QuestionId::new("q-7"),
                domain: Domain::Growth,
                depth_level: 3,
                answer_text: "learning to slow down".to_string(),
                traits: TraitScores::new(),
                confidence: 0.5,
            },
            session_id.to_string(),
            "analyzed:x",
        );

        let StageOutcome::Completed(effect) = handler.handle(&event).await.unwrap() else {
            panic!("expected completion");
        };
        let Some(ReadModelMutation::StoreEmbedding { event_id, vector, .. }) = &effect.mutation else {
            panic!("expected embedding mutation");
        };
        assert_eq!(*event_id, event.id);
        assert_eq!(vector.len(), 16);
        assert!(matches!(
            effect.emit[0].payload,
            EventPayload::AnswerEmbedded { embedding_dimension: 16, .. }
        ));
    }
}
