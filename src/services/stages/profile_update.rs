use async_trait::async_trait;

use super::{unexpected, StageHandler};
use crate::domain::errors::DomainResult;
use crate::domain::models::{Event, EventPayload, ReadModelMutation, StageEffect, StageName, StageOutcome};

/// The only writer of the profile read model.
#[derive(Debug, Default)]
pub struct ProfileUpdateHandler;

impl ProfileUpdateHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StageHandler for ProfileUpdateHandler {
    fn stage(&self) -> StageName {
        StageName::ProfileUpdate
    }

    async fn handle(&self, event: &Event) -> DomainResult<StageOutcome> {
        let EventPayload::AnswerEmbedded {
            session_id,
            user_id,
            domain,
            traits,
            confidence,
            ..
        } = &event.payload
        else {
            return Ok(unexpected(self.stage(), event));
        };

        let updated = event.derive(
            EventPayload::ProfileUpdated {
                user_id: user_id.clone(),
                session_id: *session_id,
                domain: *domain,
                source_event_id: event.id,
            },
            format!("profile:{}", event.id),
        );

        Ok(StageOutcome::Completed(StageEffect::emit(updated).with_mutation(
            ReadModelMutation::MergeProfile {
                user_id: user_id.clone(),
                source_event_id: event.id,
                domain: *domain,
                traits: traits.clone(),
                confidence: *confidence,
            },
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Domain, QuestionId, TraitScores};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_merge_is_keyed_by_source_event() {
        let session_id = Uuid::new_v4();
        let traits: TraitScores = [("warmth".to_string(), 0.7)].into_iter().collect();
        let event = Event::new(
            EventPayload::AnswerEmbedded {
                session_id,
                user_id: "user-9".to_string(),
                question_id: QuestionId::new("q-2"),
                domain: Domain::Emotions,
                depth_level: 1,
                traits: traits.clone(),
                confidence: 0.9,
                embedding_dimension: 64,
            },
            session_id.to_string(),
            "embedded:y",
        );

        let StageOutcome::Completed(effect) = ProfileUpdateHandler::new().handle(&event).await.unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(
            effect.mutation,
            Some(ReadModelMutation::MergeProfile {
                user_id: "user-9".to_string(),
                source_event_id: event.id,
                domain: Domain::Emotions,
                traits,
                confidence: 0.9,
            })
        );
        assert_eq!(effect.emit[0].idempotency_key, format!("profile:{}", event.id));
    }
}
