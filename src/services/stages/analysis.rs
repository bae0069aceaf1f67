use std::sync::Arc;

use async_trait::async_trait;

use super::{unexpected, StageHandler};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Event, EventPayload, StageEffect, StageName, StageOutcome};
use crate::domain::ports::AnalysisContext;
use crate::services::guarded_oracle::GuardedOracle;

/// Scores a raw answer through the guarded oracle.
pub struct AnalysisHandler {
    oracle: Arc<GuardedOracle>,
}

impl AnalysisHandler {
    pub fn new(oracle: Arc<GuardedOracle>) -> Self {
        Self { oracle }
    }
}

#[async_trait]
impl StageHandler for AnalysisHandler {
    fn stage(&self) -> StageName {
        StageName::Analysis
    }

    async fn handle(&self, event: &Event) -> DomainResult<StageOutcome> {
        let EventPayload::AnswerSubmitted {
            session_id,
            user_id,
            question_id,
            domain,
            depth_level,
            answer_text,
            ..
        } = &event.payload
        else {
            return Ok(unexpected(self.stage(), event));
        };

        if answer_text.trim().is_empty() {
            return Err(DomainError::ValidationFailed("answer text is empty".to_string()));
        }

        let context = AnalysisContext {
            session_id: *session_id,
            question_id: question_id.clone(),
            domain: *domain,
            depth_level: *depth_level,
        };
        let result = self.oracle.analyze(answer_text, &context).await?;
        if !(0.0..=1.0).contains(&result.confidence) {
            return Err(DomainError::ValidationFailed(format!(
                "oracle confidence {} outside [0, 1]",
                result.confidence
            )));
        }

        let analyzed = event.derive(
            EventPayload::AnswerAnalyzed {
                session_id: *session_id,
                user_id: user_id.clone(),
                question_id: question_id.clone(),
                domain: *domain,
                depth_level: *depth_level,
                answer_text: answer_text.clone(),
                traits: result.traits,
                confidence: result.confidence,
            },
            format!("analyzed:{}", event.id),
        );
        Ok(StageOutcome::Completed(StageEffect::emit(analyzed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::oracle::{MockReply, MockScoringOracle};
    use crate::domain::models::{CircuitBreakerConfig, Domain, EnergyDynamic, OracleConfig, QuestionId};
    use crate::services::circuit_breaker::CircuitBreaker;
    use chrono::Utc;
    use uuid::Uuid;

    fn handler(mock: Arc<MockScoringOracle>) -> AnalysisHandler {
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
        let config = OracleConfig {
            requests_per_second: 1_000,
            burst_size: 1_000,
            ..OracleConfig::default()
        };
        AnalysisHandler::new(Arc::new(GuardedOracle::new(mock, breaker, &config)))
    }

    fn submitted(text: &str) -> Event {
        let session_id = Uuid::new_v4();
        Event::new(
            EventPayload::AnswerSubmitted {
                session_id,
                user_id: "user-1".to_string(),
                question_id: QuestionId::new("q-1"),
                domain: Domain::Relationships,
                energy: EnergyDynamic::Opening,
                depth_level: 2,
                answer_text: text.to_string(),
                responded_at: Utc::now(),
            },
            session_id.to_string(),
            "answer:1",
        )
    }

    #[tokio::test]
    async fn test_emits_analyzed_event_in_same_trace() {
        let event = submitted("I call my sister every Sunday");
        let outcome = handler(Arc::new(MockScoringOracle::new())).handle(&event).await.unwrap();

        let StageOutcome::Completed(effect) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(effect.emit.len(), 1);
        let analyzed = &effect.emit[0];
        assert_eq!(analyzed.trace_id, event.trace_id);
        assert_eq!(analyzed.causation_id, Some(event.id));
        assert_eq!(analyzed.partition_key, event.partition_key);
        assert!(matches!(
            &analyzed.payload,
            EventPayload::AnswerAnalyzed { domain: Domain::Relationships, depth_level: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_empty_answer_is_validation_error() {
        let mock = Arc::new(MockScoringOracle::new());
        let err = handler(mock.clone()).handle(&submitted("   ")).await.unwrap_err();
        assert!(matches!(err, DomainError::ValidationFailed(_)));
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn test_oracle_outage_is_recoverable() {
        let mock = Arc::new(MockScoringOracle::new());
        mock.script([MockReply::Unavailable]).await;
        let err = handler(mock).handle(&submitted("fine")).await.unwrap_err();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_other_payloads_are_skipped() {
        let event = Event::new(EventPayload::Unknown, "p", "unknown:1");
        let outcome = handler(Arc::new(MockScoringOracle::new())).handle(&event).await.unwrap();
        assert!(matches!(outcome, StageOutcome::Skipped(_)));
    }
}
