//! Scriptable scoring oracle for tests and offline runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::TraitScores;
use crate::domain::ports::{AnalysisContext, AnalysisResult, ScoringOracle};

/// One scripted reaction of the mock oracle.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Answer with the default scores.
    Ok,
    /// Never answer within any sane timeout.
    Hang,
    /// Answer after a delay.
    Delay(Duration),
    Unavailable,
    RateLimited,
    Invalid,
}

/// Oracle that replays a script, then falls back to a default reply.
#[derive(Debug)]
pub struct MockScoringOracle {
    script: Mutex<VecDeque<MockReply>>,
    fallback: Mutex<MockReply>,
    traits: TraitScores,
    confidence: f64,
    calls: AtomicU32,
}

impl Default for MockScoringOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl MockScoringOracle {
    pub fn new() -> Self {
        let traits = [("openness".to_string(), 0.6), ("warmth".to_string(), 0.4)]
            .into_iter()
            .collect();
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(MockReply::Ok),
            traits,
            confidence: 0.8,
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_scores(mut self, traits: TraitScores, confidence: f64) -> Self {
        self.traits = traits;
        self.confidence = confidence;
        self
    }

    /// Queue replies consumed one per call.
    pub async fn script(&self, replies: impl IntoIterator<Item = MockReply>) {
        self.script.lock().await.extend(replies);
    }

    /// Reply used once the script runs out.
    pub async fn set_fallback(&self, reply: MockReply) {
        *self.fallback.lock().await = reply;
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScoringOracle for MockScoringOracle {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn analyze(&self, _text: &str, _context: &AnalysisContext) -> DomainResult<AnalysisResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().await.pop_front();
        let reply = match next {
            Some(reply) => reply,
            None => self.fallback.lock().await.clone(),
        };

        match reply {
            MockReply::Ok => {}
            MockReply::Hang => std::future::pending::<()>().await,
            MockReply::Delay(delay) => tokio::time::sleep(delay).await,
            MockReply::Unavailable => return Err(DomainError::OracleUnavailable("mock oracle down".to_string())),
            MockReply::RateLimited => return Err(DomainError::RateLimited),
            MockReply::Invalid => return Err(DomainError::ValidationFailed("mock oracle rejected input".to_string())),
        }

        Ok(AnalysisResult {
            traits: self.traits.clone(),
            confidence: self.confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Domain, QuestionId};
    use uuid::Uuid;

    fn context() -> AnalysisContext {
        AnalysisContext {
            session_id: Uuid::new_v4(),
            question_id: QuestionId::new("q-1"),
            domain: Domain::Values,
            depth_level: 1,
        }
    }

    #[tokio::test]
    async fn test_script_then_fallback() {
        let oracle = MockScoringOracle::new();
        oracle.script([MockReply::Unavailable]).await;

        assert!(oracle.analyze("x", &context()).await.is_err());
        let result = oracle.analyze("x", &context()).await.unwrap();
        assert!((result.confidence - 0.8).abs() < f64::EPSILON);
        assert_eq!(oracle.calls(), 2);
    }
}
