//! Common test utilities for integration tests
//!
//! Provides a fully wired pipeline over an in-memory SQLite database, the
//! in-memory transport and the scriptable oracle, plus small fixtures.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use portrait::adapters::corpus::InMemoryQuestionCorpus;
use portrait::adapters::embeddings::HashingEmbeddingProvider;
use portrait::adapters::oracle::MockScoringOracle;
use portrait::adapters::sqlite::create_migrated_test_pool;
use portrait::adapters::transport::InMemoryTransport;
use portrait::domain::models::{Config, Domain, EnergyDynamic, Question, QuestionId};
use portrait::domain::ports::{AlertSink, TerminalFailureAlert};
use portrait::services::{Pipeline, PipelineDeps};

/// Setup test logging
///
/// Call this at the beginning of tests that need logging.
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Configuration with short delays so tests drive time explicitly.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.transport.backend = "memory".to_string();
    config.transport.partitions = 2;
    config.transport.read_batch_size = 32;
    config.relay.batch_size = 100;
    config.relay.initial_backoff_ms = 100;
    config.relay.max_backoff_ms = 400;
    config.retry.max_attempts = 3;
    config.retry.base_delay_ms = 100;
    config.retry.max_delay_ms = 1_000;
    config.circuit_breaker.consecutive_failure_threshold = 3;
    config.circuit_breaker.cooldown_ms = 1_000;
    config.oracle.backend = "mock".to_string();
    config.oracle.timeout_ms = 200;
    config.oracle.requests_per_second = 1_000;
    config.oracle.burst_size = 1_000;
    config.workers.analysis = 1;
    config.workers.embedding = 1;
    config.workers.profile_update = 1;
    config
}

pub fn question(id: &str, domain: Domain, depth_level: u8, energy_dynamic: EnergyDynamic) -> Question {
    Question {
        id: QuestionId::new(id),
        domain,
        text: format!("Question {id}?"),
        depth_level,
        energy_dynamic,
        complexity: 2,
        emotional_weight: 2,
        safety_level: 3,
        trust_requirement: 1,
        connections: vec![],
        active: true,
        flagged: false,
    }
}

/// Two or three questions in every domain with a mix of energies.
pub fn sample_questions() -> Vec<Question> {
    let mut questions = Vec::new();
    for (i, domain) in Domain::ALL.into_iter().enumerate() {
        let slug = domain.as_str().to_ascii_lowercase();
        questions.push(question(&format!("{slug}-1"), domain, 1, EnergyDynamic::Opening));
        questions.push(question(&format!("{slug}-2"), domain, 2, EnergyDynamic::Neutral));
        if i % 2 == 0 {
            questions.push(question(&format!("{slug}-3"), domain, 3, EnergyDynamic::Heavy));
        } else {
            questions.push(question(&format!("{slug}-3"), domain, 2, EnergyDynamic::Healing));
        }
    }
    questions
}

/// Alert sink that remembers what it was told.
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    pub alerts: Mutex<Vec<TerminalFailureAlert>>,
}

impl RecordingAlertSink {
    pub async fn count(&self) -> usize {
        self.alerts.lock().await.len()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn terminal_failure(&self, alert: &TerminalFailureAlert) {
        self.alerts.lock().await.push(alert.clone());
    }
}

/// A wired pipeline plus handles on its test doubles.
pub struct Harness {
    pub pool: SqlitePool,
    pub config: Config,
    pub transport: Arc<InMemoryTransport>,
    pub oracle: Arc<MockScoringOracle>,
    pub alerts: Arc<RecordingAlertSink>,
    pub pipeline: Pipeline,
}

pub async fn harness() -> Harness {
    harness_with(test_config(), sample_questions()).await
}

pub async fn harness_with(config: Config, questions: Vec<Question>) -> Harness {
    let pool = create_migrated_test_pool().await.expect("test pool");
    let transport = Arc::new(InMemoryTransport::new());
    let oracle = Arc::new(MockScoringOracle::new());
    let alerts = Arc::new(RecordingAlertSink::default());

    let pipeline = Pipeline::build(
        &config,
        pool.clone(),
        PipelineDeps {
            transport: transport.clone(),
            oracle: oracle.clone(),
            embedder: Arc::new(HashingEmbeddingProvider::default()),
            corpus: Arc::new(InMemoryQuestionCorpus::new(questions)),
            alerts: alerts.clone(),
        },
    );

    Harness {
        pool,
        config,
        transport,
        oracle,
        alerts,
        pipeline,
    }
}

/// Ask for the next question and answer it. Panics if the session does not
/// offer a question.
pub async fn answer_next(h: &Harness, session_id: uuid::Uuid, text: &str) -> (QuestionId, portrait::services::AnswerReceipt) {
    let turn = h.pipeline.sessions.next_turn(session_id).await.expect("next turn");
    let question_id = match turn {
        portrait::services::Turn::Question { question_id, .. } => question_id,
        other => panic!("expected a question, got {other:?}"),
    };
    let receipt = h
        .pipeline
        .sessions
        .submit_answer(
            session_id,
            portrait::domain::models::AnswerSubmission {
                question_id: question_id.clone(),
                answer_text: text.to_string(),
                responded_at: chrono::Utc::now(),
            },
        )
        .await
        .expect("submit answer");
    (question_id, receipt)
}
