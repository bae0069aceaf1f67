//! Pipeline services: the relay, stage workers, oracle protection, retry,
//! routing and session orchestration.

pub mod circuit_breaker;
pub mod fatigue_estimator;
pub mod guarded_oracle;
pub mod health;
pub mod outbox_relay;
pub mod pipeline;
pub mod question_router;
pub mod retry_coordinator;
pub mod session_service;
pub mod stage_worker;
pub mod stages;

pub use circuit_breaker::{BreakerOverride, BreakerSnapshot, CallPermit, CircuitBreaker, CircuitState};
pub use fatigue_estimator::FatigueEstimator;
pub use guarded_oracle::GuardedOracle;
pub use health::{HealthMonitor, HealthSnapshot};
pub use outbox_relay::OutboxRelay;
pub use pipeline::{Pipeline, PipelineDeps};
pub use question_router::{QuestionRouter, Selection};
pub use retry_coordinator::{RetryCoordinator, RetryDecision, RetryPolicy, RetryReport, TracingAlertSink};
pub use session_service::{AnswerReceipt, QuestionMetadata, SessionService, Turn};
pub use stage_worker::{DeliveryOutcome, StageWorker, StageWorkerConfig};
