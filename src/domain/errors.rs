//! Domain errors for the Portrait pipeline.
//!
//! Every failure that crosses a stage boundary is reduced to an [`ErrorKind`],
//! so retry and breaker policy can be decided over plain data instead of
//! matching on error messages.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Classification of a failure, used by the retry policy and the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport publish/read failed; the transport is expected to recover.
    TransientTransport,
    /// The scoring oracle is down or the breaker is open.
    OracleUnavailable,
    /// The scoring oracle did not answer within the hard timeout.
    OracleTimeout,
    /// The scoring oracle throttled the request.
    RateLimited,
    /// Local storage failed (busy database, lost connection).
    Storage,
    /// The input can never be processed as-is.
    Validation,
    /// The caller is not allowed to perform the call.
    Authorization,
    /// The event was already applied; not a failure.
    Duplicate,
    /// The router found nothing it may ask; a session signal, not a failure.
    NoEligibleCandidate,
    /// Retry budget exhausted.
    Terminal,
}

impl ErrorKind {
    /// Whether work that failed with this kind may be retried automatically.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::TransientTransport
                | Self::OracleUnavailable
                | Self::OracleTimeout
                | Self::RateLimited
                | Self::Storage
        )
    }

    /// Whether a failure of this kind counts against the oracle circuit breaker.
    pub fn affects_breaker(&self) -> bool {
        matches!(
            self,
            Self::OracleUnavailable | Self::OracleTimeout | Self::RateLimited
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientTransport => "transient_transport",
            Self::OracleUnavailable => "oracle_unavailable",
            Self::OracleTimeout => "oracle_timeout",
            Self::RateLimited => "rate_limited",
            Self::Storage => "storage",
            Self::Validation => "validation",
            Self::Authorization => "authorization",
            Self::Duplicate => "duplicate",
            Self::NoEligibleCandidate => "no_eligible_candidate",
            Self::Terminal => "terminal",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "transient_transport" => Some(Self::TransientTransport),
            "oracle_unavailable" => Some(Self::OracleUnavailable),
            "oracle_timeout" => Some(Self::OracleTimeout),
            "rate_limited" => Some(Self::RateLimited),
            "storage" => Some(Self::Storage),
            "validation" => Some(Self::Validation),
            "authorization" => Some(Self::Authorization),
            "duplicate" => Some(Self::Duplicate),
            "no_eligible_candidate" => Some(Self::NoEligibleCandidate),
            "terminal" => Some(Self::Terminal),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain-level errors that can occur in the pipeline.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Transport unavailable: {0}")]
    TransientTransport(String),

    #[error("Scoring oracle unavailable: {0}")]
    OracleUnavailable(String),

    #[error("Scoring oracle timed out after {timeout_ms}ms")]
    OracleTimeout { timeout_ms: u64 },

    #[error("Scoring oracle rate limited the request")]
    RateLimited,

    #[error("Circuit breaker open, retry after {retry_after_ms}ms")]
    CircuitOpen { retry_after_ms: u64 },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Duplicate event: {idempotency_key}")]
    DuplicateEvent { idempotency_key: String },

    #[error("No eligible question for session {session_id} in phase {phase}")]
    NoEligibleCandidate { session_id: Uuid, phase: String },

    #[error("Terminal failure for event {event_id} at stage {stage} after {attempts} attempts")]
    TerminalFailure {
        event_id: Uuid,
        stage: String,
        attempts: u32,
    },

    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Question not found: {0}")]
    QuestionNotFound(String),

    #[error("Stage record not found: {event_id} at {stage}")]
    StageRecordNotFound { event_id: Uuid, stage: String },

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl DomainError {
    /// Reduce the error to its retry/breaker classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientTransport(_) => ErrorKind::TransientTransport,
            Self::OracleUnavailable(_) | Self::CircuitOpen { .. } => ErrorKind::OracleUnavailable,
            Self::OracleTimeout { .. } => ErrorKind::OracleTimeout,
            Self::RateLimited => ErrorKind::RateLimited,
            Self::DatabaseError(_) => ErrorKind::Storage,
            Self::Unauthorized(_) => ErrorKind::Authorization,
            Self::DuplicateEvent { .. } => ErrorKind::Duplicate,
            Self::NoEligibleCandidate { .. } => ErrorKind::NoEligibleCandidate,
            Self::TerminalFailure { .. } => ErrorKind::Terminal,
            Self::ValidationFailed(_)
            | Self::SessionNotFound(_)
            | Self::QuestionNotFound(_)
            | Self::StageRecordNotFound { .. }
            | Self::InvalidStateTransition { .. }
            | Self::SerializationError(_) => ErrorKind::Validation,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind().is_recoverable()
    }
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        DomainError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(DomainError::OracleTimeout { timeout_ms: 10 }.is_recoverable());
        assert!(DomainError::TransientTransport("down".into()).is_recoverable());
        assert!(DomainError::RateLimited.is_recoverable());
        assert!(DomainError::CircuitOpen { retry_after_ms: 5 }.is_recoverable());
        assert!(!DomainError::ValidationFailed("empty".into()).is_recoverable());
        assert!(!DomainError::Unauthorized("key".into()).is_recoverable());
    }

    #[test]
    fn test_breaker_classification() {
        assert!(ErrorKind::OracleTimeout.affects_breaker());
        assert!(ErrorKind::OracleUnavailable.affects_breaker());
        assert!(!ErrorKind::Validation.affects_breaker());
        assert!(!ErrorKind::Storage.affects_breaker());
    }

    #[test]
    fn test_error_kind_string_roundtrip() {
        for kind in [
            ErrorKind::TransientTransport,
            ErrorKind::OracleTimeout,
            ErrorKind::Validation,
            ErrorKind::Terminal,
        ] {
            assert_eq!(ErrorKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(ErrorKind::from_str("bogus"), None);
    }
}
