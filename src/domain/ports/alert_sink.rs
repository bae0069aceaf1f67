use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::errors::ErrorKind;
use crate::domain::models::{EventId, StageName};

/// Raised once when stage work becomes terminal and needs operator review.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TerminalFailureAlert {
    pub event_id: EventId,
    pub stage: StageName,
    pub trace_id: Uuid,
    pub error_kind: ErrorKind,
    pub attempts: u32,
    pub last_error: String,
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn terminal_failure(&self, alert: &TerminalFailureAlert);
}
