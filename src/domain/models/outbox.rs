use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::Event;

/// Delivery status of an outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Committed, not yet handed to the transport.
    Pending,
    /// Accepted by the transport.
    Published,
    /// Can never be published (the event cannot be encoded for transport).
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Published => "published",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "published" => Some(Self::Published),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// An event waiting in (or already relayed from) the transactional outbox.
///
/// `sequence` is assigned by the store at commit time and defines creation order.
/// `idempotency_key` usually equals the event's own key; requeued stage work
/// reuses the event under a fresh key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub sequence: i64,
    pub event: Event,
    pub idempotency_key: String,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    pub fn is_pending(&self) -> bool {
        self.status == OutboxStatus::Pending
    }
}

/// Result of one relay scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayReport {
    pub scanned: usize,
    pub published: usize,
    pub transient_failures: usize,
    pub failed: usize,
    /// Streams skipped for the rest of the scan after a failure, to keep order.
    pub blocked_streams: usize,
}

impl RelayReport {
    pub fn had_failures(&self) -> bool {
        self.transient_failures > 0
    }
}

/// What one retention pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub outbox_purged: u64,
    pub stream_entries_trimmed: u64,
    pub fatigue_snapshots_pruned: u64,
}
