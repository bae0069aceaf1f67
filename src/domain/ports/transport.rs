//! Transport port: an append-only, partitioned log with consumer groups.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::DomainResult;
use crate::domain::models::Event;

/// Position of a message within one stream. Strictly increasing per stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message handed to one consumer of a group.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: MessageId,
    pub stream: String,
    pub event: Event,
    /// How many times this message has been handed out, including this one.
    pub delivery_count: u32,
}

/// Consumer-group log transport.
///
/// Semantics follow the usual stream model: a group tracks the last message
/// it delivered, every delivered message stays in the group's pending list
/// until acknowledged, and pending messages idle for too long may be claimed
/// by another consumer. Delivery is at-least-once.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create `group` on `stream` if missing. New groups start at the
    /// beginning of the stream.
    async fn ensure_group(&self, stream: &str, group: &str) -> DomainResult<()>;

    async fn publish(&self, stream: &str, event: &Event) -> DomainResult<MessageId>;

    /// Deliver up to `max` messages the group has not seen yet, in order.
    async fn read_batch(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max: usize,
    ) -> DomainResult<Vec<Delivery>>;

    async fn ack(&self, stream: &str, group: &str, id: MessageId) -> DomainResult<()>;

    /// Transfer pending messages idle for at least `min_idle` to `consumer`.
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> DomainResult<Vec<Delivery>>;

    /// Delivered but unacknowledged messages of `group`.
    async fn pending_count(&self, stream: &str, group: &str) -> DomainResult<usize>;

    /// Drop messages published before `before` that every group on their
    /// stream has delivered and acknowledged. Message ids are never reused.
    async fn trim_acknowledged(&self, before: DateTime<Utc>) -> DomainResult<u64>;
}
