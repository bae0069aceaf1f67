//! In-process consumer-group transport.
//!
//! Same delivery semantics as the SQLite transport, kept in memory. Tests use
//! the availability switch to simulate broker outages.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::Event;
use crate::domain::ports::{Delivery, MessageId, Transport};

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: u64,
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Debug)]
struct Entry {
    event: Event,
    published_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Stream {
    next_id: u64,
    entries: BTreeMap<u64, Entry>,
    groups: HashMap<String, Group>,
}

impl Stream {
    /// Whether every group has delivered and acknowledged `id`.
    fn fully_acked(&self, id: u64) -> bool {
        self.groups
            .values()
            .all(|g| g.last_delivered >= id && !g.pending.contains_key(&id))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTransport {
    streams: Mutex<HashMap<String, Stream>>,
    unavailable: AtomicBool,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with a transient error while unavailable.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Events still held on `stream`, in publish order.
    pub async fn received(&self, stream: &str) -> Vec<Event> {
        let streams = self.streams.lock().await;
        streams
            .get(stream)
            .map(|s| s.entries.values().map(|e| e.event.clone()).collect())
            .unwrap_or_default()
    }

    /// Every event published to any stream whose name starts with `prefix`.
    pub async fn received_with_prefix(&self, prefix: &str) -> Vec<Event> {
        let streams = self.streams.lock().await;
        let mut names: Vec<&String> = streams.keys().filter(|name| name.starts_with(prefix)).collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| streams.get(name))
            .flat_map(|s| s.entries.values().map(|e| e.event.clone()))
            .collect()
    }

    fn check_available(&self) -> DomainResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DomainError::TransientTransport("in-memory transport unavailable".to_string()));
        }
        Ok(())
    }
}

fn unknown_group(stream: &str, group: &str) -> DomainError {
    DomainError::ValidationFailed(format!("unknown group {group} on {stream}"))
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> DomainResult<()> {
        self.check_available()?;
        let mut streams = self.streams.lock().await;
        streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn publish(&self, stream: &str, event: &Event) -> DomainResult<MessageId> {
        self.check_available()?;
        let mut streams = self.streams.lock().await;
        let s = streams.entry(stream.to_string()).or_default();
        s.next_id += 1;
        s.entries.insert(
            s.next_id,
            Entry {
                event: event.clone(),
                published_at: Utc::now(),
            },
        );
        Ok(MessageId(s.next_id))
    }

    async fn read_batch(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max: usize,
    ) -> DomainResult<Vec<Delivery>> {
        self.check_available()?;
        let mut streams = self.streams.lock().await;
        let s = streams.get_mut(stream).ok_or_else(|| unknown_group(stream, group))?;
        let g = s.groups.get_mut(group).ok_or_else(|| unknown_group(stream, group))?;

        let now = Instant::now();
        let mut deliveries = Vec::new();
        for (&id, entry) in s.entries.range(g.last_delivered + 1..).take(max) {
            g.pending.insert(
                id,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
            g.last_delivered = id;
            deliveries.push(Delivery {
                id: MessageId(id),
                stream: stream.to_string(),
                event: entry.event.clone(),
                delivery_count: 1,
            });
        }
        Ok(deliveries)
    }

    async fn ack(&self, stream: &str, group: &str, id: MessageId) -> DomainResult<()> {
        self.check_available()?;
        let mut streams = self.streams.lock().await;
        if let Some(g) = streams.get_mut(stream).and_then(|s| s.groups.get_mut(group)) {
            g.pending.remove(&id.0);
        }
        Ok(())
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> DomainResult<Vec<Delivery>> {
        self.check_available()?;
        let mut streams = self.streams.lock().await;
        let Some(s) = streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Some(g) = s.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let mut deliveries = Vec::new();
        for (id, entry) in &mut g.pending {
            if now.duration_since(entry.delivered_at) < min_idle {
                continue;
            }
            let Some(stored) = s.entries.get(id) else {
                continue;
            };
            entry.consumer = consumer.to_string();
            entry.delivered_at = now;
            entry.delivery_count += 1;
            deliveries.push(Delivery {
                id: MessageId(*id),
                stream: stream.to_string(),
                event: stored.event.clone(),
                delivery_count: entry.delivery_count,
            });
        }
        Ok(deliveries)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> DomainResult<usize> {
        self.check_available()?;
        let streams = self.streams.lock().await;
        Ok(streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len()))
    }

    async fn trim_acknowledged(&self, before: DateTime<Utc>) -> DomainResult<u64> {
        self.check_available()?;
        let mut streams = self.streams.lock().await;
        let mut trimmed = 0;
        for s in streams.values_mut() {
            let done: Vec<u64> = s
                .entries
                .iter()
                .filter(|(id, entry)| entry.published_at < before && s.fully_acked(**id))
                .map(|(id, _)| *id)
                .collect();
            for id in done {
                s.entries.remove(&id);
                trimmed += 1;
            }
        }
        Ok(trimmed)
    }
}
