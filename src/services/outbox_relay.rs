//! Outbox relay: moves committed outbox records onto the transport.
//!
//! Records are scanned in creation order. The first failure on a stream
//! blocks that stream for the rest of the scan so later records never
//! overtake it; other streams keep flowing. Consecutive failing scans back
//! off exponentially. A crash between publish and `mark_published` causes a
//! duplicate delivery, which the stage workers absorb.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use crate::adapters::sqlite::{SqliteOutboxRepository, SqliteSessionRepository};
use crate::domain::errors::{DomainResult, ErrorKind};
use crate::domain::models::{OutboxStatus, RelayConfig, RelayReport, RetentionReport};
use crate::domain::ports::Transport;

pub struct OutboxRelay {
    outbox: SqliteOutboxRepository,
    sessions: SqliteSessionRepository,
    transport: Arc<dyn Transport>,
    config: RelayConfig,
    partitions: u32,
    backoff: Mutex<ExponentialBackoff>,
}

impl OutboxRelay {
    pub fn new(
        outbox: SqliteOutboxRepository,
        transport: Arc<dyn Transport>,
        config: RelayConfig,
        partitions: u32,
    ) -> Self {
        let backoff = relay_backoff(&config);
        Self {
            sessions: SqliteSessionRepository::new(outbox.pool().clone()),
            outbox,
            transport,
            config,
            partitions: partitions.max(1),
            backoff: Mutex::new(backoff),
        }
    }

    /// Publish one batch of pending records.
    #[tracing::instrument(skip(self), fields(transport = self.transport.name()))]
    pub async fn run_once(&self) -> DomainResult<RelayReport> {
        let pending = self.outbox.fetch_pending(self.config.batch_size).await?;
        let mut report = RelayReport {
            scanned: pending.len(),
            ..RelayReport::default()
        };
        let mut blocked: HashSet<String> = HashSet::new();

        for record in pending {
            let stream = record.event.stream(self.partitions);
            if blocked.contains(&stream) {
                continue;
            }

            match self.transport.publish(&stream, &record.event).await {
                Ok(message_id) => {
                    self.outbox.mark_published(record.sequence, Utc::now()).await?;
                    report.published += 1;
                    tracing::debug!(
                        sequence = record.sequence,
                        event_id = %record.event.id,
                        trace_id = %record.event.trace_id,
                        stream = %stream,
                        message_id = %message_id,
                        "published outbox record"
                    );
                }
                Err(e) if e.kind() == ErrorKind::Validation => {
                    self.outbox.mark_failed(record.sequence, &e.to_string()).await?;
                    report.failed += 1;
                    tracing::error!(
                        sequence = record.sequence,
                        event_id = %record.event.id,
                        error = %e,
                        "outbox record can never be published"
                    );
                }
                Err(e) => {
                    self.outbox.record_attempt_failure(record.sequence, &e.to_string()).await?;
                    report.transient_failures += 1;
                    blocked.insert(stream.clone());
                    tracing::warn!(
                        sequence = record.sequence,
                        event_id = %record.event.id,
                        stream = %stream,
                        attempts = record.attempts + 1,
                        error = %e,
                        "publish failed, record stays pending"
                    );
                }
            }
        }

        report.blocked_streams = blocked.len();
        Ok(report)
    }

    /// Delay before the next scan, given the last scan's outcome.
    pub async fn next_delay(&self, report: &RelayReport) -> Duration {
        let mut backoff = self.backoff.lock().await;
        if report.had_failures() {
            backoff
                .next_backoff()
                .unwrap_or(Duration::from_millis(self.config.max_backoff_ms))
        } else {
            backoff.reset();
            Duration::from_millis(self.config.poll_interval_ms)
        }
    }

    /// Delete published records older than `retention` that every consuming stage has finished.
    pub async fn purge_published(&self, retention: chrono::Duration) -> DomainResult<u64> {
        let purged = self.outbox.purge_published(Utc::now() - retention).await?;
        if purged > 0 {
            tracing::info!(purged, "purged published outbox records");
        }
        Ok(purged)
    }

    /// One retention pass: purge finished outbox records, trim acknowledged
    /// stream entries and prune superseded fatigue snapshots.
    pub async fn run_retention(&self, retention: chrono::Duration) -> DomainResult<RetentionReport> {
        let before = Utc::now() - retention;
        let report = RetentionReport {
            outbox_purged: self.purge_published(retention).await?,
            stream_entries_trimmed: self.transport.trim_acknowledged(before).await?,
            fatigue_snapshots_pruned: self.sessions.prune_fatigue(before).await?,
        };
        if report.stream_entries_trimmed > 0 || report.fatigue_snapshots_pruned > 0 {
            tracing::info!(
                trimmed = report.stream_entries_trimmed,
                pruned = report.fatigue_snapshots_pruned,
                "retention pass"
            );
        }
        Ok(report)
    }

    pub async fn pending_count(&self) -> DomainResult<u64> {
        self.outbox.count_by_status(OutboxStatus::Pending).await
    }

    /// Relay until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval_ms,
            "outbox relay started"
        );
        let purge_every = Duration::from_secs(self.config.purge_interval_secs.max(1));
        let mut last_purge = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.run_once().await {
                Ok(report) => {
                    if report.published > 0 || report.had_failures() {
                        tracing::info!(
                            published = report.published,
                            transient_failures = report.transient_failures,
                            failed = report.failed,
                            blocked_streams = report.blocked_streams,
                            "relay cycle"
                        );
                    }
                    self.next_delay(&report).await
                }
                Err(e) => {
                    tracing::error!(error = %e, "relay cycle failed");
                    self.next_delay(&RelayReport {
                        transient_failures: 1,
                        ..RelayReport::default()
                    })
                    .await
                }
            };

            if last_purge.elapsed() >= purge_every {
                if let Err(e) = self.run_retention(self.config.retention()).await {
                    tracing::warn!(error = %e, "retention pass failed");
                }
                last_purge = Instant::now();
            }

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!("outbox relay stopped");
    }
}

fn relay_backoff(config: &RelayConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(config.initial_backoff_ms.max(1)))
        .with_multiplier(config.backoff_multiplier.max(1.0))
        .with_max_interval(Duration::from_millis(config.max_backoff_ms.max(config.initial_backoff_ms)))
        .with_randomization_factor(0.0)
        .with_max_elapsed_time(None)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{append_event_in_transaction, create_migrated_test_pool};
    use crate::adapters::transport::InMemoryTransport;
    use crate::domain::models::{Domain, EnergyDynamic, Event, EventPayload, QuestionId, Topic};
    use sqlx::SqlitePool;
    use uuid::Uuid;

    fn answer(session_id: Uuid, n: u32) -> Event {
        Event::new(
            EventPayload::AnswerSubmitted {
                session_id,
                user_id: "user-1".to_string(),
                question_id: QuestionId::new(format!("q-{n}")),
                domain: Domain::Values,
                energy: EnergyDynamic::Neutral,
                depth_level: 1,
                answer_text: format!("answer {n}"),
                responded_at: Utc::now(),
            },
            session_id.to_string(),
            format!("answer:{session_id}:{n}"),
        )
    }

    async fn append(pool: &SqlitePool, event: &Event) {
        let mut tx = pool.begin().await.unwrap();
        append_event_in_transaction(&mut tx, event).await.unwrap();
        tx.commit().await.unwrap();
    }

    fn relay(pool: &SqlitePool, transport: Arc<InMemoryTransport>) -> OutboxRelay {
        let config = RelayConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 400,
            backoff_multiplier: 2.0,
            ..RelayConfig::default()
        };
        OutboxRelay::new(SqliteOutboxRepository::new(pool.clone()), transport, config, 1)
    }

    #[tokio::test]
    async fn test_publishes_in_creation_order() {
        let pool = create_migrated_test_pool().await.unwrap();
        let transport = Arc::new(InMemoryTransport::new());
        let session = Uuid::new_v4();
        let events: Vec<Event> = (0..5).map(|n| answer(session, n)).collect();
        for event in &events {
            append(&pool, event).await;
        }

        let report = relay(&pool, transport.clone()).run_once().await.unwrap();
        assert_eq!(report.published, 5);

        let received: Vec<_> = transport
            .received(&Topic::Answers.stream(0))
            .await
            .into_iter()
            .map(|e| e.id)
            .collect();
        let expected: Vec<_> = events.iter().map(|e| e.id).collect();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_outage_keeps_records_pending() {
        let pool = create_migrated_test_pool().await.unwrap();
        let transport = Arc::new(InMemoryTransport::new());
        append(&pool, &answer(Uuid::new_v4(), 1)).await;
        append(&pool, &answer(Uuid::new_v4(), 2)).await;

        transport.set_available(false);
        let relay = relay(&pool, transport.clone());
        let report = relay.run_once().await.unwrap();
        assert_eq!(report.published, 0);
        assert_eq!(report.transient_failures, 1, "stream blocks after the first failure");
        assert_eq!(relay.pending_count().await.unwrap(), 2);

        let outbox = SqliteOutboxRepository::new(pool.clone());
        let records = outbox.fetch_pending(10).await.unwrap();
        assert_eq!(records[0].attempts, 1);
        assert!(records[0].last_error.is_some());
        assert_eq!(records[1].attempts, 0);
    }

    #[tokio::test]
    async fn test_backoff_grows_and_resets() {
        let pool = create_migrated_test_pool().await.unwrap();
        let relay = relay(&pool, Arc::new(InMemoryTransport::new()));
        let failing = RelayReport {
            transient_failures: 1,
            ..RelayReport::default()
        };

        assert_eq!(relay.next_delay(&failing).await, Duration::from_millis(100));
        assert_eq!(relay.next_delay(&failing).await, Duration::from_millis(200));
        assert_eq!(relay.next_delay(&failing).await, Duration::from_millis(400));
        assert_eq!(relay.next_delay(&failing).await, Duration::from_millis(400));

        let poll = relay.next_delay(&RelayReport::default()).await;
        assert_eq!(poll, Duration::from_millis(RelayConfig::default().poll_interval_ms));
        assert_eq!(relay.next_delay(&failing).await, Duration::from_millis(100));
    }
}
