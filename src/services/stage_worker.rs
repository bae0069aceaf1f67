//! Consumer-group worker that drives one stage handler.
//!
//! Per delivery: register the attempt, run the handler, then commit the
//! read-model mutation, the derived events and the stage record's success in
//! one transaction. The message is acknowledged only after that commit (or
//! after the failure is recorded), so a crash in between leads to a
//! redelivery that the stage record turns into a no-op.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::watch;
use tokio::time::Instant;

use super::retry_coordinator::{alert_for, RetryDecision, RetryPolicy};
use super::stages::StageHandler;
use crate::adapters::sqlite::outbox_repository::append_event_in_transaction;
use crate::adapters::sqlite::profile_repository::{merge_in_transaction, store_embedding_in_transaction};
use crate::adapters::sqlite::stage_repository::complete_in_transaction;
use crate::adapters::sqlite::SqliteStageRepository;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    AttemptDecision, Event, ReadModelMutation, StageEffect, StageName, StageOutcome, StageStatus,
    TransportConfig, WorkersConfig,
};
use crate::domain::ports::{AlertSink, Delivery, Transport};

#[derive(Debug, Clone)]
pub struct StageWorkerConfig {
    pub consumer: String,
    /// Partitions this member reads.
    pub partitions: Vec<u32>,
    pub read_batch_size: usize,
    pub poll_interval: Duration,
    pub claim_idle: Duration,
    pub watchdog_interval: Duration,
}

impl StageWorkerConfig {
    /// Config for member `index` of `members`: it owns every partition `p`
    /// with `p % members == index`.
    pub fn for_member(
        stage: StageName,
        index: usize,
        members: usize,
        transport: &TransportConfig,
        workers: &WorkersConfig,
    ) -> Self {
        let members = members.max(1);
        let partitions = (0..transport.partitions.max(1))
            .filter(|p| *p as usize % members == index)
            .collect();
        Self {
            consumer: format!("{}-{index}", stage.as_str()),
            partitions,
            read_batch_size: transport.read_batch_size.max(1),
            poll_interval: transport.poll_interval(),
            claim_idle: transport.claim_idle(),
            watchdog_interval: Duration::from_millis(workers.watchdog_interval_ms.max(1)),
        }
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum DeliveryOutcome {
    Completed,
    Skipped,
    /// Already handled by an earlier delivery; acknowledged without work.
    Duplicate,
    Failed { terminal: bool },
}

pub struct StageWorker {
    handler: Arc<dyn StageHandler>,
    transport: Arc<dyn Transport>,
    pool: SqlitePool,
    stages: SqliteStageRepository,
    policy: RetryPolicy,
    alerts: Arc<dyn AlertSink>,
    config: StageWorkerConfig,
}

impl StageWorker {
    pub fn new(
        handler: Arc<dyn StageHandler>,
        transport: Arc<dyn Transport>,
        pool: SqlitePool,
        policy: RetryPolicy,
        alerts: Arc<dyn AlertSink>,
        config: StageWorkerConfig,
    ) -> Self {
        Self {
            handler,
            transport,
            stages: SqliteStageRepository::new(pool.clone()),
            pool,
            policy,
            alerts,
            config,
        }
    }

    pub fn stage(&self) -> StageName {
        self.handler.stage()
    }

    fn group(&self) -> String {
        self.stage().group()
    }

    fn streams(&self) -> Vec<String> {
        let topic = self.stage().consumes();
        self.config.partitions.iter().map(|p| topic.stream(*p)).collect()
    }

    pub async fn ensure_groups(&self) -> DomainResult<()> {
        let group = self.group();
        for stream in self.streams() {
            self.transport.ensure_group(&stream, &group).await?;
        }
        Ok(())
    }

    /// Read and process one batch from every owned stream. Returns how many
    /// deliveries were handled.
    pub async fn run_cycle(&self) -> DomainResult<usize> {
        let group = self.group();
        let mut handled = 0;
        for stream in self.streams() {
            let batch = self
                .transport
                .read_batch(&stream, &group, &self.config.consumer, self.config.read_batch_size)
                .await?;
            handled += self.process_all(&batch).await;
        }
        Ok(handled)
    }

    /// Take over messages another member left unacknowledged for too long.
    pub async fn reclaim_stale(&self) -> DomainResult<usize> {
        let group = self.group();
        let mut handled = 0;
        for stream in self.streams() {
            let claimed = self
                .transport
                .claim_stale(&stream, &group, &self.config.consumer, self.config.claim_idle)
                .await?;
            if !claimed.is_empty() {
                tracing::warn!(
                    stage = %self.stage(),
                    stream = %stream,
                    consumer = %self.config.consumer,
                    claimed = claimed.len(),
                    "reclaimed stale deliveries"
                );
            }
            handled += self.process_all(&claimed).await;
        }
        Ok(handled)
    }

    async fn process_all(&self, deliveries: &[Delivery]) -> usize {
        let mut handled = 0;
        for delivery in deliveries {
            match self.process(delivery).await {
                Ok(_) => handled += 1,
                Err(e) => tracing::error!(
                    stage = %self.stage(),
                    event_id = %delivery.event.id,
                    message_id = %delivery.id,
                    error = %e,
                    "delivery left unacknowledged"
                ),
            }
        }
        handled
    }

    /// Process one delivery. An `Err` means nothing was recorded and the
    /// message stays pending for the watchdog.
    #[tracing::instrument(
        skip(self, delivery),
        fields(
            stage = %self.stage(),
            event_id = %delivery.event.id,
            trace_id = %delivery.event.trace_id,
            session_id = %delivery.event.partition_key,
        )
    )]
    pub async fn process(&self, delivery: &Delivery) -> DomainResult<DeliveryOutcome> {
        let stage = self.stage();
        let event = &delivery.event;

        let decision = self.stages.begin_attempt(event, stage, Utc::now()).await?;
        if decision != AttemptDecision::Proceed {
            tracing::debug!(?decision, delivery_count = delivery.delivery_count, "duplicate delivery");
            self.ack(delivery).await?;
            return Ok(DeliveryOutcome::Duplicate);
        }

        let result = match self.handler.handle(event).await {
            Ok(StageOutcome::Completed(effect)) => self
                .commit(event, &effect, StageStatus::Success)
                .await
                .map(|done| if done { DeliveryOutcome::Completed } else { DeliveryOutcome::Duplicate }),
            Ok(StageOutcome::Skipped(reason)) => {
                tracing::info!(reason = %reason, "stage skipped event");
                self.commit(event, &StageEffect::default(), StageStatus::Skipped)
                    .await
                    .map(|done| if done { DeliveryOutcome::Skipped } else { DeliveryOutcome::Duplicate })
            }
            Err(e) => Err(e),
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => self.fail(event, &e).await?,
        };
        self.ack(delivery).await?;
        Ok(outcome)
    }

    /// Apply a handler's effect. Returns `false` if another delivery already
    /// closed the record, in which case nothing is written.
    async fn commit(&self, event: &Event, effect: &StageEffect, status: StageStatus) -> DomainResult<bool> {
        let stage = self.stage();
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        match &effect.mutation {
            Some(ReadModelMutation::StoreEmbedding {
                event_id,
                session_id,
                question_id,
                vector,
            }) => {
                store_embedding_in_transaction(&mut tx, *event_id, *session_id, question_id, vector, now).await?;
            }
            Some(ReadModelMutation::MergeProfile {
                user_id,
                source_event_id,
                domain,
                traits,
                confidence,
            }) => {
                let applied =
                    merge_in_transaction(&mut tx, user_id, *source_event_id, *domain, traits, *confidence, now)
                        .await?;
                if !applied {
                    tracing::debug!(user_id = %user_id, "profile already absorbed this event");
                }
            }
            None => {}
        }

        for derived in &effect.emit {
            match append_event_in_transaction(&mut tx, derived).await {
                Ok(_) | Err(DomainError::DuplicateEvent { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        if !complete_in_transaction(&mut tx, event.id, stage, status, now).await? {
            tx.rollback().await?;
            return Ok(false);
        }
        tx.commit().await?;

        tracing::debug!(status = status.as_str(), emitted = effect.emit.len(), "stage committed");
        Ok(true)
    }

    async fn fail(&self, event: &Event, error: &DomainError) -> DomainResult<DeliveryOutcome> {
        let stage = self.stage();
        let kind = error.kind();
        let retry_count = self
            .stages
            .get(event.id, stage)
            .await?
            .map_or(0, |record| record.retry_count);
        let terminal = self.policy.decide(kind, retry_count) == RetryDecision::Terminal;

        let Some(record) = self
            .stages
            .record_failure(event.id, stage, kind, &error.to_string(), terminal, Utc::now())
            .await?
        else {
            tracing::debug!(error_kind = %kind, "record no longer pending, failure dropped");
            return Ok(DeliveryOutcome::Duplicate);
        };

        if terminal {
            self.alerts.terminal_failure(&alert_for(&record)).await;
        } else {
            tracing::warn!(
                error_kind = %kind,
                retry_count,
                retry_in_ms = u64::try_from(self.policy.backoff(retry_count).as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "stage attempt failed, awaiting retry"
            );
        }
        Ok(DeliveryOutcome::Failed { terminal })
    }

    async fn ack(&self, delivery: &Delivery) -> DomainResult<()> {
        self.transport.ack(&delivery.stream, &self.group(), delivery.id).await
    }

    /// Consume until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if self.config.partitions.is_empty() {
            tracing::warn!(
                stage = %self.stage(),
                consumer = %self.config.consumer,
                "worker owns no partitions, idling"
            );
        }
        tracing::info!(
            stage = %self.stage(),
            consumer = %self.config.consumer,
            partitions = ?self.config.partitions,
            "stage worker started"
        );

        let mut groups_ready = false;
        let mut last_watchdog = Instant::now();
        loop {
            if *shutdown.borrow() {
                break;
            }

            if !groups_ready {
                match self.ensure_groups().await {
                    Ok(()) => groups_ready = true,
                    Err(e) => tracing::warn!(stage = %self.stage(), error = %e, "consumer group setup failed"),
                }
            }

            let handled = if groups_ready {
                match self.run_cycle().await {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::warn!(stage = %self.stage(), error = %e, "read failed");
                        0
                    }
                }
            } else {
                0
            };

            if groups_ready && last_watchdog.elapsed() >= self.config.watchdog_interval {
                if let Err(e) = self.reclaim_stale().await {
                    tracing::warn!(stage = %self.stage(), error = %e, "watchdog claim failed");
                }
                last_watchdog = Instant::now();
            }

            if handled == 0 {
                tokio::select! {
                    () = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        tracing::info!(stage = %self.stage(), consumer = %self.config.consumer, "stage worker stopped");
    }
}
