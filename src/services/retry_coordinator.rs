//! Retry policy and the coordinator that rehydrates failed stage work.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::watch;

use crate::adapters::sqlite::outbox_repository::append_with_key;
use crate::adapters::sqlite::stage_repository::{self, reopen_terminal_in_transaction, requeue_in_transaction};
use crate::adapters::sqlite::SqliteStageRepository;
use crate::domain::errors::{DomainError, DomainResult, ErrorKind};
use crate::domain::models::{EventId, RetryConfig, StageName, StageRecord};
use crate::domain::ports::{AlertSink, TerminalFailureAlert};

/// Records examined per scan.
const SCAN_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Leave the record failed; the coordinator requeues it once its backoff elapses.
    RetryLater,
    /// Stop retrying and alert.
    Terminal,
}

/// Pure retry decisions over error kinds and retry counts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier.max(1.0),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// `min(base * multiplier^retry_count, cap)`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let cap = self.max_delay.as_millis() as f64;
        if !millis.is_finite() || millis >= cap {
            return self.max_delay;
        }
        Duration::from_millis(millis as u64)
    }

    pub fn decide(&self, kind: ErrorKind, retry_count: u32) -> RetryDecision {
        if !kind.is_recoverable() || retry_count >= self.max_attempts {
            RetryDecision::Terminal
        } else {
            RetryDecision::RetryLater
        }
    }

    /// Whether a failed record's backoff has elapsed at `now`.
    pub fn is_due(&self, record: &StageRecord, now: DateTime<Utc>) -> bool {
        let Some(last) = record.last_attempt_at else {
            return true;
        };
        let wait = chrono::Duration::from_std(self.backoff(record.retry_count)).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(last) >= wait
    }
}

/// Alert sink that logs terminal failures at error level.
#[derive(Debug, Default, Clone)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn terminal_failure(&self, alert: &TerminalFailureAlert) {
        tracing::error!(
            event_id = %alert.event_id,
            stage = %alert.stage,
            trace_id = %alert.trace_id,
            error_kind = %alert.error_kind,
            attempts = alert.attempts,
            last_error = %alert.last_error,
            "stage work failed terminally, operator review required"
        );
    }
}

pub fn alert_for(record: &StageRecord) -> TerminalFailureAlert {
    TerminalFailureAlert {
        event_id: record.event_id,
        stage: record.stage,
        trace_id: record.event.trace_id,
        error_kind: record.error_kind.unwrap_or(ErrorKind::Terminal),
        attempts: record.retry_count + 1,
        last_error: record.last_error.clone().unwrap_or_default(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    pub scanned: usize,
    pub requeued: usize,
    pub terminal: usize,
    pub not_due: usize,
}

pub struct RetryCoordinator {
    pool: SqlitePool,
    stages: SqliteStageRepository,
    policy: RetryPolicy,
    alerts: Arc<dyn AlertSink>,
    scan_interval: Duration,
}

impl RetryCoordinator {
    pub fn new(pool: SqlitePool, config: &RetryConfig, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            stages: SqliteStageRepository::new(pool.clone()),
            pool,
            policy: RetryPolicy::new(config),
            alerts,
            scan_interval: Duration::from_millis(config.scan_interval_ms.max(1)),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Requeue every failed record whose backoff has elapsed at `now`.
    ///
    /// Requeueing moves the record back to pending and appends the consumed
    /// event to the outbox under a retry key, in one transaction. Records that
    /// used up their retries become terminal and are alerted once.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> DomainResult<RetryReport> {
        let candidates = self.stages.retry_candidates(SCAN_LIMIT).await?;
        let mut report = RetryReport {
            scanned: candidates.len(),
            ..RetryReport::default()
        };

        for record in candidates {
            if record.retry_count >= self.policy.max_attempts() {
                if self.stages.mark_terminal(record.event_id, record.stage).await? {
                    report.terminal += 1;
                    self.alerts.terminal_failure(&alert_for(&record)).await;
                }
                continue;
            }
            if !self.policy.is_due(&record, now) {
                report.not_due += 1;
                continue;
            }
            if self.requeue(&record).await? {
                report.requeued += 1;
            }
        }

        if report.requeued > 0 || report.terminal > 0 {
            tracing::info!(
                requeued = report.requeued,
                terminal = report.terminal,
                not_due = report.not_due,
                "retry scan"
            );
        }
        Ok(report)
    }

    async fn requeue(&self, record: &StageRecord) -> DomainResult<bool> {
        let mut tx = self.pool.begin().await?;
        if !requeue_in_transaction(&mut tx, record.event_id, record.stage, record.retry_count).await? {
            // Another coordinator got there first.
            return Ok(false);
        }
        let attempt = record.retry_count + 1;
        let key = format!("retry:{}:{}:{attempt}", record.event_id, record.stage);
        append_with_key(&mut tx, &record.event, &key).await?;
        tx.commit().await?;

        tracing::info!(
            event_id = %record.event_id,
            stage = %record.stage,
            trace_id = %record.event.trace_id,
            attempt,
            "requeued failed stage work"
        );
        Ok(true)
    }

    /// Operator replay of a terminal failure: back to pending, fresh delivery.
    pub async fn force_replay(&self, event_id: EventId, stage: StageName) -> DomainResult<StageRecord> {
        let mut tx = self.pool.begin().await?;
        if !reopen_terminal_in_transaction(&mut tx, event_id, stage).await? {
            return Err(match stage_repository::get_in(&mut tx, event_id, stage).await? {
                Some(record) => DomainError::InvalidStateTransition {
                    from: record.status.as_str().to_string(),
                    to: "pending".to_string(),
                    reason: "only terminal failures can be replayed".to_string(),
                },
                None => DomainError::StageRecordNotFound {
                    event_id: event_id.0,
                    stage: stage.as_str().to_string(),
                },
            });
        }

        let record = stage_repository::get_in(&mut tx, event_id, stage)
            .await?
            .ok_or_else(|| DomainError::StageRecordNotFound {
                event_id: event_id.0,
                stage: stage.as_str().to_string(),
            })?;
        let key = format!("replay:{event_id}:{stage}:{}", record.retry_count);
        append_with_key(&mut tx, &record.event, &key).await?;
        tx.commit().await?;

        tracing::warn!(event_id = %event_id, stage = %stage, "operator replayed terminal failure");
        Ok(record)
    }

    /// Replay every terminal failure, returning how many were reopened.
    pub async fn force_replay_all(&self) -> DomainResult<usize> {
        let terminal = self.stages.list_failures(true, SCAN_LIMIT).await?;
        let mut replayed = 0;
        for record in terminal {
            self.force_replay(record.event_id, record.stage).await?;
            replayed += 1;
        }
        Ok(replayed)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            max_attempts = self.policy.max_attempts(),
            scan_interval_ms = u64::try_from(self.scan_interval.as_millis()).unwrap_or(u64::MAX),
            "retry coordinator started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.run_once_at(Utc::now()).await {
                tracing::error!(error = %e, "retry scan failed");
            }
            tokio::select! {
                () = tokio::time::sleep(self.scan_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!("retry coordinator stopped");
    }
}
