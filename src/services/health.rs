//! Pipeline health: the numbers an operator or a monitoring sink needs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::watch;

use super::circuit_breaker::{BreakerSnapshot, CircuitBreaker};
use crate::adapters::sqlite::{SqliteOutboxRepository, SqliteSessionRepository, SqliteStageRepository};
use crate::domain::errors::DomainResult;
use crate::domain::models::{FatigueLevel, OutboxStatus};

/// Window over which the stage failure rate is computed.
const FAILURE_RATE_WINDOW_MINUTES: i64 = 15;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub pending_count: u64,
    pub failed_outbox: u64,
    /// Share of stage attempts in the last window that failed.
    pub failure_rate: f64,
    pub terminal_failures: u64,
    pub circuit_state: String,
    /// Present when a live breaker is attached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breaker: Option<BreakerSnapshot>,
    pub fatigue_distribution: BTreeMap<FatigueLevel, u64>,
    pub taken_at: DateTime<Utc>,
}

pub struct HealthMonitor {
    outbox: SqliteOutboxRepository,
    stages: SqliteStageRepository,
    sessions: SqliteSessionRepository,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl HealthMonitor {
    pub fn new(pool: SqlitePool, breaker: Option<Arc<CircuitBreaker>>) -> Self {
        Self {
            outbox: SqliteOutboxRepository::new(pool.clone()),
            stages: SqliteStageRepository::new(pool.clone()),
            sessions: SqliteSessionRepository::new(pool),
            breaker,
        }
    }

    pub async fn snapshot(&self) -> DomainResult<HealthSnapshot> {
        let now = Utc::now();
        let breaker = match &self.breaker {
            Some(breaker) => Some(breaker.snapshot().await),
            None => None,
        };
        Ok(HealthSnapshot {
            pending_count: self.outbox.count_by_status(OutboxStatus::Pending).await?,
            failed_outbox: self.outbox.count_by_status(OutboxStatus::Failed).await?,
            failure_rate: self
                .stages
                .failure_rate_since(now - chrono::Duration::minutes(FAILURE_RATE_WINDOW_MINUTES))
                .await?,
            terminal_failures: self.stages.terminal_failure_count().await?,
            circuit_state: breaker
                .as_ref()
                .map_or_else(|| "unknown".to_string(), |b| b.state.as_str().to_string()),
            breaker,
            fatigue_distribution: self.sessions.fatigue_distribution().await?,
            taken_at: now,
        })
    }

    /// Log a snapshot every `interval` until `shutdown` flips to `true`.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.snapshot().await {
                Ok(health) => tracing::info!(
                    pending_count = health.pending_count,
                    failed_outbox = health.failed_outbox,
                    failure_rate = health.failure_rate,
                    terminal_failures = health.terminal_failures,
                    circuit_state = %health.circuit_state,
                    fatigue = ?health.fatigue_distribution,
                    "pipeline health"
                ),
                Err(e) => tracing::warn!(error = %e, "health snapshot failed"),
            }
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;
    use crate::domain::models::CircuitBreakerConfig;

    #[tokio::test]
    async fn test_empty_pipeline_is_healthy() {
        let pool = create_migrated_test_pool().await.unwrap();
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
        let health = HealthMonitor::new(pool, Some(breaker)).snapshot().await.unwrap();

        assert_eq!(health.pending_count, 0);
        assert_eq!(health.terminal_failures, 0);
        assert_eq!(health.failure_rate, 0.0);
        assert_eq!(health.circuit_state, "closed");
        assert!(health.fatigue_distribution.is_empty());
    }

    #[tokio::test]
    async fn test_without_breaker_state_is_unknown() {
        let pool = create_migrated_test_pool().await.unwrap();
        let health = HealthMonitor::new(pool, None).snapshot().await.unwrap();
        assert_eq!(health.circuit_state, "unknown");
        let json = serde_json::to_value(&health).unwrap();
        assert!(json.get("breaker").is_none());
    }
}
