//! Wiring of the whole answer → profile pipeline.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use sqlx::SqlitePool;
use tokio::sync::watch;

use super::circuit_breaker::{sync_override, CircuitBreaker};
use super::fatigue_estimator::FatigueEstimator;
use super::guarded_oracle::GuardedOracle;
use super::health::HealthMonitor;
use super::outbox_relay::OutboxRelay;
use super::question_router::QuestionRouter;
use super::retry_coordinator::{RetryCoordinator, RetryPolicy};
use super::session_service::SessionService;
use super::stage_worker::{StageWorker, StageWorkerConfig};
use super::stages::{AnalysisHandler, EmbeddingHandler, ProfileUpdateHandler, StageHandler};
use crate::adapters::sqlite::{SqliteControlFlags, SqliteOutboxRepository};
use crate::domain::errors::DomainResult;
use crate::domain::models::{Config, StageName};
use crate::domain::ports::{AlertSink, EmbeddingProvider, QuestionCorpus, ScoringOracle, Transport};

/// How often `run` re-reads the persisted breaker override.
const OVERRIDE_SYNC_INTERVAL: Duration = Duration::from_secs(1);
/// How often `run` times out idle sessions.
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// External collaborators the pipeline is built around.
pub struct PipelineDeps {
    pub transport: Arc<dyn Transport>,
    pub oracle: Arc<dyn ScoringOracle>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub corpus: Arc<dyn QuestionCorpus>,
    pub alerts: Arc<dyn AlertSink>,
}

pub struct Pipeline {
    pub breaker: Arc<CircuitBreaker>,
    pub relay: Arc<OutboxRelay>,
    pub workers: Vec<Arc<StageWorker>>,
    pub retry: Arc<RetryCoordinator>,
    pub health: Arc<HealthMonitor>,
    pub sessions: Arc<SessionService>,
    flags: SqliteControlFlags,
    health_interval: Duration,
}

impl Pipeline {
    pub fn build(config: &Config, pool: SqlitePool, deps: PipelineDeps) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
        let guarded = Arc::new(GuardedOracle::new(deps.oracle, breaker.clone(), &config.oracle));

        let relay = Arc::new(OutboxRelay::new(
            SqliteOutboxRepository::new(pool.clone()),
            deps.transport.clone(),
            config.relay.clone(),
            config.transport.partitions,
        ));

        let mut workers = Vec::new();
        for stage in StageName::ALL {
            let (handler, members): (Arc<dyn StageHandler>, usize) = match stage {
                StageName::Analysis => (Arc::new(AnalysisHandler::new(guarded.clone())), config.workers.analysis),
                StageName::Embedding => (
                    Arc::new(EmbeddingHandler::new(deps.embedder.clone())),
                    config.workers.embedding,
                ),
                StageName::ProfileUpdate => (Arc::new(ProfileUpdateHandler::new()), config.workers.profile_update),
            };
            let members = members.max(1);
            for index in 0..members {
                workers.push(Arc::new(StageWorker::new(
                    handler.clone(),
                    deps.transport.clone(),
                    pool.clone(),
                    RetryPolicy::new(&config.retry),
                    deps.alerts.clone(),
                    StageWorkerConfig::for_member(stage, index, members, &config.transport, &config.workers),
                )));
            }
        }

        let retry = Arc::new(RetryCoordinator::new(pool.clone(), &config.retry, deps.alerts));
        let health = Arc::new(HealthMonitor::new(pool.clone(), Some(breaker.clone())));
        let sessions = Arc::new(SessionService::new(
            pool.clone(),
            deps.corpus,
            FatigueEstimator::new(config.fatigue.clone()),
            QuestionRouter::new(config.router.clone()),
            config.session.clone(),
            config.fatigue.window,
        ));

        Self {
            breaker,
            relay,
            workers,
            retry,
            health,
            sessions,
            flags: SqliteControlFlags::new(pool),
            health_interval: Duration::from_secs(config.workers.health_interval_secs.max(1)),
        }
    }

    /// One relay pass followed by one read cycle of every worker, in stage
    /// order. Returns how many records and deliveries moved.
    pub async fn pump(&self) -> DomainResult<usize> {
        let mut moved = self.relay.run_once().await?.published;
        for worker in &self.workers {
            worker.ensure_groups().await?;
            moved += worker.run_cycle().await?;
        }
        Ok(moved)
    }

    /// Pump until a round moves nothing, at most `max_rounds` times.
    pub async fn pump_until_idle(&self, max_rounds: usize) -> DomainResult<usize> {
        let mut total = 0;
        for _ in 0..max_rounds {
            let moved = self.pump().await?;
            if moved == 0 {
                break;
            }
            total += moved;
        }
        Ok(total)
    }

    /// Run every background loop until `shutdown` flips to `true`.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        tracing::info!(workers = self.workers.len(), "pipeline starting");

        let mut loops: Vec<futures::future::BoxFuture<'_, ()>> = vec![
            Box::pin(self.relay.run(shutdown.clone())),
            Box::pin(self.retry.run(shutdown.clone())),
            Box::pin(self.health.run(self.health_interval, shutdown.clone())),
            Box::pin(self.sync_override_loop(shutdown.clone())),
            Box::pin(self.idle_sweep_loop(shutdown.clone())),
        ];
        for worker in &self.workers {
            loops.push(Box::pin(worker.run(shutdown.clone())));
        }
        join_all(loops).await;

        tracing::info!("pipeline stopped");
    }

    async fn sync_override_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = sync_override(&self.flags, &self.breaker).await {
                tracing::warn!(error = %e, "could not read breaker override");
            }
            tokio::select! {
                () = tokio::time::sleep(OVERRIDE_SYNC_INTERVAL) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    async fn idle_sweep_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.sessions.expire_idle_sessions(Utc::now()).await {
                tracing::warn!(error = %e, "idle session sweep failed");
            }
            tokio::select! {
                () = tokio::time::sleep(IDLE_SWEEP_INTERVAL) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
}
