//! Retry coordinator: due-time scheduling, single requeue, operator replay.

mod common;

use std::sync::Arc;

use chrono::Utc;

use common::{answer_next, harness, harness_with, sample_questions, test_config, RecordingAlertSink};
use portrait::adapters::oracle::MockReply;
use portrait::adapters::sqlite::{SqliteOutboxRepository, SqliteStageRepository};
use portrait::domain::errors::DomainError;
use portrait::domain::models::{EventId, OutboxStatus, StageName, StageStatus};
use portrait::services::RetryCoordinator;

#[tokio::test]
async fn test_failed_work_waits_for_its_backoff() {
    let mut config = test_config();
    config.retry.base_delay_ms = 5_000;
    config.retry.max_delay_ms = 60_000;
    let h = harness_with(config, sample_questions()).await;
    h.oracle.script([MockReply::Unavailable]).await;
    let session = h.pipeline.sessions.start_session("user-1", None).await.unwrap();
    answer_next(&h, session.id, "retry me later").await;
    h.pipeline.pump_until_idle(10).await.unwrap();

    let now = Utc::now();
    let report = h.pipeline.retry.run_once_at(now).await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.not_due, 1);
    assert_eq!(report.requeued, 0);

    let due = now + chrono::Duration::milliseconds(i64::try_from(h.config.retry.base_delay_ms).unwrap() + 1_000);
    let report = h.pipeline.retry.run_once_at(due).await.unwrap();
    assert_eq!(report.requeued, 1);

    let pending = SqliteOutboxRepository::new(h.pool.clone())
        .list(Some(OutboxStatus::Pending), 10)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].idempotency_key.starts_with("retry:"));
    assert!(pending[0].idempotency_key.ends_with(":analysis:1"));
}

#[tokio::test]
async fn test_two_coordinators_requeue_once() {
    let h = harness().await;
    h.oracle.script([MockReply::Unavailable]).await;
    let session = h.pipeline.sessions.start_session("user-1", None).await.unwrap();
    answer_next(&h, session.id, "only once please").await;
    h.pipeline.pump_until_idle(10).await.unwrap();

    let other = RetryCoordinator::new(h.pool.clone(), &h.config.retry, Arc::new(RecordingAlertSink::default()));
    let later = Utc::now() + chrono::Duration::hours(1);
    let first = h.pipeline.retry.run_once_at(later).await.unwrap();
    let second = other.run_once_at(later).await.unwrap();

    assert_eq!(first.requeued + second.requeued, 1);
    let pending = SqliteOutboxRepository::new(h.pool.clone())
        .count_by_status(OutboxStatus::Pending)
        .await
        .unwrap();
    assert_eq!(pending, 1);
}

#[tokio::test]
async fn test_replay_rejects_non_terminal_and_unknown_records() {
    let h = harness().await;
    let session = h.pipeline.sessions.start_session("user-1", None).await.unwrap();
    let (_, receipt) = answer_next(&h, session.id, "all good").await;
    h.pipeline.pump_until_idle(10).await.unwrap();
    let event_id = EventId(receipt.event_id.unwrap());

    let err = h
        .pipeline
        .retry
        .force_replay(event_id, StageName::Analysis)
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::InvalidStateTransition { .. }), "got {err:?}");

    let err = h
        .pipeline
        .retry
        .force_replay(EventId::new(), StageName::Analysis)
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::StageRecordNotFound { .. }), "got {err:?}");
}

#[tokio::test]
async fn test_replay_all_reopens_every_terminal_failure() {
    let h = harness().await;
    h.oracle.script([MockReply::Invalid, MockReply::Invalid]).await;
    let mut ids = Vec::new();
    for user in ["user-1", "user-2"] {
        let session = h.pipeline.sessions.start_session(user, None).await.unwrap();
        let (_, receipt) = answer_next(&h, session.id, "rejected at first").await;
        ids.push(EventId(receipt.event_id.unwrap()));
    }
    h.pipeline.pump_until_idle(10).await.unwrap();

    let stages = SqliteStageRepository::new(h.pool.clone());
    assert_eq!(stages.terminal_failure_count().await.unwrap(), 2);
    assert_eq!(h.alerts.count().await, 2);

    assert_eq!(h.pipeline.retry.force_replay_all().await.unwrap(), 2);
    h.pipeline.pump_until_idle(10).await.unwrap();

    assert_eq!(stages.terminal_failure_count().await.unwrap(), 0);
    for id in ids {
        let record = stages.get(id, StageName::Analysis).await.unwrap().unwrap();
        assert_eq!(record.status, StageStatus::Success);
    }
}
