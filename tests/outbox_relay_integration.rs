//! Outbox relay behavior across transport outages and retention.

mod common;

use std::time::Duration;

use common::{answer_next, harness};
use portrait::adapters::sqlite::{SqliteOutboxRepository, SqliteSessionRepository, SqliteStageRepository};
use portrait::domain::models::{EventId, EventPayload, OutboxStatus, StageName, StageStatus, Topic};

#[tokio::test]
async fn test_outage_loses_nothing_and_drains_in_order() {
    let h = harness().await;
    let relay = &h.pipeline.relay;
    let session = h.pipeline.sessions.start_session("user-1", None).await.unwrap();

    let mut asked = Vec::new();
    for i in 0..5 {
        let (question_id, _) = answer_next(&h, session.id, &format!("answer number {i}")).await;
        asked.push(question_id);
    }

    // Thirty seconds of broker outage, paced by the relay's own backoff.
    h.transport.set_available(false);
    let mut elapsed = Duration::ZERO;
    let mut scans = 0;
    while elapsed < Duration::from_secs(30) {
        let report = relay.run_once().await.unwrap();
        assert_eq!(report.published, 0);
        assert!(report.had_failures());
        elapsed += relay.next_delay(&report).await;
        scans += 1;
    }
    assert!(scans > 1);

    let outbox = SqliteOutboxRepository::new(h.pool.clone());
    assert_eq!(relay.pending_count().await.unwrap(), 5);
    let pending = outbox.fetch_pending(10).await.unwrap();
    assert_eq!(pending.len(), 5);
    assert!(pending.windows(2).all(|w| w[0].sequence < w[1].sequence));
    // Only the head of the stream is attempted; the rest wait behind it.
    assert_eq!(pending[0].attempts, scans);
    assert!(pending[1..].iter().all(|r| r.attempts == 0));

    h.transport.set_available(true);
    let report = relay.run_once().await.unwrap();
    assert_eq!(report.published, 5);
    assert_eq!(relay.pending_count().await.unwrap(), 0);

    let stream = Topic::Answers.stream(pending[0].event.partition(h.config.transport.partitions));
    let delivered: Vec<_> = h
        .transport
        .received(&stream)
        .await
        .into_iter()
        .map(|event| match event.payload {
            EventPayload::AnswerSubmitted { question_id, .. } => question_id,
            other => panic!("unexpected payload {other:?}"),
        })
        .collect();
    assert_eq!(delivered, asked);
}

#[tokio::test]
async fn test_backoff_caps_then_resets() {
    let h = harness().await;
    let relay = &h.pipeline.relay;
    let session = h.pipeline.sessions.start_session("user-1", None).await.unwrap();
    answer_next(&h, session.id, "anything").await;

    h.transport.set_available(false);
    let mut delays = Vec::new();
    for _ in 0..5 {
        let report = relay.run_once().await.unwrap();
        delays.push(relay.next_delay(&report).await);
    }
    assert_eq!(delays[0], Duration::from_millis(100));
    assert_eq!(delays[4], Duration::from_millis(h.config.relay.max_backoff_ms));

    h.transport.set_available(true);
    let report = relay.run_once().await.unwrap();
    assert_eq!(
        relay.next_delay(&report).await,
        Duration::from_millis(h.config.relay.poll_interval_ms)
    );
}

#[tokio::test]
async fn test_purge_waits_for_consumers() {
    let h = harness().await;
    let relay = &h.pipeline.relay;
    let session = h.pipeline.sessions.start_session("user-1", None).await.unwrap();
    answer_next(&h, session.id, "to be purged").await;

    relay.run_once().await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    // Published, but the analysis stage has not seen it yet.
    assert_eq!(relay.purge_published(chrono::Duration::zero()).await.unwrap(), 0);

    h.pipeline.pump_until_idle(10).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let outbox = SqliteOutboxRepository::new(h.pool.clone());
    let published = outbox.count_by_status(OutboxStatus::Published).await.unwrap();
    assert_eq!(published, 4);
    assert_eq!(relay.purge_published(chrono::Duration::zero()).await.unwrap(), 4);
    assert_eq!(outbox.count_by_status(OutboxStatus::Published).await.unwrap(), 0);

    // A long retention keeps everything.
    answer_next(&h, session.id, "kept").await;
    h.pipeline.pump_until_idle(10).await.unwrap();
    assert_eq!(relay.purge_published(chrono::Duration::hours(24)).await.unwrap(), 0);
}

#[tokio::test]
async fn test_retention_pass_trims_streams_and_fatigue_history() {
    let h = harness().await;
    let relay = &h.pipeline.relay;
    let session = h.pipeline.sessions.start_session("user-1", None).await.unwrap();
    answer_next(&h, session.id, "first answer").await;
    answer_next(&h, session.id, "second answer").await;
    h.pipeline.pump_until_idle(10).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = relay.run_retention(chrono::Duration::zero()).await.unwrap();
    assert_eq!(report.outbox_purged, 8);
    assert_eq!(report.stream_entries_trimmed, 8);
    assert!(report.fatigue_snapshots_pruned >= 1);
    assert!(h.transport.received_with_prefix("answers").await.is_empty());

    let sessions = SqliteSessionRepository::new(h.pool.clone());
    assert!(sessions.latest_fatigue(session.id).await.unwrap().is_some());

    // Work published after a full trim is still delivered.
    let (_, receipt) = answer_next(&h, session.id, "after the trim").await;
    h.pipeline.pump_until_idle(10).await.unwrap();
    let record = SqliteStageRepository::new(h.pool.clone())
        .get(EventId(receipt.event_id.unwrap()), StageName::Analysis)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, StageStatus::Success);

    let again = relay.run_retention(chrono::Duration::hours(24)).await.unwrap();
    assert_eq!(again, portrait::domain::models::RetentionReport::default());
}
