//! Session service: the turn loop, answer ingestion and lifecycle.

mod common;

use chrono::Utc;

use common::{answer_next, harness, harness_with, question, test_config};
use portrait::adapters::sqlite::SqliteSessionRepository;
use portrait::domain::errors::DomainError;
use portrait::domain::models::{
    AnswerSubmission, Domain, EnergyDynamic, FatigueLevel, Phase, QuestionId, SessionStatus,
};
use portrait::services::Turn;

#[tokio::test]
async fn test_first_turn_is_an_entry_opener() {
    let h = harness().await;
    let session = h.pipeline.sessions.start_session("user-1", None).await.unwrap();
    assert_eq!(session.min_safety_level, h.config.session.default_min_safety_level);

    match h.pipeline.sessions.next_turn(session.id).await.unwrap() {
        Turn::Question { metadata, .. } => {
            assert_eq!(metadata.phase, Phase::Entry);
            assert_eq!(metadata.depth_level, 1);
            assert_eq!(metadata.energy_dynamic, EnergyDynamic::Opening);
        }
        other => panic!("expected a question, got {other:?}"),
    }

    let stored = h.pipeline.sessions.get(session.id).await.unwrap();
    assert!(stored.last_question_id.is_some());
    assert!(stored.question_served_at.is_some());
}

#[tokio::test]
async fn test_answer_updates_counters() {
    let h = harness().await;
    let session = h.pipeline.sessions.start_session("user-1", None).await.unwrap();
    let (question_id, receipt) = answer_next(&h, session.id, "A considered answer").await;
    assert_eq!(receipt.question_id, question_id);

    let stored = h.pipeline.sessions.get(session.id).await.unwrap();
    assert_eq!(stored.questions_answered, 1);
    assert_eq!(stored.answered_domain_counts.values().sum::<u32>(), 1);
    assert_eq!(stored.answered_depth_by_domain.len(), 1);
}

#[tokio::test]
async fn test_answered_questions_are_never_repeated() {
    let h = harness().await;
    let session = h.pipeline.sessions.start_session("user-1", None).await.unwrap();
    let mut seen = std::collections::HashSet::new();
    for i in 0..12 {
        let (question_id, _) = answer_next(&h, session.id, &format!("answer {i} with enough words")).await;
        assert!(seen.insert(question_id.clone()), "{question_id} asked twice");
    }
}

#[tokio::test]
async fn test_exhausted_pool_readmits_skips_then_ends() {
    let questions = vec![
        question("a", Domain::Work, 1, EnergyDynamic::Opening),
        question("b", Domain::Values, 1, EnergyDynamic::Neutral),
        question("c", Domain::Growth, 1, EnergyDynamic::Opening),
    ];
    let h = harness_with(test_config(), questions).await;
    let sessions = &h.pipeline.sessions;
    let session = sessions.start_session("user-1", None).await.unwrap();

    // Skip one question for now and flag another for good.
    sessions.skip_question(session.id, &QuestionId::new("a"), false).await.unwrap();
    sessions.skip_question(session.id, &QuestionId::new("b"), true).await.unwrap();

    let (first, _) = answer_next(&h, session.id, "the only open question").await;
    assert_eq!(first, QuestionId::new("c"));

    // Pool is empty; the unflagged skip comes back.
    let (second, _) = answer_next(&h, session.id, "answered after all").await;
    assert_eq!(second, QuestionId::new("a"));

    match sessions.next_turn(session.id).await.unwrap() {
        Turn::End { reason } => assert!(reason.contains("no eligible questions")),
        other => panic!("expected the session to end, got {other:?}"),
    }
    let stored = sessions.get(session.id).await.unwrap();
    assert_eq!(stored.status, SessionStatus::Completed);
    assert!(stored.ended_at.is_some());

    // Further turns keep reporting the end.
    assert!(matches!(sessions.next_turn(session.id).await.unwrap(), Turn::End { .. }));
}

#[tokio::test]
async fn test_rising_fatigue_pauses_the_session() {
    let h = harness().await;
    let sessions = &h.pipeline.sessions;
    let session = sessions.start_session("user-1", None).await.unwrap();

    // Slower and shorter with every answer.
    let delays = [5_i64, 20, 60, 150, 300, 600, 900];
    let lengths = [240_usize, 150, 80, 40, 15, 6, 3];
    let mut pause = None;
    for (delay, length) in delays.into_iter().zip(lengths) {
        match sessions.next_turn(session.id).await.unwrap() {
            Turn::Question { question_id, .. } => {
                sessions
                    .submit_answer(
                        session.id,
                        AnswerSubmission {
                            question_id,
                            answer_text: "x".repeat(length),
                            responded_at: Utc::now() + chrono::Duration::seconds(delay),
                        },
                    )
                    .await
                    .unwrap();
            }
            Turn::Pause { minutes, .. } => {
                pause = Some(minutes);
                break;
            }
            Turn::End { reason } => panic!("session ended early: {reason}"),
        }
    }

    let minutes = pause.expect("fatigue never paused the session");
    assert!((h.config.fatigue.min_pause_minutes..=h.config.fatigue.max_pause_minutes).contains(&minutes));

    let stored = sessions.get(session.id).await.unwrap();
    assert_eq!(stored.status, SessionStatus::Paused);
    assert!(stored.paused_until.is_some());

    let latest = SqliteSessionRepository::new(h.pool.clone())
        .latest_fatigue(session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.level, FatigueLevel::High);

    // Still inside the pause.
    assert!(matches!(sessions.next_turn(session.id).await.unwrap(), Turn::Pause { .. }));

    let resumed = sessions.resume(session.id).await.unwrap();
    assert_eq!(resumed.status, SessionStatus::Active);
    assert!(resumed.paused_until.is_none());
}

#[tokio::test]
async fn test_submission_errors() {
    let h = harness().await;
    let sessions = &h.pipeline.sessions;
    let session = sessions.start_session("user-1", None).await.unwrap();

    let submission = |id: &str, text: &str| AnswerSubmission {
        question_id: QuestionId::new(id),
        answer_text: text.to_string(),
        responded_at: Utc::now(),
    };

    let err = sessions.submit_answer(session.id, submission("work-1", "   ")).await.unwrap_err();
    assert!(matches!(err, DomainError::ValidationFailed(_)), "got {err:?}");

    let err = sessions
        .submit_answer(session.id, submission("no-such-question", "hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::QuestionNotFound(_)), "got {err:?}");

    let err = sessions
        .submit_answer(uuid::Uuid::new_v4(), submission("work-1", "hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::SessionNotFound(_)), "got {err:?}");

    sessions.complete(session.id).await.unwrap();
    let err = sessions.submit_answer(session.id, submission("work-1", "too late")).await.unwrap_err();
    assert!(matches!(err, DomainError::InvalidStateTransition { .. }), "got {err:?}");

    let stored = sessions.get(session.id).await.unwrap();
    assert_eq!(stored.questions_answered, 0);
}

#[tokio::test]
async fn test_idle_sessions_time_out() {
    let h = harness().await;
    let sessions = &h.pipeline.sessions;
    let idle = sessions.start_session("user-1", None).await.unwrap();
    let done = sessions.start_session("user-2", None).await.unwrap();
    sessions.complete(done.id).await.unwrap();

    let minutes = i64::try_from(h.config.session.idle_timeout_minutes).unwrap();
    assert_eq!(sessions.expire_idle_sessions(Utc::now()).await.unwrap(), 0);
    let later = Utc::now() + chrono::Duration::minutes(minutes + 1);
    assert_eq!(sessions.expire_idle_sessions(later).await.unwrap(), 1);

    assert_eq!(sessions.get(idle.id).await.unwrap().status, SessionStatus::Timeout);
    assert_eq!(sessions.get(done.id).await.unwrap().status, SessionStatus::Completed);
}

#[tokio::test]
async fn test_concurrent_turns_never_serve_heavy_twice() {
    let mut config = test_config();
    config.router.entry_answers = 0;
    config.router.jitter = 0.0;
    let questions = vec![
        question("heavy-work", Domain::Work, 2, EnergyDynamic::Heavy),
        question("heavy-values", Domain::Values, 2, EnergyDynamic::Heavy),
        question("heavy-growth", Domain::Growth, 2, EnergyDynamic::Heavy),
        question("breather", Domain::Lifestyle, 4, EnergyDynamic::Healing),
    ];
    let h = harness_with(config, questions).await;
    let sessions = &h.pipeline.sessions;
    let session = sessions.start_session("user-1", None).await.unwrap();

    let (first, second) = tokio::join!(sessions.next_turn(session.id), sessions.next_turn(session.id));
    let energies: Vec<EnergyDynamic> = [first.unwrap(), second.unwrap()]
        .into_iter()
        .map(|turn| match turn {
            Turn::Question { metadata, .. } => metadata.energy_dynamic,
            other => panic!("expected a question, got {other:?}"),
        })
        .collect();
    assert_ne!(energies, vec![EnergyDynamic::Heavy, EnergyDynamic::Heavy]);

    let stored = sessions.get(session.id).await.unwrap();
    assert!(
        !(stored.previous_question_energy == Some(EnergyDynamic::Heavy)
            && stored.last_question_energy == Some(EnergyDynamic::Heavy)),
        "stored energies {:?} then {:?}",
        stored.previous_question_energy,
        stored.last_question_energy
    );
}
