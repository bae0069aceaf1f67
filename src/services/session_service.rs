/// Session service: answer ingestion and the turn loop.
///
/// Raw answers are the one write that must never be lost, so
/// `submit_answer` stores the answer, bumps the session counters and appends
/// the `AnswerSubmitted` outbox event in a single transaction and returns any
/// failure to the caller. Everything downstream (scoring, embedding, profile)
/// runs asynchronously and never blocks the next question.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::instrument;
use uuid::Uuid;

use super::fatigue_estimator::{samples_from, FatigueEstimator};
use super::question_router::{QuestionRouter, Selection};
use crate::adapters::sqlite::outbox_repository::append_event_in_transaction;
use crate::adapters::sqlite::session_repository::{get_in, insert_answer_in, lock_in, update_in};
use crate::adapters::sqlite::{SqliteProfileRepository, SqliteSessionRepository};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    AnswerRecord, AnswerSubmission, Domain, EnergyDynamic, Event, EventPayload, FatigueLevel, FatigueSnapshot, Phase,
    QuestionFilters, QuestionId, Session, SessionConfig, SessionState, SessionStatus, SuggestedAction,
};
use crate::domain::ports::QuestionCorpus;

/// Question metadata handed to the front-end.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuestionMetadata {
    pub domain: Domain,
    pub depth_level: u8,
    pub energy_dynamic: EnergyDynamic,
    pub phase: Phase,
}

/// What the front-end should do next.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "turn", rename_all = "snake_case")]
pub enum Turn {
    Question {
        question_id: QuestionId,
        text: String,
        metadata: QuestionMetadata,
    },
    Pause {
        minutes: u32,
        resume_after: DateTime<Utc>,
    },
    End {
        reason: String,
    },
}

/// Result of submitting an answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnswerReceipt {
    pub session_id: Uuid,
    pub question_id: QuestionId,
    /// `None` for a duplicate submission.
    pub event_id: Option<Uuid>,
    pub duplicate: bool,
    pub questions_answered: u32,
}

/// Selection passes `next_turn` makes before giving up on a session that
/// keeps being served concurrently.
const SELECTION_ATTEMPTS: usize = 3;

pub struct SessionService {
    pool: SqlitePool,
    sessions: SqliteSessionRepository,
    profiles: SqliteProfileRepository,
    corpus: Arc<dyn QuestionCorpus>,
    estimator: FatigueEstimator,
    router: QuestionRouter,
    config: SessionConfig,
    fatigue_window: usize,
}

impl SessionService {
    pub fn new(
        pool: SqlitePool,
        corpus: Arc<dyn QuestionCorpus>,
        estimator: FatigueEstimator,
        router: QuestionRouter,
        config: SessionConfig,
        fatigue_window: usize,
    ) -> Self {
        Self {
            sessions: SqliteSessionRepository::new(pool.clone()),
            profiles: SqliteProfileRepository::new(pool.clone()),
            pool,
            corpus,
            estimator,
            router,
            config,
            fatigue_window: fatigue_window.max(1),
        }
    }

    /// Start a session for `user_id`.
    ///
    /// # Arguments
    /// - `min_safety_level`: questions below this safety level are never asked;
    ///   defaults to the configured level
    #[instrument(skip(self))]
    pub async fn start_session(&self, user_id: &str, min_safety_level: Option<u8>) -> DomainResult<Session> {
        if user_id.trim().is_empty() {
            return Err(DomainError::ValidationFailed("user id is empty".to_string()));
        }
        let session = Session::new(
            user_id,
            min_safety_level.unwrap_or(self.config.default_min_safety_level),
        );
        self.sessions.create(&session).await?;
        tracing::info!(session_id = %session.id, user_id, "session started");
        Ok(session)
    }

    pub async fn get(&self, session_id: Uuid) -> DomainResult<Session> {
        self.sessions
            .get(session_id)
            .await?
            .ok_or(DomainError::SessionNotFound(session_id))
    }

    /// Decide the next turn: a question, a pause, or the end of the session.
    ///
    /// # Errors
    /// Returns `SessionNotFound` for unknown sessions and storage errors.
    /// Pool exhaustion is not an error: it ends the session.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn next_turn(&self, session_id: Uuid) -> DomainResult<Turn> {
        for attempt in 1..=SELECTION_ATTEMPTS {
            if let Some(turn) = self.attempt_turn(session_id).await? {
                return Ok(turn);
            }
            tracing::debug!(attempt, "session moved on while selecting, selecting again");
        }
        Err(DomainError::DatabaseError(format!(
            "session {session_id} kept changing during question selection"
        )))
    }

    /// One selection pass. `None` means another turn was served after the
    /// snapshot was taken and nothing was written.
    async fn attempt_turn(&self, session_id: Uuid) -> DomainResult<Option<Turn>> {
        let now = Utc::now();
        let mut session = self.get(session_id).await?;

        if session.status.is_ended() {
            return Ok(Some(Turn::End {
                reason: format!("session is {}", session.status.as_str()),
            }));
        }
        if session.status == SessionStatus::Paused {
            match session.paused_until {
                Some(until) if until > now => {
                    let minutes = (until - now).num_minutes().max(1);
                    return Ok(Some(Turn::Pause {
                        minutes: u32::try_from(minutes).unwrap_or(u32::MAX),
                        resume_after: until,
                    }));
                }
                _ => {
                    session = self.resume(session_id).await?;
                }
            }
        }

        let fatigue = self.assess_fatigue(&session, now).await?;
        if let SuggestedAction::Pause { minutes } = fatigue.suggested_action {
            return self.pause(session_id, minutes, now).await.map(Some);
        }

        let state = SessionState::snapshot(
            &session,
            self.sessions.answered_ids(session_id).await?,
            self.sessions.skips(session_id).await?,
            self.profiles.get(&session.user_id).await?.as_ref(),
        );
        let catalog = self
            .corpus
            .catalog(&QuestionFilters::new().min_safety_level(session.min_safety_level))
            .await?;

        let selection = {
            let mut rng = rand::thread_rng();
            match self.router.select_next(&state, &catalog, &fatigue, &mut rng) {
                Err(DomainError::NoEligibleCandidate { phase, .. }) => {
                    let widened = state.with_skips_readmitted();
                    if widened.skipped.len() < state.skipped.len() {
                        tracing::info!(%phase, "pool exhausted, readmitting skipped questions");
                        self.router.select_next(&widened, &catalog, &fatigue, &mut rng)
                    } else {
                        Err(DomainError::NoEligibleCandidate { session_id, phase })
                    }
                }
                other => other,
            }
        };

        match selection {
            Ok(selection) => self.serve(&session, selection, now).await,
            Err(DomainError::NoEligibleCandidate { phase, .. }) => {
                let reason = format!("no eligible questions remain ({phase})");
                self.finish(session_id, SessionStatus::Completed, now).await?;
                tracing::info!(%reason, "session completed");
                Ok(Some(Turn::End { reason }))
            }
            Err(e) => Err(e),
        }
    }

    async fn assess_fatigue(&self, session: &Session, now: DateTime<Utc>) -> DomainResult<FatigueSnapshot> {
        let answers = self.sessions.recent_answers(session.id, self.fatigue_window).await?;
        let snapshot = self
            .estimator
            .estimate(session.id, &samples_from(&answers), now - session.started_at, now);
        self.sessions.save_fatigue(&snapshot).await?;
        if snapshot.level > FatigueLevel::Low {
            tracing::info!(
                session_id = %session.id,
                score = snapshot.score,
                level = snapshot.level.as_str(),
                "fatigue detected"
            );
        }
        Ok(snapshot)
    }

    /// Record `selection` as served, provided the session still has the turn
    /// `seen` was selected against. Returns `None` without writing otherwise.
    async fn serve(&self, seen: &Session, selection: Selection, now: DateTime<Utc>) -> DomainResult<Option<Turn>> {
        let session_id = seen.id;
        let question = selection.question;
        let mut tx = self.pool.begin().await?;
        lock_in(&mut tx, session_id).await?;
        let mut session = get_in(&mut tx, session_id)
            .await?
            .ok_or(DomainError::SessionNotFound(session_id))?;
        if session.last_question_id != seen.last_question_id
            || session.question_served_at != seen.question_served_at
            || session.status.is_ended()
        {
            tx.rollback().await?;
            return Ok(None);
        }
        session.record_selection(question.id.clone(), question.energy_dynamic, selection.phase, now);
        update_in(&mut tx, &session).await?;
        tx.commit().await?;

        tracing::debug!(
            question_id = %question.id,
            phase = selection.phase.as_str(),
            energy = question.energy_dynamic.as_str(),
            score = selection.score,
            "question served"
        );
        Ok(Some(Turn::Question {
            question_id: question.id,
            text: question.text,
            metadata: QuestionMetadata {
                domain: question.domain,
                depth_level: question.depth_level,
                energy_dynamic: question.energy_dynamic,
                phase: selection.phase,
            },
        }))
    }

    async fn pause(&self, session_id: Uuid, minutes: u32, now: DateTime<Utc>) -> DomainResult<Turn> {
        let resume_after = now + chrono::Duration::minutes(i64::from(minutes));
        let mut tx = self.pool.begin().await?;
        lock_in(&mut tx, session_id).await?;
        let mut session = get_in(&mut tx, session_id)
            .await?
            .ok_or(DomainError::SessionNotFound(session_id))?;
        session.transition_to(SessionStatus::Paused, now)?;
        session.paused_until = Some(resume_after);
        update_in(&mut tx, &session).await?;
        tx.commit().await?;

        tracing::info!(session_id = %session_id, minutes, "session paused for fatigue");
        Ok(Turn::Pause { minutes, resume_after })
    }

    /// Accept an answer.
    ///
    /// # Errors
    /// Any persistence failure is returned; the answer is not stored and no
    /// counter moves. Answering the same question twice is not an error: the
    /// receipt is marked `duplicate`.
    #[instrument(skip(self, submission), fields(session_id = %session_id, question_id = %submission.question_id))]
    pub async fn submit_answer(&self, session_id: Uuid, submission: AnswerSubmission) -> DomainResult<AnswerReceipt> {
        if submission.answer_text.trim().is_empty() {
            return Err(DomainError::ValidationFailed("answer text is empty".to_string()));
        }
        let question = self
            .corpus
            .get(&submission.question_id)
            .await?
            .ok_or_else(|| DomainError::QuestionNotFound(submission.question_id.to_string()))?;

        let mut tx = self.pool.begin().await?;
        lock_in(&mut tx, session_id).await?;
        let mut session = get_in(&mut tx, session_id)
            .await?
            .ok_or(DomainError::SessionNotFound(session_id))?;
        if session.status.is_ended() {
            return Err(DomainError::InvalidStateTransition {
                from: session.status.as_str().to_string(),
                to: "answered".to_string(),
                reason: "session has ended".to_string(),
            });
        }

        let response_time_secs = match (&session.last_question_id, session.question_served_at) {
            (Some(served), Some(at)) if *served == question.id => {
                (submission.responded_at - at).num_milliseconds().max(0) as f64 / 1000.0
            }
            _ => 0.0,
        };
        let answer = AnswerRecord {
            id: Uuid::new_v4(),
            session_id,
            question_id: question.id.clone(),
            domain: question.domain,
            energy: question.energy_dynamic,
            depth_level: question.depth_level,
            answer_text: submission.answer_text.clone(),
            response_time_secs,
            responded_at: submission.responded_at,
        };

        if !insert_answer_in(&mut tx, &answer).await? {
            tx.rollback().await?;
            tracing::info!("duplicate answer ignored");
            return Ok(AnswerReceipt {
                session_id,
                question_id: question.id,
                event_id: None,
                duplicate: true,
                questions_answered: session.questions_answered,
            });
        }

        session.record_answer(question.domain, question.depth_level, Utc::now());
        update_in(&mut tx, &session).await?;

        let event = Event::new(
            EventPayload::AnswerSubmitted {
                session_id,
                user_id: session.user_id.clone(),
                question_id: question.id.clone(),
                domain: question.domain,
                energy: question.energy_dynamic,
                depth_level: question.depth_level,
                answer_text: submission.answer_text,
                responded_at: submission.responded_at,
            },
            session_id.to_string(),
            format!("answer:{session_id}:{}", question.id),
        );
        append_event_in_transaction(&mut tx, &event).await?;
        tx.commit().await?;

        tracing::info!(
            event_id = %event.id,
            trace_id = %event.trace_id,
            questions_answered = session.questions_answered,
            "answer accepted"
        );
        Ok(AnswerReceipt {
            session_id,
            question_id: question.id,
            event_id: Some(event.id.0),
            duplicate: false,
            questions_answered: session.questions_answered,
        })
    }

    /// Record a skip. A flagged skip keeps the question out even when the
    /// pool runs dry.
    #[instrument(skip(self))]
    pub async fn skip_question(&self, session_id: Uuid, question_id: &QuestionId, flagged: bool) -> DomainResult<()> {
        let session = self.get(session_id).await?;
        if session.status.is_ended() {
            return Err(DomainError::InvalidStateTransition {
                from: session.status.as_str().to_string(),
                to: "skipped".to_string(),
                reason: "session has ended".to_string(),
            });
        }
        self.sessions.record_skip(session_id, question_id, flagged, Utc::now()).await
    }

    pub async fn resume(&self, session_id: Uuid) -> DomainResult<Session> {
        self.finish(session_id, SessionStatus::Active, Utc::now()).await
    }

    pub async fn complete(&self, session_id: Uuid) -> DomainResult<Session> {
        self.finish(session_id, SessionStatus::Completed, Utc::now()).await
    }

    /// Move sessions idle longer than the configured timeout to `timeout`.
    pub async fn expire_idle_sessions(&self, now: DateTime<Utc>) -> DomainResult<usize> {
        let idle = self.sessions.idle_since(now - self.config.idle_timeout()).await?;
        let mut expired = 0;
        for session in idle {
            match self.finish(session.id, SessionStatus::Timeout, now).await {
                Ok(_) => expired += 1,
                // Ended concurrently.
                Err(DomainError::InvalidStateTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        if expired > 0 {
            tracing::info!(expired, "expired idle sessions");
        }
        Ok(expired)
    }

    async fn finish(&self, session_id: Uuid, status: SessionStatus, now: DateTime<Utc>) -> DomainResult<Session> {
        let mut tx = self.pool.begin().await?;
        lock_in(&mut tx, session_id).await?;
        let mut session = get_in(&mut tx, session_id)
            .await?
            .ok_or(DomainError::SessionNotFound(session_id))?;
        session.transition_to(status, now)?;
        update_in(&mut tx, &session).await?;
        tx.commit().await?;
        Ok(session)
    }
}
