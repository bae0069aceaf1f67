//! Interview session model and the immutable snapshot handed to the router.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::profile::Profile;
use super::question::{Domain, EnergyDynamic, QuestionId};
use crate::domain::errors::{DomainError, DomainResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Timeout,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Timeout => "timeout",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Completed | Self::Timeout)
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Paused)
                | (Self::Paused, Self::Active)
                | (Self::Active | Self::Paused, Self::Completed | Self::Timeout)
        )
    }
}

/// Routing phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Entry,
    Exploration,
    Deepening,
    Balancing,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entry => "ENTRY",
            Self::Exploration => "EXPLORATION",
            Self::Deepening => "DEEPENING",
            Self::Balancing => "BALANCING",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ENTRY" => Some(Self::Entry),
            "EXPLORATION" => Some(Self::Exploration),
            "DEEPENING" => Some(Self::Deepening),
            "BALANCING" => Some(Self::Balancing),
            _ => None,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistent session aggregate.
///
/// `questions_answered` and `answered_domain_counts` only grow, and only in
/// the same transaction that stores an accepted answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: String,
    pub status: SessionStatus,
    pub questions_answered: u32,
    pub answered_domain_counts: BTreeMap<Domain, u32>,
    pub answered_depth_by_domain: BTreeMap<Domain, u8>,
    /// Energy of the most recent selection.
    pub last_question_energy: Option<EnergyDynamic>,
    /// Energy of the selection before that.
    pub previous_question_energy: Option<EnergyDynamic>,
    pub last_question_id: Option<QuestionId>,
    pub question_served_at: Option<DateTime<Utc>>,
    pub phase: Phase,
    pub min_safety_level: u8,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub paused_until: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(user_id: impl Into<String>, min_safety_level: u8) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            status: SessionStatus::Active,
            questions_answered: 0,
            answered_domain_counts: BTreeMap::new(),
            answered_depth_by_domain: BTreeMap::new(),
            last_question_energy: None,
            previous_question_energy: None,
            last_question_id: None,
            question_served_at: None,
            phase: Phase::Entry,
            min_safety_level,
            started_at: now,
            last_activity_at: now,
            paused_until: None,
            ended_at: None,
        }
    }

    pub fn transition_to(&mut self, next: SessionStatus, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.as_str().to_string(),
                to: next.as_str().to_string(),
                reason: "session lifecycle does not allow this transition".to_string(),
            });
        }
        self.status = next;
        self.last_activity_at = now;
        if next.is_ended() {
            self.ended_at = Some(now);
        }
        if next != SessionStatus::Paused {
            self.paused_until = None;
        }
        Ok(())
    }

    /// Record that `question` was served, shifting the energy history.
    pub fn record_selection(
        &mut self,
        question_id: QuestionId,
        energy: EnergyDynamic,
        phase: Phase,
        now: DateTime<Utc>,
    ) {
        self.previous_question_energy = self.last_question_energy;
        self.last_question_energy = Some(energy);
        self.last_question_id = Some(question_id);
        self.question_served_at = Some(now);
        self.phase = phase;
        self.last_activity_at = now;
    }

    /// Apply an accepted answer to the counters.
    pub fn record_answer(&mut self, domain: Domain, depth_level: u8, now: DateTime<Utc>) {
        self.questions_answered += 1;
        *self.answered_domain_counts.entry(domain).or_insert(0) += 1;
        let depth = self.answered_depth_by_domain.entry(domain).or_insert(0);
        *depth = (*depth).max(depth_level);
        self.last_activity_at = now;
    }

    /// Last two selected energies, oldest first.
    pub fn recent_energies(&self) -> Vec<EnergyDynamic> {
        self.previous_question_energy
            .into_iter()
            .chain(self.last_question_energy)
            .collect()
    }
}

/// A raw answer as received from the front-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerSubmission {
    pub question_id: QuestionId,
    pub answer_text: String,
    pub responded_at: DateTime<Utc>,
}

/// A stored answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub question_id: QuestionId,
    pub domain: Domain,
    pub energy: EnergyDynamic,
    pub depth_level: u8,
    pub answer_text: String,
    /// Seconds between serving the question and the answer arriving.
    pub response_time_secs: f64,
    pub responded_at: DateTime<Utc>,
}

impl AnswerRecord {
    pub fn answer_length(&self) -> usize {
        self.answer_text.chars().count()
    }
}

/// Immutable view of a session given to the router and the fatigue estimator.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub session_id: Uuid,
    pub user_id: String,
    pub questions_answered: u32,
    pub answered_domain_counts: BTreeMap<Domain, u32>,
    pub answered_depth_by_domain: BTreeMap<Domain, u8>,
    /// Last two selected energies, oldest first.
    pub recent_energies: Vec<EnergyDynamic>,
    pub last_question_id: Option<QuestionId>,
    pub answered_ids: HashSet<QuestionId>,
    /// Skipped question ids; the value is whether the user flagged it.
    pub skipped: HashMap<QuestionId, bool>,
    pub min_safety_level: u8,
    /// Profile coverage by domain, if the read model has caught up.
    pub domain_coverage: BTreeMap<Domain, f64>,
}

impl SessionState {
    pub fn snapshot(
        session: &Session,
        answered_ids: HashSet<QuestionId>,
        skipped: HashMap<QuestionId, bool>,
        profile: Option<&Profile>,
    ) -> Self {
        Self {
            session_id: session.id,
            user_id: session.user_id.clone(),
            questions_answered: session.questions_answered,
            answered_domain_counts: session.answered_domain_counts.clone(),
            answered_depth_by_domain: session.answered_depth_by_domain.clone(),
            recent_energies: session.recent_energies(),
            last_question_id: session.last_question_id.clone(),
            answered_ids,
            skipped,
            min_safety_level: session.min_safety_level,
            domain_coverage: profile
                .map(|p| p.domain_coverage.clone())
                .unwrap_or_default(),
        }
    }

    pub fn last_energy(&self) -> Option<EnergyDynamic> {
        self.recent_energies.last().copied()
    }

    pub fn domain_count(&self, domain: Domain) -> u32 {
        self.answered_domain_counts.get(&domain).copied().unwrap_or(0)
    }

    /// Coverage of `domain` in [0, 1]. Falls back to answer counts while the
    /// profile read model lags behind.
    pub fn coverage(&self, domain: Domain) -> f64 {
        let from_counts = f64::from(self.domain_count(domain)) / 10.0;
        self.domain_coverage
            .get(&domain)
            .copied()
            .unwrap_or(0.0)
            .max(from_counts)
            .clamp(0.0, 1.0)
    }

    /// Copy with unflagged skips readmitted to the candidate pool.
    pub fn with_skips_readmitted(&self) -> Self {
        let mut widened = self.clone();
        widened.skipped.retain(|_, flagged| *flagged);
        widened
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_only_grow() {
        let mut session = Session::new("user-1", 2);
        let now = Utc::now();
        session.record_answer(Domain::Identity, 2, now);
        session.record_answer(Domain::Identity, 1, now);
        assert_eq!(session.questions_answered, 2);
        assert_eq!(session.answered_domain_counts[&Domain::Identity], 2);
        assert_eq!(session.answered_depth_by_domain[&Domain::Identity], 2);
    }

    #[test]
    fn test_energy_history_keeps_last_two() {
        let mut session = Session::new("user-1", 2);
        let now = Utc::now();
        session.record_selection(QuestionId::new("a"), EnergyDynamic::Opening, Phase::Entry, now);
        session.record_selection(QuestionId::new("b"), EnergyDynamic::Heavy, Phase::Entry, now);
        session.record_selection(QuestionId::new("c"), EnergyDynamic::Healing, Phase::Entry, now);
        assert_eq!(
            session.recent_energies(),
            vec![EnergyDynamic::Heavy, EnergyDynamic::Healing]
        );
    }

    #[test]
    fn test_ended_sessions_cannot_resume() {
        let mut session = Session::new("user-1", 2);
        session.transition_to(SessionStatus::Completed, Utc::now()).unwrap();
        assert!(session.ended_at.is_some());
        let err = session.transition_to(SessionStatus::Active, Utc::now()).unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_coverage_falls_back_to_counts() {
        let mut session = Session::new("user-1", 2);
        for _ in 0..4 {
            session.record_answer(Domain::Work, 1, Utc::now());
        }
        let state = SessionState::snapshot(&session, HashSet::new(), HashMap::new(), None);
        assert!((state.coverage(Domain::Work) - 0.4).abs() < 1e-9);
        assert_eq!(state.coverage(Domain::Values), 0.0);
    }

    #[test]
    fn test_readmit_keeps_flagged_skips_out() {
        let session = Session::new("user-1", 2);
        let mut skipped = HashMap::new();
        skipped.insert(QuestionId::new("plain"), false);
        skipped.insert(QuestionId::new("flagged"), true);
        let state = SessionState::snapshot(&session, HashSet::new(), skipped, None);
        let widened = state.with_skips_readmitted();
        assert_eq!(widened.skipped.len(), 1);
        assert!(widened.skipped.contains_key(&QuestionId::new("flagged")));
    }
}
