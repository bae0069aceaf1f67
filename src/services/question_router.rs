//! Next-question selection.
//!
//! A pure function of the session snapshot, the catalog and the latest
//! fatigue snapshot. Hard constraints are applied as a pre-filter and can
//! never be outweighed by scoring:
//! - never two HEAVY questions in a row, and no HEAVY at all while balancing
//! - nothing deeper than level 2, HEAVY or PROCESSING during entry
//! - nothing below the session's minimum safety level
//! - nothing inactive, flagged, answered or skipped
//!
//! Scoring then prefers uncovered domains, gentle energy transitions and
//! questions that fit the current phase. Jitter only breaks near-ties.

use rand::Rng;
use serde::Serialize;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    EnergyDynamic, FatigueLevel, FatigueSnapshot, Phase, Question, QuestionCatalog, RouterConfig, SessionState,
};

const HEALING_AFTER_HEAVY_BONUS: f64 = 0.3;
const ESCALATION_PENALTY_PER_STEP: f64 = 0.15;
const REPEAT_ENERGY_PENALTY: f64 = 0.2;
const ENERGY_TERM_MIN: f64 = -0.8;
const ENERGY_TERM_MAX: f64 = 0.3;
const PHASE_BONUS: f64 = 0.2;
const CONNECTION_BONUS: f64 = 0.15;
const TRUST_PENALTY_PER_LEVEL: f64 = 0.05;
/// Deepest question entry may fall back to once the openers run out.
const ENTRY_MAX_DEPTH: u8 = 2;
/// Answers that earn one level of trust.
const ANSWERS_PER_TRUST_LEVEL: u32 = 5;

/// A routing decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Selection {
    pub question: Question,
    pub phase: Phase,
    pub score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct QuestionRouter {
    config: RouterConfig,
}

impl QuestionRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    /// Phase the session is in given its progress and fatigue.
    pub fn derive_phase(&self, state: &SessionState, fatigue: &FatigueSnapshot) -> Phase {
        if fatigue.level >= FatigueLevel::Medium {
            return Phase::Balancing;
        }
        if state.questions_answered < self.config.entry_answers {
            return Phase::Entry;
        }
        let best_coverage = state
            .answered_domain_counts
            .keys()
            .chain(state.domain_coverage.keys())
            .map(|d| state.coverage(*d))
            .fold(0.0_f64, f64::max);
        if state.questions_answered >= self.config.deepening_min_answers
            && best_coverage >= self.config.deepening_min_coverage
        {
            return Phase::Deepening;
        }
        Phase::Exploration
    }

    /// Questions the session may be asked at all in `phase`.
    pub fn eligible<'a>(&self, state: &SessionState, catalog: &'a QuestionCatalog, phase: Phase) -> Vec<&'a Question> {
        let after_heavy = state.last_energy() == Some(EnergyDynamic::Heavy);
        catalog
            .iter()
            .filter(|q| q.is_askable())
            .filter(|q| q.safety_level >= state.min_safety_level)
            .filter(|q| !state.answered_ids.contains(&q.id))
            .filter(|q| !state.skipped.contains_key(&q.id))
            .filter(|q| {
                let heavy = q.energy_dynamic == EnergyDynamic::Heavy;
                !(heavy && (after_heavy || phase == Phase::Balancing))
            })
            .filter(|q| phase != Phase::Entry || is_gentle(q))
            .collect()
    }

    pub fn select_next<R: Rng + ?Sized>(
        &self,
        state: &SessionState,
        catalog: &QuestionCatalog,
        fatigue: &FatigueSnapshot,
        rng: &mut R,
    ) -> DomainResult<Selection> {
        let phase = self.derive_phase(state, fatigue);
        let eligible = self.eligible(state, catalog, phase);

        // ENTRY sticks to openers while any are left, then to the other
        // gentle questions the pre-filter kept.
        let pool: Vec<&Question> = if phase == Phase::Entry {
            let openers: Vec<&Question> = eligible.iter().copied().filter(|q| is_opener(q)).collect();
            if openers.is_empty() {
                eligible
            } else {
                openers
            }
        } else {
            eligible
        };

        let best = pool
            .into_iter()
            .map(|q| {
                let jitter = if self.config.jitter > 0.0 {
                    rng.gen::<f64>() * self.config.jitter
                } else {
                    0.0
                };
                (q, self.score(state, catalog, phase, q) + jitter)
            })
            .max_by(|(qa, a), (qb, b)| a.total_cmp(b).then_with(|| qb.id.as_str().cmp(qa.id.as_str())));

        match best {
            Some((question, score)) => Ok(Selection {
                question: question.clone(),
                phase,
                score,
            }),
            None => Err(DomainError::NoEligibleCandidate {
                session_id: state.session_id,
                phase: phase.as_str().to_string(),
            }),
        }
    }

    /// Deterministic part of a candidate's score.
    pub fn score(&self, state: &SessionState, catalog: &QuestionCatalog, phase: Phase, question: &Question) -> f64 {
        let gap = self.config.domain_gap_weight * (1.0 - state.coverage(question.domain));

        let repeat = if state.questions_answered == 0 {
            0.0
        } else {
            self.config.repeat_penalty * f64::from(state.domain_count(question.domain))
                / f64::from(state.questions_answered)
        };

        let connection = match &state.last_question_id {
            Some(last) if catalog.is_connected(last, &question.id) => CONNECTION_BONUS,
            _ => 0.0,
        };

        let trust_level = 1 + state.questions_answered / ANSWERS_PER_TRUST_LEVEL;
        let trust_gap = u32::from(question.trust_requirement).saturating_sub(trust_level);
        let trust = TRUST_PENALTY_PER_LEVEL * f64::from(trust_gap.min(4));

        gap - repeat + energy_term(&state.recent_energies, question.energy_dynamic)
            + phase_alignment(state, phase, question)
            + connection
            - trust
    }
}

fn is_opener(question: &Question) -> bool {
    question.depth_level <= 1 && question.energy_dynamic == EnergyDynamic::Opening
}

fn is_gentle(question: &Question) -> bool {
    question.depth_level <= ENTRY_MAX_DEPTH
        && !matches!(question.energy_dynamic, EnergyDynamic::Heavy | EnergyDynamic::Processing)
}

/// Transition term against the last two selections (oldest first).
fn energy_term(recent: &[EnergyDynamic], candidate: EnergyDynamic) -> f64 {
    let Some(&last) = recent.last() else {
        return 0.0;
    };

    let mut term = 0.0;
    if last == EnergyDynamic::Heavy && candidate == EnergyDynamic::Healing {
        term += HEALING_AFTER_HEAVY_BONUS;
    }
    let escalation = i32::from(candidate.intensity()) - i32::from(last.intensity());
    if escalation > 0 {
        term -= ESCALATION_PENALTY_PER_STEP * f64::from(escalation);
    }
    let repeats = recent.iter().rev().take(2).filter(|e| **e == candidate).count();
    term -= REPEAT_ENERGY_PENALTY * repeats as f64;

    term.clamp(ENERGY_TERM_MIN, ENERGY_TERM_MAX)
}

fn phase_alignment(state: &SessionState, phase: Phase, question: &Question) -> f64 {
    match phase {
        Phase::Entry => match question.energy_dynamic {
            EnergyDynamic::Opening => PHASE_BONUS,
            EnergyDynamic::Neutral => PHASE_BONUS / 2.0,
            _ => 0.0,
        },
        Phase::Exploration => {
            let fresh_domain = if state.domain_count(question.domain) == 0 {
                PHASE_BONUS / 2.0
            } else {
                0.0
            };
            let shallow = if question.depth_level <= 2 { PHASE_BONUS / 2.0 } else { 0.0 };
            fresh_domain + shallow
        }
        Phase::Deepening => {
            let reached = state
                .answered_depth_by_domain
                .get(&question.domain)
                .copied()
                .unwrap_or(0);
            if question.depth_level == reached + 1 {
                PHASE_BONUS
            } else if question.depth_level > reached {
                PHASE_BONUS / 2.0
            } else {
                0.0
            }
        }
        Phase::Balancing => match question.energy_dynamic {
            EnergyDynamic::Healing | EnergyDynamic::Opening => PHASE_BONUS,
            EnergyDynamic::Neutral => PHASE_BONUS / 2.0,
            _ => 0.0,
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap, HashSet};

    use chrono::Utc;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use uuid::Uuid;

    use super::*;
    use crate::domain::models::{Domain, QuestionId};

    fn question(id: &str, domain: Domain, energy: EnergyDynamic, depth: u8) -> Question {
        Question {
            id: QuestionId::new(id),
            domain,
            text: format!("question {id}"),
            depth_level: depth,
            energy_dynamic: energy,
            complexity: 2,
            emotional_weight: 2,
            safety_level: 3,
            trust_requirement: 1,
            connections: Vec::new(),
            active: true,
            flagged: false,
        }
    }

    fn state(answered: u32) -> SessionState {
        SessionState {
            session_id: Uuid::new_v4(),
            user_id: "user-1".to_string(),
            questions_answered: answered,
            answered_domain_counts: BTreeMap::new(),
            answered_depth_by_domain: BTreeMap::new(),
            recent_energies: Vec::new(),
            last_question_id: None,
            answered_ids: HashSet::new(),
            skipped: HashMap::new(),
            min_safety_level: 2,
            domain_coverage: BTreeMap::new(),
        }
    }

    fn calm(state: &SessionState) -> FatigueSnapshot {
        FatigueSnapshot::calm(state.session_id, Utc::now())
    }

    #[test]
    fn test_never_heavy_after_heavy() {
        let router = QuestionRouter::default();
        let catalog = QuestionCatalog::new(vec![
            question("heavy", Domain::Emotions, EnergyDynamic::Heavy, 3),
            question("light", Domain::Identity, EnergyDynamic::Neutral, 1),
        ]);
        let mut state = state(6);
        state.recent_energies = vec![EnergyDynamic::Neutral, EnergyDynamic::Heavy];

        let mut rng = StdRng::seed_from_u64(7);
        let selection = router.select_next(&state, &catalog, &calm(&state), &mut rng).unwrap();
        assert_eq!(selection.question.id, QuestionId::new("light"));
    }

    #[test]
    fn test_empty_pool_is_no_eligible_candidate() {
        let router = QuestionRouter::default();
        let catalog = QuestionCatalog::new(vec![question("heavy", Domain::Emotions, EnergyDynamic::Heavy, 3)]);
        let mut state = state(6);
        state.recent_energies = vec![EnergyDynamic::Heavy];

        let err = router
            .select_next(&state, &catalog, &calm(&state), &mut StdRng::seed_from_u64(1))
            .unwrap_err();
        assert!(matches!(err, DomainError::NoEligibleCandidate { .. }));
    }

    #[test]
    fn test_safety_answered_and_skips_filtered() {
        let router = QuestionRouter::default();
        let mut unsafe_q = question("unsafe", Domain::Beliefs, EnergyDynamic::Opening, 1);
        unsafe_q.safety_level = 1;
        let catalog = QuestionCatalog::new(vec![
            unsafe_q,
            question("answered", Domain::Work, EnergyDynamic::Opening, 1),
            question("skipped", Domain::Values, EnergyDynamic::Opening, 1),
            question("flagged-skip", Domain::Growth, EnergyDynamic::Opening, 1),
            question("ok", Domain::Lifestyle, EnergyDynamic::Neutral, 2),
        ]);
        let mut state = state(4);
        state.answered_ids.insert(QuestionId::new("answered"));
        state.skipped.insert(QuestionId::new("skipped"), false);
        state.skipped.insert(QuestionId::new("flagged-skip"), true);

        let eligible = router.eligible(&state, &catalog, Phase::Exploration);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, QuestionId::new("ok"));

        let widened = state.with_skips_readmitted();
        let eligible = router.eligible(&widened, &catalog, Phase::Exploration);
        assert_eq!(eligible.len(), 2);
    }

    #[test]
    fn test_covered_domain_loses_in_exploration() {
        let router = QuestionRouter::default();
        let mut state = state(8);
        state.answered_domain_counts.insert(Domain::Identity, 8);
        state.answered_depth_by_domain.insert(Domain::Identity, 2);

        let mut questions = vec![
            question("id-open", Domain::Identity, EnergyDynamic::Opening, 1),
            question("id-heal", Domain::Identity, EnergyDynamic::Healing, 2),
        ];
        questions.push(question("work-proc", Domain::Work, EnergyDynamic::Processing, 3));
        let catalog = QuestionCatalog::new(questions);

        assert_eq!(router.derive_phase(&state, &calm(&state)), Phase::Exploration);
        for seed in 0..50 {
            let selection = router
                .select_next(&state, &catalog, &calm(&state), &mut StdRng::seed_from_u64(seed))
                .unwrap();
            assert_eq!(selection.question.domain, Domain::Work);
        }
    }

    #[test]
    fn test_entry_prefers_openers() {
        let router = QuestionRouter::default();
        let catalog = QuestionCatalog::new(vec![
            question("deep", Domain::Values, EnergyDynamic::Processing, 4),
            question("opener", Domain::Identity, EnergyDynamic::Opening, 1),
        ]);
        let state = state(0);
        let selection = router
            .select_next(&state, &catalog, &calm(&state), &mut StdRng::seed_from_u64(3))
            .unwrap();
        assert_eq!(selection.phase, Phase::Entry);
        assert_eq!(selection.question.id, QuestionId::new("opener"));
    }

    #[test]
    fn test_entry_falls_back_to_gentle_questions_only() {
        let router = QuestionRouter::default();
        let catalog = QuestionCatalog::new(vec![
            question("heavy", Domain::Emotions, EnergyDynamic::Heavy, 1),
            question("deep", Domain::Values, EnergyDynamic::Neutral, 4),
            question("processing", Domain::Growth, EnergyDynamic::Processing, 2),
            question("neutral", Domain::Work, EnergyDynamic::Neutral, 2),
        ]);
        let state = state(1);
        for seed in 0..20 {
            let selection = router
                .select_next(&state, &catalog, &calm(&state), &mut StdRng::seed_from_u64(seed))
                .unwrap();
            assert_eq!(selection.phase, Phase::Entry);
            assert_eq!(selection.question.id, QuestionId::new("neutral"));
        }
    }

    #[test]
    fn test_entry_without_gentle_questions_is_no_eligible_candidate() {
        let router = QuestionRouter::default();
        let catalog = QuestionCatalog::new(vec![
            question("heavy", Domain::Emotions, EnergyDynamic::Heavy, 4),
            question("deep", Domain::Values, EnergyDynamic::Opening, 3),
        ]);
        let entry_state = state(0);
        assert!(router.eligible(&entry_state, &catalog, Phase::Entry).is_empty());
        let err = router
            .select_next(&entry_state, &catalog, &calm(&entry_state), &mut StdRng::seed_from_u64(5))
            .unwrap_err();
        assert!(matches!(err, DomainError::NoEligibleCandidate { ref phase, .. } if phase == Phase::Entry.as_str()), "got {err:?}");

        // The same catalog is fair game once entry is over.
        assert_eq!(router.eligible(&state(6), &catalog, Phase::Exploration).len(), 2);
    }

    #[test]
    fn test_balancing_excludes_heavy_and_prefers_healing() {
        let router = QuestionRouter::default();
        let catalog = QuestionCatalog::new(vec![
            question("heavy", Domain::Emotions, EnergyDynamic::Heavy, 3),
            question("heal", Domain::Emotions, EnergyDynamic::Healing, 2),
            question("proc", Domain::Emotions, EnergyDynamic::Processing, 2),
        ]);
        let state = state(6);
        let mut fatigue = calm(&state);
        fatigue.level = FatigueLevel::Medium;

        let selection = router
            .select_next(&state, &catalog, &fatigue, &mut StdRng::seed_from_u64(9))
            .unwrap();
        assert_eq!(selection.phase, Phase::Balancing);
        assert_eq!(selection.question.id, QuestionId::new("heal"));
    }

    #[test]
    fn test_deepening_needs_answers_and_coverage() {
        let router = QuestionRouter::default();
        let mut state = state(12);
        state.answered_domain_counts.insert(Domain::Work, 4);
        assert_eq!(router.derive_phase(&state, &calm(&state)), Phase::Exploration);
        state.answered_domain_counts.insert(Domain::Work, 6);
        assert_eq!(router.derive_phase(&state, &calm(&state)), Phase::Deepening);
    }

    #[test]
    fn test_healing_after_heavy_bonus() {
        assert!(energy_term(&[EnergyDynamic::Heavy], EnergyDynamic::Healing) > 0.0);
        assert!(energy_term(&[EnergyDynamic::Opening], EnergyDynamic::Heavy) < 0.0);
        let repeated = energy_term(&[EnergyDynamic::Neutral, EnergyDynamic::Neutral], EnergyDynamic::Neutral);
        assert!(repeated < energy_term(&[EnergyDynamic::Neutral], EnergyDynamic::Neutral));
        assert!(energy_term(&[EnergyDynamic::Healing], EnergyDynamic::Heavy) >= ENERGY_TERM_MIN);
    }
}
