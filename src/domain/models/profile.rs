//! Profile read model.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::TraitScores;
use super::question::Domain;

/// Coverage gained from one fully confident answer.
const COVERAGE_STEP: f64 = 0.1;
/// Low-confidence answers still count for this fraction of a step.
const MIN_STEP_FACTOR: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TraitEstimate {
    pub value: f64,
    pub confidence: f64,
    #[serde(default)]
    pub evidence_count: u32,
}

/// Per-user profile. Only the profile-update stage writes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: String,
    pub domain_coverage: BTreeMap<Domain, f64>,
    pub trait_estimates: BTreeMap<String, TraitEstimate>,
    pub completeness: f64,
    pub last_updated: DateTime<Utc>,
}

impl Profile {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            domain_coverage: BTreeMap::new(),
            trait_estimates: BTreeMap::new(),
            completeness: 0.0,
            last_updated: Utc::now(),
        }
    }

    pub fn coverage(&self, domain: Domain) -> f64 {
        self.domain_coverage.get(&domain).copied().unwrap_or(0.0)
    }

    /// Fold one analyzed answer into the profile.
    ///
    /// Coverage never decreases. Trait values move towards the new evidence
    /// weighted by confidence, and trait confidence never decreases.
    pub fn merge(
        &mut self,
        domain: Domain,
        traits: &TraitScores,
        confidence: f64,
        now: DateTime<Utc>,
    ) {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };

        let step = COVERAGE_STEP * confidence.max(MIN_STEP_FACTOR);
        let coverage = self.domain_coverage.entry(domain).or_insert(0.0);
        *coverage = (*coverage + step).min(1.0);

        for (name, &value) in traits {
            if !value.is_finite() {
                continue;
            }
            let estimate = self.trait_estimates.entry(name.clone()).or_insert(TraitEstimate {
                value,
                confidence: 0.0,
                evidence_count: 0,
            });
            let total = estimate.confidence + confidence;
            if total > 0.0 {
                estimate.value = (estimate.value * estimate.confidence + value * confidence) / total;
            } else {
                estimate.value = value;
            }
            estimate.confidence = 1.0 - (1.0 - estimate.confidence) * (1.0 - confidence * 0.5);
            estimate.evidence_count += 1;
        }

        self.completeness = Domain::ALL.iter().map(|d| self.coverage(*d)).sum::<f64>()
            / Domain::ALL.len() as f64;
        self.last_updated = now;
    }
}
