use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::question::EnergyDynamic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FatigueLevel {
    Low,
    Medium,
    High,
}

impl FatigueLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Some(Self::Low),
            "MEDIUM" => Some(Self::Medium),
            "HIGH" => Some(Self::High),
            _ => None,
        }
    }
}

impl std::fmt::Display for FatigueLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SuggestedAction {
    None,
    /// Route in the BALANCING phase.
    Balance,
    Pause { minutes: u32 },
}

/// Individual fatigue signals, each in [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FatigueComponents {
    pub response_time_trend: f64,
    pub length_trend: f64,
    pub emotional_load: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FatigueSnapshot {
    pub session_id: Uuid,
    pub score: f64,
    pub level: FatigueLevel,
    pub components: FatigueComponents,
    pub suggested_action: SuggestedAction,
    pub computed_at: DateTime<Utc>,
}

impl FatigueSnapshot {
    pub fn calm(session_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            session_id,
            score: 0.0,
            level: FatigueLevel::Low,
            components: FatigueComponents::default(),
            suggested_action: SuggestedAction::None,
            computed_at: now,
        }
    }
}

/// One answer as seen by the estimator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnswerSample {
    pub response_time_secs: f64,
    pub answer_length: usize,
    pub energy: EnergyDynamic,
}
