//! Fatigue estimation from answer timing, length and emotional load.
//!
//! Pure functions over a window of recent answers. Trends are least-squares
//! slopes relative to the window mean, so a user who is slow (or terse)
//! throughout does not look tired; only change does.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::models::{
    AnswerRecord, AnswerSample, FatigueComponents, FatigueConfig, FatigueLevel, FatigueSnapshot, SuggestedAction,
};

const RESPONSE_TIME_WEIGHT: f64 = 0.4;
const LENGTH_WEIGHT: f64 = 0.35;
const EMOTIONAL_WEIGHT: f64 = 0.25;

/// Relative change per answer at which a trend counts as fully fatigued.
const TREND_SATURATION: f64 = 0.15;
/// Weighted HEAVY/PROCESSING count at which emotional load saturates.
const LOAD_SATURATION: f64 = 3.0;
/// Fewer answers than this carry no trend.
const MIN_TREND_SAMPLES: usize = 3;

#[derive(Debug, Clone)]
pub struct FatigueEstimator {
    config: FatigueConfig,
}

impl FatigueEstimator {
    pub fn new(config: FatigueConfig) -> Self {
        Self { config }
    }

    /// Score the last `window` samples (oldest first) of a session that has
    /// been running for `elapsed`.
    pub fn estimate(
        &self,
        session_id: Uuid,
        samples: &[AnswerSample],
        elapsed: chrono::Duration,
        now: DateTime<Utc>,
    ) -> FatigueSnapshot {
        let window = &samples[samples.len().saturating_sub(self.config.window.max(1))..];
        let components = components(window);
        let score = (RESPONSE_TIME_WEIGHT * components.response_time_trend
            + LENGTH_WEIGHT * components.length_trend
            + EMOTIONAL_WEIGHT * components.emotional_load)
            .clamp(0.0, 1.0);

        let (level, suggested_action) = if score >= self.config.high_threshold {
            (
                FatigueLevel::High,
                SuggestedAction::Pause {
                    minutes: self.pause_minutes(score, elapsed),
                },
            )
        } else if score >= self.config.medium_threshold {
            (FatigueLevel::Medium, SuggestedAction::Balance)
        } else {
            (FatigueLevel::Low, SuggestedAction::None)
        };

        FatigueSnapshot {
            session_id,
            score,
            level,
            components,
            suggested_action,
            computed_at: now,
        }
    }

    /// Pause length: grows with the score and with time already spent.
    pub fn pause_minutes(&self, score: f64, elapsed: chrono::Duration) -> u32 {
        let elapsed_minutes = elapsed.num_seconds().max(0) as f64 / 60.0;
        let threshold = self.config.high_threshold.max(f64::EPSILON);
        let minutes = self.config.base_pause_minutes * (score / threshold) * (1.0 + elapsed_minutes / 60.0);
        let min = f64::from(self.config.min_pause_minutes);
        let max = f64::from(self.config.max_pause_minutes.max(self.config.min_pause_minutes));
        minutes.clamp(min, max).round() as u32
    }
}

/// Estimator inputs from stored answers, oldest first.
pub fn samples_from(answers: &[AnswerRecord]) -> Vec<AnswerSample> {
    answers
        .iter()
        .map(|a| AnswerSample {
            response_time_secs: a.response_time_secs,
            answer_length: a.answer_length(),
            energy: a.energy,
        })
        .collect()
}

fn components(window: &[AnswerSample]) -> FatigueComponents {
    let response_times: Vec<f64> = window.iter().map(|s| s.response_time_secs).collect();
    let lengths: Vec<f64> = window.iter().map(|s| s.answer_length as f64).collect();
    let load: f64 = window.iter().map(|s| s.energy.emotional_load()).sum();

    FatigueComponents {
        response_time_trend: trend_score(relative_slope(&response_times)),
        length_trend: trend_score(-relative_slope(&lengths)),
        emotional_load: (load / LOAD_SATURATION).clamp(0.0, 1.0),
    }
}

fn trend_score(relative_slope: f64) -> f64 {
    (relative_slope / TREND_SATURATION).clamp(0.0, 1.0)
}

/// Least-squares slope over the sample index, divided by the mean.
fn relative_slope(values: &[f64]) -> f64 {
    if values.len() < MIN_TREND_SAMPLES || values.iter().any(|v| !v.is_finite()) {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n;
    if mean_y <= 0.0 {
        return 0.0;
    }

    let (sxy, sxx) = values.iter().enumerate().fold((0.0, 0.0), |(sxy, sxx), (i, y)| {
        let dx = i as f64 - mean_x;
        (sxy + dx * (y - mean_y), sxx + dx * dx)
    });
    (sxy / sxx) / mean_y
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::EnergyDynamic;

    fn samples(times: &[f64], lengths: &[usize], energy: EnergyDynamic) -> Vec<AnswerSample> {
        times
            .iter()
            .zip(lengths)
            .map(|(t, l)| AnswerSample {
                response_time_secs: *t,
                answer_length: *l,
                energy,
            })
            .collect()
    }

    #[test]
    fn test_slowing_and_shortening_answers_are_high() {
        let estimator = FatigueEstimator::new(FatigueConfig::default());
        let window = samples(
            &[20.0, 22.0, 25.0, 40.0, 60.0, 90.0],
            &[120, 100, 90, 60, 30, 10],
            EnergyDynamic::Neutral,
        );
        let snapshot = estimator.estimate(Uuid::new_v4(), &window, chrono::Duration::minutes(12), Utc::now());

        assert_eq!(snapshot.level, FatigueLevel::High);
        let SuggestedAction::Pause { minutes } = snapshot.suggested_action else {
            panic!("expected a pause, got {:?}", snapshot.suggested_action);
        };
        assert!((15..=45).contains(&minutes), "pause of {minutes} minutes");
    }

    #[test]
    fn test_steady_answers_are_low() {
        let estimator = FatigueEstimator::new(FatigueConfig::default());
        let window = samples(&[30.0; 8], &[80; 8], EnergyDynamic::Opening);
        let snapshot = estimator.estimate(Uuid::new_v4(), &window, chrono::Duration::minutes(5), Utc::now());
        assert_eq!(snapshot.level, FatigueLevel::Low);
        assert_eq!(snapshot.suggested_action, SuggestedAction::None);
        assert!(snapshot.score.abs() < 1e-9);
    }

    #[test]
    fn test_heavy_load_moves_to_balancing() {
        let estimator = FatigueEstimator::new(FatigueConfig::default());
        let mut window = samples(&[30.0, 31.0, 34.0, 36.0], &[80, 80, 76, 74], EnergyDynamic::Heavy);
        window.extend(samples(&[38.0], &[72], EnergyDynamic::Processing));
        let snapshot = estimator.estimate(Uuid::new_v4(), &window, chrono::Duration::minutes(5), Utc::now());
        assert_eq!(snapshot.level, FatigueLevel::Medium);
        assert_eq!(snapshot.suggested_action, SuggestedAction::Balance);
    }

    #[test]
    fn test_only_the_window_counts() {
        let config = FatigueConfig {
            window: 4,
            ..FatigueConfig::default()
        };
        let estimator = FatigueEstimator::new(config);
        let mut window = samples(&[10.0, 20.0, 40.0, 80.0], &[100, 50, 25, 10], EnergyDynamic::Heavy);
        window.extend(samples(&[30.0; 4], &[60; 4], EnergyDynamic::Neutral));
        let snapshot = estimator.estimate(Uuid::new_v4(), &window, chrono::Duration::zero(), Utc::now());
        assert_eq!(snapshot.level, FatigueLevel::Low);
    }

    #[test]
    fn test_pause_is_bounded() {
        let estimator = FatigueEstimator::new(FatigueConfig::default());
        assert_eq!(estimator.pause_minutes(1.0, chrono::Duration::hours(10)), 60);
        let config = FatigueConfig {
            base_pause_minutes: 1.0,
            ..FatigueConfig::default()
        };
        assert_eq!(FatigueEstimator::new(config).pause_minutes(0.7, chrono::Duration::zero()), 5);
    }

    #[test]
    fn test_short_history_has_no_trend() {
        let estimator = FatigueEstimator::new(FatigueConfig::default());
        let window = samples(&[10.0, 90.0], &[200, 1], EnergyDynamic::Neutral);
        let snapshot = estimator.estimate(Uuid::new_v4(), &window, chrono::Duration::zero(), Utc::now());
        assert_eq!(snapshot.components.response_time_trend, 0.0);
        assert_eq!(snapshot.components.length_trend, 0.0);
    }
}
