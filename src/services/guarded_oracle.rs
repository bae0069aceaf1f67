//! The only path to the scoring oracle: breaker, rate limiter and hard timeout.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

use super::circuit_breaker::CircuitBreaker;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::OracleConfig;
use crate::domain::ports::{AnalysisContext, AnalysisResult, ScoringOracle};

pub struct GuardedOracle {
    oracle: Arc<dyn ScoringOracle>,
    breaker: Arc<CircuitBreaker>,
    limiter: DefaultDirectRateLimiter,
    timeout: Duration,
}

impl GuardedOracle {
    pub fn new(oracle: Arc<dyn ScoringOracle>, breaker: Arc<CircuitBreaker>, config: &OracleConfig) -> Self {
        let rate = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst_size).unwrap_or(rate);
        Self {
            oracle,
            breaker,
            limiter: RateLimiter::direct(Quota::per_second(rate).allow_burst(burst)),
            timeout: config.timeout(),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn oracle_name(&self) -> &'static str {
        self.oracle.name()
    }

    /// Analyze `text`, failing fast while the breaker is open.
    ///
    /// A call that exceeds the timeout is abandoned and reported as
    /// [`DomainError::OracleTimeout`]; it counts as a breaker failure.
    pub async fn analyze(&self, text: &str, context: &AnalysisContext) -> DomainResult<AnalysisResult> {
        // Throttle before taking a permit so a queued call never sits on the
        // half-open trial.
        self.limiter.until_ready().await;
        let permit = self.breaker.acquire().await?;

        let result = match tokio::time::timeout(self.timeout, self.oracle.analyze(text, context)).await {
            Ok(result) => result,
            Err(_) => Err(DomainError::OracleTimeout {
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        };

        match &result {
            Err(e) if e.kind().affects_breaker() => {
                tracing::debug!(
                    oracle = self.oracle.name(),
                    error_kind = %e.kind(),
                    trial = permit.is_trial(),
                    "oracle call failed"
                );
                self.breaker.record_failure(permit).await;
            }
            // Validation and authorization errors mean the oracle answered.
            _ => self.breaker.record_success(permit).await,
        }
        result
    }
}
