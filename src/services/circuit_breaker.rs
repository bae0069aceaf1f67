//! Circuit breaker protecting the scoring oracle.
//!
//! CLOSED counts outcomes over a rolling window and opens once either the
//! consecutive-failure or the failure-rate threshold is crossed. OPEN fails
//! fast until its cool-down elapses, then admits exactly one HALF_OPEN trial:
//! success closes the circuit, failure reopens it with an escalated cool-down.
//! Operators can pin the breaker open or closed.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::adapters::sqlite::SqliteControlFlags;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::CircuitBreakerConfig;

/// Control flag under which the manual override is persisted.
pub const BREAKER_OVERRIDE_FLAG: &str = "breaker.override";

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally.
    Closed,
    /// Circuit is open, requests are blocked.
    Open,
    /// Circuit is testing if the oracle has recovered.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Manual override set by an operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerOverride {
    /// Normal automatic behavior.
    #[default]
    Auto,
    ForcedOpen,
    ForcedClosed,
}

impl BreakerOverride {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::ForcedOpen => "open",
            Self::ForcedClosed => "closed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "open" | "forced_open" => Some(Self::ForcedOpen),
            "closed" | "close" | "forced_closed" => Some(Self::ForcedClosed),
            _ => None,
        }
    }
}

/// Permission to make one call. Hand it back through `record_success` or
/// `record_failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPermit {
    trial: bool,
}

impl CallPermit {
    /// Whether this call is the single half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

/// Point-in-time view of the breaker for health reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    #[serde(rename = "override")]
    pub override_mode: BreakerOverride,
    pub consecutive_failures: u32,
    pub window_calls: usize,
    pub window_failure_rate: f64,
    pub open_count: u32,
    pub cooldown_ms: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    override_mode: BreakerOverride,
    consecutive_failures: u32,
    /// `(when, failed)` per completed call inside the rolling window.
    window: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    cooldown: Duration,
    trial_started_at: Option<Instant>,
    open_count: u32,
}

impl BreakerInner {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&(at, _)) = self.window.front() {
            if now.duration_since(at) > window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|(_, failed)| *failed).count();
        failures as f64 / self.window.len() as f64
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.trial_started_at = None;
        self.open_count += 1;
    }

    fn close(&mut self, base_cooldown: Duration) {
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.trial_started_at = None;
        self.consecutive_failures = 0;
        self.cooldown = base_cooldown;
        self.window.clear();
    }
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let cooldown = Duration::from_millis(config.cooldown_ms);
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                override_mode: BreakerOverride::Auto,
                consecutive_failures: 0,
                window: VecDeque::new(),
                opened_at: None,
                cooldown,
                trial_started_at: None,
                open_count: 0,
            }),
        }
    }

    fn base_cooldown(&self) -> Duration {
        Duration::from_millis(self.config.cooldown_ms)
    }

    fn max_cooldown(&self) -> Duration {
        Duration::from_millis(self.config.max_cooldown_ms.max(self.config.cooldown_ms))
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.config.window_secs)
    }

    /// Ask to make a call.
    ///
    /// Fails fast with [`DomainError::CircuitOpen`] while open, and while the
    /// half-open trial is still in flight.
    pub async fn acquire(&self) -> DomainResult<CallPermit> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        match inner.override_mode {
            BreakerOverride::ForcedClosed => return Ok(CallPermit { trial: false }),
            BreakerOverride::ForcedOpen => {
                return Err(DomainError::CircuitOpen {
                    retry_after_ms: duration_ms(inner.cooldown),
                })
            }
            BreakerOverride::Auto => {}
        }

        match inner.state {
            CircuitState::Closed => Ok(CallPermit { trial: false }),
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = now.duration_since(opened_at);
                if elapsed >= inner.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_started_at = Some(now);
                    tracing::info!(open_count = inner.open_count, "circuit breaker half-open, admitting trial call");
                    Ok(CallPermit { trial: true })
                } else {
                    Err(DomainError::CircuitOpen {
                        retry_after_ms: duration_ms(inner.cooldown - elapsed),
                    })
                }
            }
            CircuitState::HalfOpen => {
                // A trial abandoned without an outcome is replaced after one cool-down.
                let stale = inner
                    .trial_started_at
                    .map_or(true, |started| now.duration_since(started) >= inner.cooldown);
                if stale {
                    inner.trial_started_at = Some(now);
                    Ok(CallPermit { trial: true })
                } else {
                    Err(DomainError::CircuitOpen {
                        retry_after_ms: duration_ms(inner.cooldown),
                    })
                }
            }
        }
    }

    pub async fn record_success(&self, permit: CallPermit) {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        if permit.trial {
            if inner.state == CircuitState::HalfOpen {
                inner.close(self.base_cooldown());
                tracing::info!("circuit breaker closed after successful trial");
            }
            return;
        }
        if inner.state == CircuitState::Closed {
            inner.consecutive_failures = 0;
            inner.window.push_back((now, false));
            inner.prune(now, self.window());
        }
    }

    pub async fn record_failure(&self, permit: CallPermit) {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        if permit.trial {
            if inner.state == CircuitState::HalfOpen {
                let escalated = inner.cooldown.mul_f64(self.config.cooldown_multiplier.max(1.0));
                inner.cooldown = escalated.min(self.max_cooldown());
                inner.open(now);
                tracing::warn!(
                    cooldown_ms = duration_ms(inner.cooldown),
                    open_count = inner.open_count,
                    "circuit breaker trial failed, reopening"
                );
            }
            return;
        }
        if inner.state != CircuitState::Closed {
            return;
        }

        inner.consecutive_failures += 1;
        inner.window.push_back((now, true));
        inner.prune(now, self.window());

        let rate_tripped = inner.window.len() >= self.config.minimum_calls as usize
            && inner.failure_rate() >= self.config.failure_rate_threshold;
        let consecutive_tripped = inner.consecutive_failures >= self.config.consecutive_failure_threshold;
        if rate_tripped || consecutive_tripped {
            inner.open(now);
            tracing::warn!(
                consecutive_failures = inner.consecutive_failures,
                failure_rate = inner.failure_rate(),
                cooldown_ms = duration_ms(inner.cooldown),
                "circuit breaker opened"
            );
        }
    }

    /// Effective state, taking the override and an elapsed cool-down into account.
    pub async fn state(&self) -> CircuitState {
        let inner = self.inner.lock().await;
        effective_state(&inner)
    }

    pub async fn set_override(&self, mode: BreakerOverride) {
        let mut inner = self.inner.lock().await;
        if inner.override_mode != mode {
            tracing::info!(from = inner.override_mode.as_str(), to = mode.as_str(), "circuit breaker override changed");
        }
        inner.override_mode = mode;
        if mode == BreakerOverride::ForcedClosed {
            inner.close(self.base_cooldown());
        }
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock().await;
        inner.prune(Instant::now(), self.window());
        BreakerSnapshot {
            state: effective_state(&inner),
            override_mode: inner.override_mode,
            consecutive_failures: inner.consecutive_failures,
            window_calls: inner.window.len(),
            window_failure_rate: inner.failure_rate(),
            open_count: inner.open_count,
            cooldown_ms: duration_ms(inner.cooldown),
        }
    }
}

/// Apply the operator override persisted in `flags` to `breaker`.
///
/// A missing flag means [`BreakerOverride::Auto`]; an unreadable one is
/// ignored with a warning.
pub async fn sync_override(flags: &SqliteControlFlags, breaker: &CircuitBreaker) -> DomainResult<BreakerOverride> {
    let mode = match flags.get(BREAKER_OVERRIDE_FLAG).await? {
        None => BreakerOverride::Auto,
        Some(value) => BreakerOverride::from_str(&value).unwrap_or_else(|| {
            tracing::warn!(value = %value, "ignoring unknown breaker override");
            BreakerOverride::Auto
        }),
    };
    breaker.set_override(mode).await;
    Ok(mode)
}

fn effective_state(inner: &BreakerInner) -> CircuitState {
    match inner.override_mode {
        BreakerOverride::ForcedOpen => CircuitState::Open,
        BreakerOverride::ForcedClosed => CircuitState::Closed,
        BreakerOverride::Auto => inner.state,
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
