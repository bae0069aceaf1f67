use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Upper bound for hour-valued settings (about a century).
const MAX_HOURS: u64 = 24 * 365 * 100;

/// Main configuration structure for Portrait
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub relay: RelayConfig,

    /// Stage retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Scoring oracle client
    #[serde(default)]
    pub oracle: OracleConfig,

    #[serde(default)]
    pub workers: WorkersConfig,

    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub fatigue: FatigueConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub corpus: CorpusConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DatabaseConfig {
    /// Path to `SQLite` database file
    #[serde(default = "default_database_path")]
    pub path: String,

    /// Maximum number of database connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_path() -> String {
    ".portrait/portrait.db".to_string()
}

const fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

impl DatabaseConfig {
    pub fn url(&self) -> String {
        if self.path.starts_with("sqlite:") {
            self.path.clone()
        } else {
            format!("sqlite:{}", self.path)
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; stdout only when unset
    #[serde(default)]
    pub log_dir: Option<String>,

    /// Rotation: daily, hourly or never
    #[serde(default = "default_rotation")]
    pub rotation: String,

    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

const fn default_retention_days() -> u32 {
    30
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_rotation(),
            retention_days: default_retention_days(),
        }
    }
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TransportConfig {
    /// `sqlite` (durable, default) or `memory`
    #[serde(default = "default_transport_backend")]
    pub backend: String,

    /// Partitions per topic; events of one session always share a partition
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    #[serde(default = "default_read_batch_size")]
    pub read_batch_size: usize,

    /// Idle time after which an unacknowledged message may be reclaimed
    #[serde(default = "default_claim_idle_ms")]
    pub claim_idle_ms: u64,

    /// Worker sleep when a read returns nothing
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_transport_backend() -> String {
    "sqlite".to_string()
}

const fn default_partitions() -> u32 {
    4
}

const fn default_read_batch_size() -> usize {
    32
}

const fn default_claim_idle_ms() -> u64 {
    30_000
}

const fn default_poll_interval_ms() -> u64 {
    200
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backend: default_transport_backend(),
            partitions: default_partitions(),
            read_batch_size: default_read_batch_size(),
            claim_idle_ms: default_claim_idle_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl TransportConfig {
    pub fn claim_idle(&self) -> Duration {
        Duration::from_millis(self.claim_idle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Outbox relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RelayConfig {
    #[serde(default = "default_relay_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_relay_batch_size")]
    pub batch_size: usize,

    /// First backoff after a failed publish
    #[serde(default = "default_relay_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_relay_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,

    /// Published records older than this are purged
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,

    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

const fn default_relay_poll_interval_ms() -> u64 {
    250
}

const fn default_relay_batch_size() -> usize {
    100
}

const fn default_relay_initial_backoff_ms() -> u64 {
    500
}

const fn default_relay_max_backoff_ms() -> u64 {
    30_000
}

const fn default_multiplier() -> f64 {
    2.0
}

const fn default_retention_hours() -> u64 {
    168
}

const fn default_purge_interval_secs() -> u64 {
    3600
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_relay_poll_interval_ms(),
            batch_size: default_relay_batch_size(),
            initial_backoff_ms: default_relay_initial_backoff_ms(),
            max_backoff_ms: default_relay_max_backoff_ms(),
            backoff_multiplier: default_multiplier(),
            retention_hours: default_retention_hours(),
            purge_interval_secs: default_purge_interval_secs(),
        }
    }
}

impl RelayConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours.min(MAX_HOURS) as i64)
    }
}

/// Retry policy for failed stage work
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Retries allowed before a failure becomes terminal
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// How often the coordinator scans for due work
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_base_delay_ms() -> u64 {
    1_000
}

const fn default_max_delay_ms() -> u64 {
    300_000
}

const fn default_scan_interval_ms() -> u64 {
    1_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            scan_interval_ms: default_scan_interval_ms(),
        }
    }
}

/// Circuit breaker thresholds for the scoring oracle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_consecutive_failures")]
    pub consecutive_failure_threshold: u32,

    /// Failure rate over the rolling window that opens the circuit
    #[serde(default = "default_failure_rate")]
    pub failure_rate_threshold: f64,

    /// Calls in the window before the failure rate is considered
    #[serde(default = "default_minimum_calls")]
    pub minimum_calls: u32,

    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Cool-down growth after a failed half-open trial
    #[serde(default = "default_multiplier")]
    pub cooldown_multiplier: f64,

    #[serde(default = "default_max_cooldown_ms")]
    pub max_cooldown_ms: u64,
}

const fn default_consecutive_failures() -> u32 {
    3
}

const fn default_failure_rate() -> f64 {
    0.5
}

const fn default_minimum_calls() -> u32 {
    10
}

const fn default_window_secs() -> u64 {
    60
}

const fn default_cooldown_ms() -> u64 {
    30_000
}

const fn default_max_cooldown_ms() -> u64 {
    300_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            consecutive_failure_threshold: default_consecutive_failures(),
            failure_rate_threshold: default_failure_rate(),
            minimum_calls: default_minimum_calls(),
            window_secs: default_window_secs(),
            cooldown_ms: default_cooldown_ms(),
            cooldown_multiplier: default_multiplier(),
            max_cooldown_ms: default_max_cooldown_ms(),
        }
    }
}

/// Scoring oracle client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct OracleConfig {
    /// `http` or `mock`
    #[serde(default = "default_oracle_backend")]
    pub backend: String,

    #[serde(default = "default_oracle_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Hard timeout per call
    #[serde(default = "default_oracle_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,

    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
}

fn default_oracle_backend() -> String {
    "http".to_string()
}

fn default_oracle_url() -> String {
    "http://127.0.0.1:8088".to_string()
}

const fn default_oracle_timeout_ms() -> u64 {
    10_000
}

const fn default_requests_per_second() -> u32 {
    5
}

const fn default_burst_size() -> u32 {
    10
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            backend: default_oracle_backend(),
            base_url: default_oracle_url(),
            api_key: None,
            timeout_ms: default_oracle_timeout_ms(),
            requests_per_second: default_requests_per_second(),
            burst_size: default_burst_size(),
        }
    }
}

impl OracleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Worker counts per stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WorkersConfig {
    #[serde(default = "default_analysis_workers")]
    pub analysis: usize,

    #[serde(default = "default_one")]
    pub embedding: usize,

    #[serde(default = "default_one")]
    pub profile_update: usize,

    /// How often each stage's watchdog reclaims stale messages
    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,

    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
}

const fn default_analysis_workers() -> usize {
    2
}

const fn default_one() -> usize {
    1
}

const fn default_watchdog_interval_ms() -> u64 {
    5_000
}

const fn default_health_interval_secs() -> u64 {
    60
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            analysis: default_analysis_workers(),
            embedding: default_one(),
            profile_update: default_one(),
            watchdog_interval_ms: default_watchdog_interval_ms(),
            health_interval_secs: default_health_interval_secs(),
        }
    }
}

/// Question router weights
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RouterConfig {
    #[serde(default = "default_domain_gap_weight")]
    pub domain_gap_weight: f64,

    /// Penalty for domains already asked often this session
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f64,

    /// Jitter amplitude; breaks ties without changing ranking materially
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Answers before leaving ENTRY
    #[serde(default = "default_entry_answers")]
    pub entry_answers: u32,

    #[serde(default = "default_deepening_min_answers")]
    pub deepening_min_answers: u32,

    /// Best domain coverage required to enter DEEPENING
    #[serde(default = "default_deepening_min_coverage")]
    pub deepening_min_coverage: f64,
}

const fn default_domain_gap_weight() -> f64 {
    2.0
}

const fn default_repeat_penalty() -> f64 {
    0.5
}

const fn default_jitter() -> f64 {
    0.02
}

const fn default_entry_answers() -> u32 {
    3
}

const fn default_deepening_min_answers() -> u32 {
    12
}

const fn default_deepening_min_coverage() -> f64 {
    0.5
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            domain_gap_weight: default_domain_gap_weight(),
            repeat_penalty: default_repeat_penalty(),
            jitter: default_jitter(),
            entry_answers: default_entry_answers(),
            deepening_min_answers: default_deepening_min_answers(),
            deepening_min_coverage: default_deepening_min_coverage(),
        }
    }
}

/// Fatigue estimator thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FatigueConfig {
    /// Answers considered
    #[serde(default = "default_fatigue_window")]
    pub window: usize,

    #[serde(default = "default_medium_threshold")]
    pub medium_threshold: f64,

    #[serde(default = "default_high_threshold")]
    pub high_threshold: f64,

    #[serde(default = "default_base_pause_minutes")]
    pub base_pause_minutes: f64,

    #[serde(default = "default_min_pause_minutes")]
    pub min_pause_minutes: u32,

    #[serde(default = "default_max_pause_minutes")]
    pub max_pause_minutes: u32,
}

const fn default_fatigue_window() -> usize {
    10
}

const fn default_medium_threshold() -> f64 {
    0.4
}

const fn default_high_threshold() -> f64 {
    0.7
}

const fn default_base_pause_minutes() -> f64 {
    15.0
}

const fn default_min_pause_minutes() -> u32 {
    5
}

const fn default_max_pause_minutes() -> u32 {
    60
}

impl Default for FatigueConfig {
    fn default() -> Self {
        Self {
            window: default_fatigue_window(),
            medium_threshold: default_medium_threshold(),
            high_threshold: default_high_threshold(),
            base_pause_minutes: default_base_pause_minutes(),
            min_pause_minutes: default_min_pause_minutes(),
            max_pause_minutes: default_max_pause_minutes(),
        }
    }
}

/// Session lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SessionConfig {
    /// Sessions idle this long are moved to `timeout`
    #[serde(default = "default_idle_timeout_minutes")]
    pub idle_timeout_minutes: u64,

    #[serde(default = "default_min_safety_level")]
    pub default_min_safety_level: u8,
}

const fn default_idle_timeout_minutes() -> u64 {
    30
}

const fn default_min_safety_level() -> u8 {
    2
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_minutes: default_idle_timeout_minutes(),
            default_min_safety_level: default_min_safety_level(),
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes((self.idle_timeout_minutes.min(MAX_HOURS * 60)) as i64)
    }
}

/// Question corpus location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CorpusConfig {
    #[serde(default = "default_corpus_path")]
    pub path: String,
}

fn default_corpus_path() -> String {
    ".portrait/questions.yaml".to_string()
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            path: default_corpus_path(),
        }
    }
}
