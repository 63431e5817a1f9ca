//! Job subsystem configuration.

use crate::broker::AckMode;
use crate::error::{JobError, JobsResult};
use crate::registry::DEFAULT_DEADLINE;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Configuration for the job subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Broker selection and acknowledgment policy.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Redis connection configuration.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Worker pool configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Result store retention.
    #[serde(default)]
    pub results: ResultsConfig,

    /// Producer-side settings.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Per-kind overrides, keyed by kind name.
    #[serde(default)]
    pub kinds: BTreeMap<String, KindConfig>,

    /// Deadline for kinds with neither an override nor a built-in default.
    #[serde(default = "default_deadline_secs")]
    pub default_deadline_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            redis: RedisConfig::default(),
            worker: WorkerConfig::default(),
            results: ResultsConfig::default(),
            dispatch: DispatchConfig::default(),
            kinds: BTreeMap::new(),
            default_deadline_secs: default_deadline_secs(),
        }
    }
}

fn default_deadline_secs() -> u64 {
    DEFAULT_DEADLINE.as_secs()
}

impl JobsConfig {
    /// Deadline for `kind`: configured override, else `builtin`, else the
    /// global default.
    pub fn deadline_for(&self, kind: &str, builtin: Option<Duration>) -> Duration {
        self.kinds
            .get(kind)
            .map(|k| Duration::from_secs(k.deadline_secs))
            .or(builtin)
            .unwrap_or_else(|| Duration::from_secs(self.default_deadline_secs))
    }

    /// Rejects settings the pool or brokers cannot run with.
    pub fn validate(&self) -> JobsResult<()> {
        if self.worker.concurrency == 0 {
            return Err(JobError::Configuration(
                "worker.concurrency must be at least 1".to_string(),
            ));
        }
        if self.default_deadline_secs == 0 {
            return Err(JobError::Configuration(
                "default_deadline_secs must be greater than zero".to_string(),
            ));
        }
        if let Some((kind, _)) = self.kinds.iter().find(|(_, k)| k.deadline_secs == 0) {
            return Err(JobError::Configuration(format!(
                "kinds.{}.deadline_secs must be greater than zero",
                kind
            )));
        }
        if self.results.ttl_secs == 0 {
            return Err(JobError::Configuration(
                "results.ttl_secs must be greater than zero".to_string(),
            ));
        }
        if self.broker.backend == BrokerBackend::Redis && self.redis.url.is_empty() {
            return Err(JobError::Configuration(
                "redis.url is required for the redis broker".to_string(),
            ));
        }
        if self.broker.backend == BrokerBackend::Redis
            && self.redis.pool_size <= self.worker.concurrency
        {
            return Err(JobError::Configuration(format!(
                "redis.pool_size ({}) must exceed worker.concurrency ({})",
                self.redis.pool_size, self.worker.concurrency
            )));
        }
        if self.worker.heartbeat_ttl_secs <= self.worker.heartbeat_interval_secs {
            return Err(JobError::Configuration(
                "worker.heartbeat_ttl_secs must exceed worker.heartbeat_interval_secs".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which broker implementation to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    #[default]
    Redis,
    /// Process-local broker; jobs do not survive a restart.
    Memory,
}

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BrokerConfig {
    #[serde(default)]
    pub backend: BrokerBackend,

    #[serde(default)]
    pub ack_mode: AckMode,
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Key prefix for all job-related keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Seconds a blocking pop waits before re-polling.
    #[serde(default = "default_block_timeout")]
    pub block_timeout_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            key_prefix: default_key_prefix(),
            block_timeout_secs: default_block_timeout(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379/0".to_string()
}

fn default_pool_size() -> usize {
    16
}

fn default_key_prefix() -> String {
    "conveyor:jobs".to_string()
}

fn default_block_timeout() -> u64 {
    5
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent workers.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Heartbeat interval in seconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Seconds after the last heartbeat before a consumer counts as dead.
    #[serde(default = "default_heartbeat_ttl")]
    pub heartbeat_ttl_secs: u64,

    /// Interval between recovery sweeps in seconds.
    #[serde(default = "default_recovery_interval")]
    pub recovery_interval_secs: u64,

    /// Backoff after broker transport errors.
    #[serde(default)]
    pub backoff: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_ttl_secs: default_heartbeat_ttl(),
            recovery_interval_secs: default_recovery_interval(),
            backoff: RetryConfig::default(),
        }
    }
}

/// One worker per core, capped at half the default Redis pool.
fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
        .min(default_pool_size() / 2)
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_heartbeat_ttl() -> u64 {
    30
}

fn default_recovery_interval() -> u64 {
    30
}

impl WorkerConfig {
    /// Returns shutdown timeout as Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Returns heartbeat interval as Duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Returns heartbeat TTL as Duration.
    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs)
    }

    /// Returns recovery interval as Duration.
    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }
}

/// Result store retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsConfig {
    /// How long a result stays readable, in seconds.
    #[serde(default = "default_result_ttl")]
    pub ttl_secs: u64,

    /// How long a submitted id is remembered, in seconds.
    #[serde(default = "default_submission_ttl")]
    pub submission_ttl_secs: u64,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_result_ttl(),
            submission_ttl_secs: default_submission_ttl(),
        }
    }
}

fn default_result_ttl() -> u64 {
    86400 // 1 day
}

fn default_submission_ttl() -> u64 {
    86400 * 7 // 7 days
}

impl ResultsConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn submission_ttl(&self) -> Duration {
        Duration::from_secs(self.submission_ttl_secs)
    }
}

/// Producer-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Extra submit attempts after a transport error.
    #[serde(default = "default_submit_retries")]
    pub submit_retries: u32,

    /// Backoff between submit attempts.
    #[serde(default = "default_dispatch_backoff")]
    pub backoff: RetryConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            submit_retries: default_submit_retries(),
            backoff: default_dispatch_backoff(),
        }
    }
}

fn default_submit_retries() -> u32 {
    2
}

fn default_dispatch_backoff() -> RetryConfig {
    RetryConfig {
        initial_delay_ms: 50,
        max_delay_ms: 1000,
        multiplier: 2.0,
    }
}

/// Per-kind settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindConfig {
    /// Execution deadline in seconds.
    pub deadline_secs: u64,
}

/// Exponential backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Initial delay in milliseconds.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
        }
    }
}

fn default_initial_delay() -> u64 {
    200
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}
