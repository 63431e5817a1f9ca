//! Redis-backed broker.

mod broker;

pub use broker::RedisBroker;

use crate::config::RedisConfig;
use crate::error::{JobError, JobsResult};
use deadpool_redis::{Config, Pool, Runtime};
use tracing::info;

/// Create a Redis connection pool and verify it with a PING.
///
/// Each blocked consumer holds one connection for up to
/// `block_timeout_secs`, so the pool must be larger than the worker
/// concurrency. [`JobsConfig::validate`](crate::JobsConfig::validate)
/// rejects configurations where it is not.
pub async fn create_pool(config: &RedisConfig) -> JobsResult<Pool> {
    info!(pool_size = config.pool_size, "Creating Redis connection pool for job broker");

    let pool = Config::from_url(&config.url)
        .builder()
        .map_err(|e| JobError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(config.pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| JobError::Configuration(format!("Failed to create pool: {}", e)))?;

    let mut conn = pool.get().await?;
    redis::cmd("PING").query_async::<String>(&mut *conn).await?;

    info!("Redis connection pool ready");
    Ok(pool)
}

/// Key layout under a common prefix.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Pending jobs (list; producers push left, consumers pop right).
    pub fn queue(&self) -> String {
        format!("{}:queue", self.prefix)
    }

    /// Deliveries held by one consumer until acknowledged (list).
    pub fn processing(&self, consumer_id: &str) -> String {
        format!("{}:processing:{}", self.prefix, consumer_id)
    }

    /// Result record for a job (string, JSON, with TTL).
    pub fn result(&self, job_id: &str) -> String {
        format!("{}:result:{}", self.prefix, job_id)
    }

    /// Submission marker for a job (string, with TTL).
    pub fn submitted(&self, job_id: &str) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    /// Consumer heartbeat (string, with TTL).
    pub fn consumer(&self, consumer_id: &str) -> String {
        format!("{}:consumer:{}", self.prefix, consumer_id)
    }

    /// Every consumer that may hold in-flight deliveries (set).
    pub fn consumers(&self) -> String {
        format!("{}:consumers", self.prefix)
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new("conveyor:jobs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_keys() {
        let keys = RedisKeys::new("test");

        assert_eq!(keys.queue(), "test:queue");
        assert_eq!(keys.processing("w1"), "test:processing:w1");
        assert_eq!(keys.result("123"), "test:result:123");
        assert_eq!(keys.submitted("123"), "test:job:123");
        assert_eq!(keys.consumer("w1"), "test:consumer:w1");
        assert_eq!(keys.consumers(), "test:consumers");
    }
}
