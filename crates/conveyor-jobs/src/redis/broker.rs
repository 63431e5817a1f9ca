//! Redis broker implementation.

use super::RedisKeys;
use crate::broker::{AckMode, Broker, Delivery, JobSnapshot, PutOutcome};
use crate::config::JobsConfig;
use crate::error::{JobError, JobsResult};
use crate::job::{Job, JobId, JobResult};
use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::{AsyncCommands, Direction, Script};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Writes ARGV[1] to KEYS[1] with TTL ARGV[2] unless the stored record is
/// already terminal. When ARGV[3] is "1" the record being written is
/// terminal and the submission marker KEYS[2] gets the same TTL. Returns 1
/// when written, 0 otherwise.
const PUT_RESULT_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current then
  local ok, record = pcall(cjson.decode, current)
  if ok and (record['state'] == 'success' or record['state'] == 'failure') then
    return 0
  end
end
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
if ARGV[3] == '1' then
  redis.call('EXPIRE', KEYS[2], ARGV[2])
end
return 1
"#;

/// Redis-backed [`Broker`].
///
/// The queue is a list consumed from the right. With [`AckMode::Late`] a
/// delivery is moved atomically into the consumer's processing list and
/// removed from it on ack; [`Broker::recover`] moves the processing lists
/// of consumers without a live heartbeat back onto the queue.
pub struct RedisBroker {
    pool: Pool,
    keys: RedisKeys,
    ack_mode: AckMode,
    block_timeout: Duration,
    result_ttl: Duration,
    submission_ttl: Duration,
    heartbeat_ttl: Duration,
    put_script: Script,
    closed: AtomicBool,
}

impl RedisBroker {
    /// Create a new Redis broker.
    pub fn new(pool: Pool, config: &JobsConfig) -> Self {
        Self {
            pool,
            keys: RedisKeys::new(&config.redis.key_prefix),
            ack_mode: config.broker.ack_mode,
            block_timeout: Duration::from_secs(config.redis.block_timeout_secs.max(1)),
            result_ttl: config.results.ttl(),
            submission_ttl: config.results.submission_ttl(),
            heartbeat_ttl: config.worker.heartbeat_ttl(),
            put_script: Script::new(PUT_RESULT_SCRIPT),
            closed: AtomicBool::new(false),
        }
    }

    /// Connects using `config.redis` and builds the broker.
    pub async fn connect(config: &JobsConfig) -> JobsResult<Self> {
        let pool = super::create_pool(&config.redis).await?;
        Ok(Self::new(pool, config))
    }

    async fn conn(&self) -> JobsResult<deadpool_redis::Connection> {
        if self.closed.load(Ordering::Acquire) {
            return Err(JobError::Transport("broker is closed".to_string()));
        }
        Ok(self.pool.get().await?)
    }

    /// Pops one entry, blocking for at most `block_timeout`.
    async fn pop(&self, consumer_id: &str) -> JobsResult<Option<String>> {
        let mut conn = self.conn().await?;
        let timeout = self.block_timeout.as_secs_f64();

        match self.ack_mode {
            AckMode::Late => {
                let _: () = conn.sadd(self.keys.consumers(), consumer_id).await?;
                let raw: Option<String> = conn
                    .blmove(
                        self.keys.queue(),
                        self.keys.processing(consumer_id),
                        Direction::Right,
                        Direction::Left,
                        timeout,
                    )
                    .await?;
                Ok(raw)
            }
            AckMode::Early => {
                let popped: Option<(String, String)> = conn.brpop(self.keys.queue(), timeout).await?;
                Ok(popped.map(|(_, raw)| raw))
            }
        }
    }

    /// Moves every in-flight entry of `consumer_id` back onto the queue, oldest
    /// delivered first.
    async fn requeue_consumer(&self, consumer_id: &str) -> JobsResult<u64> {
        let mut conn = self.conn().await?;
        let processing = self.keys.processing(consumer_id);
        let mut moved = 0u64;

        loop {
            let raw: Option<String> = conn
                .lmove(&processing, self.keys.queue(), Direction::Left, Direction::Right)
                .await?;
            if raw.is_none() {
                break;
            }
            moved += 1;
        }

        let _: () = conn.srem(self.keys.consumers(), consumer_id).await?;
        Ok(moved)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    async fn submit(&self, job: &Job) -> JobsResult<()> {
        let raw = job.to_json()?;
        let marker = self.keys.submitted(job.id.as_str());
        let mut conn = self.conn().await?;

        let claimed: Option<String> = redis::cmd("SET")
            .arg(&marker)
            .arg(&job.kind)
            .arg("NX")
            .arg("EX")
            .arg(self.submission_ttl.as_secs().max(1))
            .query_async(&mut *conn)
            .await?;
        if claimed.is_none() {
            return Err(JobError::DuplicateJobId(job.id.to_string()));
        }

        let pushed: Result<(), redis::RedisError> = conn.lpush(self.keys.queue(), &raw).await;
        if let Err(e) = pushed {
            // Release the id so the producer can resubmit it.
            let _: Result<(), redis::RedisError> = conn.del(&marker).await;
            return Err(e.into());
        }

        debug!(job_id = %job.id, kind = %job.kind, "Enqueued job");
        Ok(())
    }

    async fn consume(&self, consumer_id: &str) -> JobsResult<Delivery> {
        loop {
            let Some(raw) = self.pop(consumer_id).await? else {
                continue;
            };

            match Job::from_json(&raw) {
                Ok(job) => {
                    debug!(job_id = %job.id, consumer_id, "Dequeued job");
                    return Ok(Delivery::new(job, consumer_id, raw));
                }
                Err(e) => {
                    error!(error = %e, consumer_id, "Dropping undecodable queue entry");
                    if self.ack_mode == AckMode::Late {
                        let mut conn = self.conn().await?;
                        let _: () = conn.lrem(self.keys.processing(consumer_id), 1, &raw).await?;
                    }
                }
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> JobsResult<()> {
        if self.ack_mode == AckMode::Early {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let _: () = conn
            .lrem(self.keys.processing(&delivery.consumer_id), 1, &delivery.raw)
            .await?;
        Ok(())
    }

    async fn put_result(&self, result: &JobResult) -> JobsResult<PutOutcome> {
        let json = result.to_json()?;
        let mut conn = self.conn().await?;

        let written: i64 = self
            .put_script
            .key(self.keys.result(result.job_id.as_str()))
            .key(self.keys.submitted(result.job_id.as_str()))
            .arg(json)
            .arg(self.result_ttl.as_secs().max(1))
            .arg(if result.is_terminal() { "1" } else { "0" })
            .invoke_async(&mut *conn)
            .await?;

        if written == 1 {
            Ok(PutOutcome::Stored)
        } else {
            Ok(PutOutcome::AlreadyTerminal)
        }
    }

    async fn get_result(&self, job_id: &JobId) -> JobsResult<Option<JobResult>> {
        let mut conn = self.conn().await?;
        let json: Option<String> = conn.get(self.keys.result(job_id.as_str())).await?;
        json.as_deref().map(JobResult::from_json).transpose()
    }

    async fn is_submitted(&self, job_id: &JobId) -> JobsResult<bool> {
        let mut conn = self.conn().await?;
        let exists: bool = conn.exists(self.keys.submitted(job_id.as_str())).await?;
        Ok(exists)
    }

    async fn snapshot(&self, job_id: &JobId) -> JobsResult<JobSnapshot> {
        let mut conn = self.conn().await?;
        let keys = [
            self.keys.result(job_id.as_str()),
            self.keys.submitted(job_id.as_str()),
        ];
        let (json, marker): (Option<String>, Option<String>) = conn.mget(&keys).await?;
        Ok(JobSnapshot {
            result: json.as_deref().map(JobResult::from_json).transpose()?,
            submitted: marker.is_some(),
        })
    }

    async fn heartbeat(&self, consumer_id: &str) -> JobsResult<()> {
        let mut conn = self.conn().await?;
        let _: () = redis::pipe()
            .set_ex(
                self.keys.consumer(consumer_id),
                chrono::Utc::now().timestamp_millis(),
                self.heartbeat_ttl.as_secs().max(1),
            )
            .ignore()
            .sadd(self.keys.consumers(), consumer_id)
            .ignore()
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn recover(&self) -> JobsResult<u64> {
        if self.ack_mode == AckMode::Early {
            return Ok(0);
        }

        let consumers: Vec<String> = {
            let mut conn = self.conn().await?;
            conn.smembers(self.keys.consumers()).await?
        };

        let mut recovered = 0u64;
        for consumer_id in consumers {
            let alive: bool = {
                let mut conn = self.conn().await?;
                conn.exists(self.keys.consumer(&consumer_id)).await?
            };
            if alive {
                continue;
            }

            let moved = self.requeue_consumer(&consumer_id).await?;
            if moved > 0 {
                warn!(consumer_id = %consumer_id, count = moved, "Requeued deliveries of dead consumer");
            }
            recovered += moved;
        }

        if recovered > 0 {
            info!(count = recovered, "Recovered in-flight jobs");
        }
        Ok(recovered)
    }

    async fn queue_length(&self) -> JobsResult<u64> {
        let mut conn = self.conn().await?;
        let len: u64 = conn.llen(self.keys.queue()).await?;
        Ok(len)
    }

    async fn health_check(&self) -> JobsResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<String>(&mut *conn).await?;
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.pool.close();
            info!("Redis broker closed");
        }
    }
}
