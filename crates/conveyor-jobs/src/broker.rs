//! Broker abstraction: job transport plus keyed result store.

use crate::error::JobsResult;
use crate::job::{Job, JobId, JobResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// When a consumed job is removed from the broker for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// At-least-once. The delivery stays in the consumer's in-flight list
    /// until [`Broker::ack`]; a consumer that stops heartbeating has its
    /// in-flight deliveries requeued by [`Broker::recover`].
    #[default]
    Late,
    /// At-most-once. The delivery is removed when consumed; a worker crash
    /// loses the job.
    Early,
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckMode::Late => write!(f, "late"),
            AckMode::Early => write!(f, "early"),
        }
    }
}

/// A job handed to one consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: Job,
    /// Consumer that received the job.
    pub consumer_id: String,
    /// Encoded queue entry, used to acknowledge the exact message.
    pub(crate) raw: String,
}

impl Delivery {
    pub(crate) fn new(job: Job, consumer_id: impl Into<String>, raw: String) -> Self {
        Self {
            job,
            consumer_id: consumer_id.into(),
            raw,
        }
    }
}

/// Outcome of a result write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    /// A terminal result already exists for the id; nothing was written.
    AlreadyTerminal,
}

/// Result record and submission marker of one job, read together.
#[derive(Debug, Clone, Default)]
pub struct JobSnapshot {
    pub result: Option<JobResult>,
    pub submitted: bool,
}

/// Durable ordered channel from producers to workers, plus a result store
/// addressable by job id.
///
/// Jobs are delivered FIFO per producer. Each submitted job is delivered to
/// one consumer at a time; whether it can be redelivered after a consumer
/// crash depends on the broker's [`AckMode`].
#[async_trait]
pub trait Broker: Send + Sync {
    /// Acknowledgment policy this broker was built with.
    fn ack_mode(&self) -> AckMode;

    /// Enqueues a job and records its id as submitted.
    ///
    /// Fails with `DuplicateJobId` if the id is already known and with
    /// `Transport` if the broker is unreachable.
    async fn submit(&self, job: &Job) -> JobsResult<()>;

    /// Waits until a job is available and hands it to `consumer_id`.
    async fn consume(&self, consumer_id: &str) -> JobsResult<Delivery>;

    /// Removes a delivery from the consumer's in-flight list.
    async fn ack(&self, delivery: &Delivery) -> JobsResult<()>;

    /// Writes a result record unless a terminal one already exists.
    async fn put_result(&self, result: &JobResult) -> JobsResult<PutOutcome>;

    /// Reads the result record for a job, if any.
    async fn get_result(&self, job_id: &JobId) -> JobsResult<Option<JobResult>>;

    /// Whether the id was submitted and its submission marker has not
    /// expired.
    async fn is_submitted(&self, job_id: &JobId) -> JobsResult<bool>;

    /// Reads the result record and the submission marker together.
    ///
    /// Brokers override this to answer with a single read; the default
    /// falls back to two calls.
    async fn snapshot(&self, job_id: &JobId) -> JobsResult<JobSnapshot> {
        let result = self.get_result(job_id).await?;
        let submitted = self.is_submitted(job_id).await?;
        Ok(JobSnapshot { result, submitted })
    }

    /// Marks `consumer_id` as alive.
    async fn heartbeat(&self, consumer_id: &str) -> JobsResult<()>;

    /// Requeues in-flight deliveries of consumers whose heartbeat expired.
    /// Returns the number of requeued jobs.
    async fn recover(&self) -> JobsResult<u64>;

    /// Number of jobs waiting to be consumed.
    async fn queue_length(&self) -> JobsResult<u64>;

    async fn health_check(&self) -> JobsResult<()>;

    /// Releases broker resources. Subsequent calls fail with `Transport`.
    async fn close(&self);
}
