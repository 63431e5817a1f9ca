//! Status resolution for polling clients.

use crate::broker::Broker;
use crate::error::{JobError, JobsResult};
use crate::job::{FailureKind, JobFailure, JobId, JobResult, ResultState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Client-visible state of a job.
///
/// Serialized as `{"status": "pending" | "running" | "success" | "failure"}`
/// plus `result` on success or `error` on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    /// Submitted, not yet picked up by a worker.
    Pending,
    /// A worker is executing the job.
    Running,
    #[serde(rename = "success")]
    Succeeded { result: Value },
    #[serde(rename = "failure")]
    Failed { error: JobFailure },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded { .. } | JobStatus::Failed { .. })
    }

    /// Short state name as used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded { .. } => "success",
            JobStatus::Failed { .. } => "failure",
        }
    }
}

impl From<JobResult> for JobStatus {
    fn from(result: JobResult) -> Self {
        match result.state {
            ResultState::Started => JobStatus::Running,
            ResultState::Success => JobStatus::Succeeded {
                result: result.payload.unwrap_or(Value::Null),
            },
            ResultState::Failure => JobStatus::Failed {
                error: result.error.unwrap_or_else(|| JobFailure {
                    kind: FailureKind::HandlerError,
                    message: "Job failed without an error record".to_string(),
                    detail: None,
                }),
            },
        }
    }
}

/// Read-only view over the broker's result store.
#[derive(Clone)]
pub struct StatusResolver {
    broker: Arc<dyn Broker>,
}

impl StatusResolver {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Resolves the status of a job.
    ///
    /// A missing result means Pending only if the id was submitted; an id the
    /// broker has never seen (or whose records expired) is `NotFound`.
    pub async fn status(&self, job_id: &JobId) -> JobsResult<JobStatus> {
        let snapshot = self.broker.snapshot(job_id).await?;
        match snapshot.result {
            Some(result) => Ok(result.into()),
            None if snapshot.submitted => Ok(JobStatus::Pending),
            None => Err(JobError::NotFound(job_id.to_string())),
        }
    }

    /// Full result record, for callers that want timestamps and attempts.
    pub async fn result(&self, job_id: &JobId) -> JobsResult<Option<JobResult>> {
        self.broker.get_result(job_id).await
    }
}
