//! Job and result records.

use crate::error::JobsResult;
use crate::registry::HandlerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Creates a job ID from a string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the job ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Named job arguments, kept in submission order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobArguments(Map<String, Value>);

impl JobArguments {
    /// Creates an empty argument bundle.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Adds an argument, builder style.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Inserts or replaces an argument.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over `(name, value)` pairs in submission order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Returns a required string argument.
    pub fn require_str(&self, name: &str) -> Result<&str, HandlerError> {
        match self.0.get(name) {
            Some(Value::String(s)) => Ok(s),
            Some(_) => Err(HandlerError::new(format!("argument '{}' must be a string", name))),
            None => Err(HandlerError::new(format!("missing argument '{}'", name))),
        }
    }

    /// Returns a required integer argument.
    pub fn require_i64(&self, name: &str) -> Result<i64, HandlerError> {
        match self.0.get(name) {
            Some(v) => v
                .as_i64()
                .ok_or_else(|| HandlerError::new(format!("argument '{}' must be an integer", name))),
            None => Err(HandlerError::new(format!("missing argument '{}'", name))),
        }
    }
}

impl From<Map<String, Value>> for JobArguments {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<JobArguments> for Value {
    fn from(args: JobArguments) -> Self {
        Value::Object(args.0)
    }
}

/// A submitted unit of work. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job ID.
    pub id: JobId,

    /// Kind name used to resolve the handler.
    pub kind: String,

    /// Handler arguments.
    pub arguments: JobArguments,

    /// When the job was submitted.
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    /// Creates a job with a fresh id.
    pub fn new(kind: impl Into<String>, arguments: JobArguments) -> Self {
        Self::with_id(JobId::new(), kind, arguments)
    }

    /// Creates a job with a producer-supplied id.
    pub fn with_id(id: JobId, kind: impl Into<String>, arguments: JobArguments) -> Self {
        Self {
            id,
            kind: kind.into(),
            arguments,
            submitted_at: Utc::now(),
        }
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> JobsResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> JobsResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Stored lifecycle state of a job.
///
/// Pending is not a stored state: a submitted job without a result record is
/// pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultState {
    /// A worker has begun executing the job.
    Started,
    /// The handler returned a payload before its deadline.
    Success,
    /// The job failed; see [`JobFailure`].
    Failure,
}

impl ResultState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ResultState::Success | ResultState::Failure)
    }

    /// Whether a record in state `self` may be overwritten by `next`.
    ///
    /// `Started -> Started` is allowed so a redelivered job can record a new
    /// attempt. Terminal states are final.
    pub fn can_transition_to(self, _next: ResultState) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for ResultState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultState::Started => write!(f, "started"),
            ResultState::Success => write!(f, "success"),
            ResultState::Failure => write!(f, "failure"),
        }
    }
}

/// Category of a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No handler was registered for the kind when a worker picked it up.
    UnknownKind,
    /// The stored arguments were rejected before execution.
    InvalidArguments,
    /// The handler ran and reported a failure.
    HandlerError,
    /// The handler did not finish within its deadline.
    DeadlineExceeded,
    /// The handler panicked.
    Panicked,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::UnknownKind => write!(f, "unknown_kind"),
            FailureKind::InvalidArguments => write!(f, "invalid_arguments"),
            FailureKind::HandlerError => write!(f, "handler_error"),
            FailureKind::DeadlineExceeded => write!(f, "deadline_exceeded"),
            FailureKind::Panicked => write!(f, "panicked"),
        }
    }
}

/// Structured failure carried by a `Failure` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl JobFailure {
    pub fn unknown_kind(kind: &str) -> Self {
        Self {
            kind: FailureKind::UnknownKind,
            message: format!("No handler registered for job kind: {}", kind),
            detail: None,
        }
    }

    pub fn invalid_arguments(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::InvalidArguments,
            message: reason.into(),
            detail: None,
        }
    }

    pub fn handler(error: HandlerError) -> Self {
        Self {
            kind: FailureKind::HandlerError,
            message: error.message,
            detail: error.detail,
        }
    }

    pub fn deadline_exceeded(deadline: Duration) -> Self {
        Self {
            kind: FailureKind::DeadlineExceeded,
            message: format!("Job exceeded its deadline of {} ms", deadline.as_millis()),
            detail: Some(serde_json::json!({ "deadline_ms": deadline.as_millis() as u64 })),
        }
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Panicked,
            message: message.into(),
            detail: None,
        }
    }
}

/// Result record stored per job id in the broker's result store.
///
/// `payload` is present iff `state == Success`; `error` is present iff
/// `state == Failure`. The constructors are the only way to produce a
/// terminal record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub kind: String,
    pub state: ResultState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// Execution attempt (1-based); greater than 1 after a redelivery.
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobResult {
    /// Record for a job a worker has just begun executing.
    pub fn started(job: &Job, worker_id: impl Into<String>, attempt: u32) -> Self {
        Self {
            job_id: job.id.clone(),
            kind: job.kind.clone(),
            state: ResultState::Started,
            payload: None,
            error: None,
            worker_id: Some(worker_id.into()),
            attempt,
            started_at: Some(Utc::now()),
            finished_at: None,
        }
    }

    /// Failure recorded before any execution started (e.g. unknown kind).
    pub fn rejected(job: &Job, worker_id: impl Into<String>, attempt: u32, failure: JobFailure) -> Self {
        Self {
            job_id: job.id.clone(),
            kind: job.kind.clone(),
            state: ResultState::Failure,
            payload: None,
            error: Some(failure),
            worker_id: Some(worker_id.into()),
            attempt,
            started_at: None,
            finished_at: Some(Utc::now()),
        }
    }

    /// Terminal success derived from a started record.
    pub fn succeed(self, payload: Value) -> Self {
        Self {
            state: ResultState::Success,
            payload: Some(payload),
            error: None,
            finished_at: Some(Utc::now()),
            ..self
        }
    }

    /// Terminal failure derived from a started record.
    pub fn fail(self, failure: JobFailure) -> Self {
        Self {
            state: ResultState::Failure,
            payload: None,
            error: Some(failure),
            finished_at: Some(Utc::now()),
            ..self
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Execution time, when both timestamps are known.
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            _ => None,
        }
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> JobsResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> JobsResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
