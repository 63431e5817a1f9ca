//! Producer-facing entry point: validate, build and submit jobs.

use crate::broker::Broker;
use crate::config::DispatchConfig;
use crate::error::JobsResult;
use crate::job::{Job, JobArguments, JobId};
use crate::metrics::JobMetrics;
use crate::registry::JobRegistry;
use crate::retry::{with_retries, Backoff};
use std::sync::Arc;
use tracing::{debug, info};

/// Submits jobs on behalf of producers.
///
/// The kind and arguments are checked against the registry before anything
/// reaches the broker, so an unknown kind or malformed arguments never
/// produce a job id.
#[derive(Clone)]
pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    registry: Arc<JobRegistry>,
    submit_retries: u32,
    backoff: Backoff,
}

impl Dispatcher {
    pub fn new(broker: Arc<dyn Broker>, registry: Arc<JobRegistry>) -> Self {
        Self::with_config(broker, registry, &DispatchConfig::default())
    }

    pub fn with_config(broker: Arc<dyn Broker>, registry: Arc<JobRegistry>, config: &DispatchConfig) -> Self {
        Self {
            broker,
            registry,
            submit_retries: config.submit_retries,
            backoff: Backoff::from(&config.backoff),
        }
    }

    /// Enqueues a job under a fresh id and returns the id.
    ///
    /// Fails with `UnknownKind`, `InvalidArguments` or `Transport`. The job
    /// is not executed synchronously.
    pub async fn enqueue(&self, kind: &str, arguments: JobArguments) -> JobsResult<JobId> {
        self.enqueue_with_id(JobId::new(), kind, arguments).await
    }

    /// Enqueues a job under a producer-supplied id.
    ///
    /// Fails additionally with `DuplicateJobId` if the id was already
    /// submitted and has not expired.
    pub async fn enqueue_with_id(&self, id: JobId, kind: &str, arguments: JobArguments) -> JobsResult<JobId> {
        let entry = self.registry.lookup(kind)?;
        entry.validate(&arguments)?;

        let job = Job::with_id(id, kind, arguments);
        with_retries("submit", self.submit_retries, &self.backoff, || {
            self.broker.submit(&job)
        })
        .await?;

        JobMetrics::job_submitted(kind);
        info!(job_id = %job.id, kind = %kind, "Job submitted");
        debug!(arguments = job.arguments.len(), "Submitted job arguments");

        Ok(job.id)
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::AckMode;
    use crate::error::JobError;
    use crate::memory::InMemoryBroker;
    use crate::registry::{ArgType, HandlerError, KindDefinition};
    use serde_json::Value;

    fn dispatcher() -> (Arc<InMemoryBroker>, Dispatcher) {
        let mut registry = JobRegistry::new();
        registry
            .register(
                KindDefinition::new("echo", |args: &JobArguments| -> Result<Value, HandlerError> {
                    Ok(Value::from(args.clone()))
                })
                .param("text", ArgType::String),
            )
            .unwrap();
        let broker = Arc::new(InMemoryBroker::new(AckMode::Late));
        let dispatcher = Dispatcher::new(broker.clone(), Arc::new(registry));
        (broker, dispatcher)
    }

    #[tokio::test]
    async fn test_enqueue_returns_unique_ids() {
        let (broker, dispatcher) = dispatcher();
        let a = dispatcher
            .enqueue("echo", JobArguments::new().with("text", "a"))
            .await
            .unwrap();
        let b = dispatcher
            .enqueue("echo", JobArguments::new().with("text", "a"))
            .await
            .unwrap();

        assert_ne!(a, b);
        assert_eq!(broker.queue_length().await.unwrap(), 2);
        assert!(broker.is_submitted(&a).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_kind_enqueues_nothing() {
        let (broker, dispatcher) = dispatcher();
        let err = dispatcher
            .enqueue("resize", JobArguments::new())
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::UnknownKind(k) if k == "resize"));
        assert_eq!(broker.queue_length().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_arguments_rejected() {
        let (broker, dispatcher) = dispatcher();
        let err = dispatcher
            .enqueue("echo", JobArguments::new().with("text", 5))
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::InvalidArguments { .. }));
        assert_eq!(broker.queue_length().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_id_not_retried() {
        let (broker, dispatcher) = dispatcher();
        let id = JobId::from("order-42");
        dispatcher
            .enqueue_with_id(id.clone(), "echo", JobArguments::new().with("text", "x"))
            .await
            .unwrap();

        let err = dispatcher
            .enqueue_with_id(id, "echo", JobArguments::new().with("text", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::DuplicateJobId(_)));
        assert_eq!(broker.queue_length().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_closed_broker_is_transport_error() {
        let (broker, dispatcher) = dispatcher();
        broker.close().await;

        let err = dispatcher
            .enqueue("echo", JobArguments::new().with("text", "x"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
