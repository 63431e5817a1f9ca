//! End-to-end tests: Dispatcher -> InMemoryBroker -> WorkerPool -> StatusResolver.

use conveyor_jobs::{
    AckMode, ArgType, Backoff, Broker, Dispatcher, FailureKind, HandlerError, InMemoryBroker,
    JobArguments, JobError, JobId, JobRegistry, JobStatus, KindDefinition, StatusResolver,
    WorkerPool, WorkerPoolConfig,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    broker: Arc<InMemoryBroker>,
    dispatcher: Dispatcher,
    resolver: StatusResolver,
    registry: Arc<JobRegistry>,
}

fn pool_config() -> WorkerPoolConfig {
    WorkerPoolConfig {
        concurrency: 3,
        shutdown_timeout: Duration::from_secs(5),
        heartbeat_interval: Duration::from_millis(50),
        recovery_interval: Duration::from_millis(100),
        backoff: Backoff::fixed(Duration::from_millis(10)),
        result_retries: 2,
    }
}

fn harness(registry: JobRegistry) -> Harness {
    let broker = Arc::new(InMemoryBroker::new(AckMode::Late));
    let registry = Arc::new(registry);
    Harness {
        dispatcher: Dispatcher::new(broker.clone(), registry.clone()),
        resolver: StatusResolver::new(broker.clone()),
        broker,
        registry,
    }
}

impl Harness {
    fn pool(&self) -> WorkerPool {
        WorkerPool::new(self.broker.clone(), self.registry.clone(), pool_config())
    }

    async fn wait_terminal(&self, id: &JobId) -> JobStatus {
        for _ in 0..500 {
            let status = self.resolver.status(id).await.unwrap();
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} did not reach a terminal state", id);
    }
}

fn registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry
        .register(
            KindDefinition::new("upper", |args: &JobArguments| -> Result<Value, HandlerError> {
                Ok(json!({ "text": args.require_str("text")?.to_uppercase() }))
            })
            .param("text", ArgType::String),
        )
        .unwrap();
    registry
        .register(
            KindDefinition::new("refuse", |_: &JobArguments| -> Result<Value, HandlerError> {
                Err(HandlerError::new("refused to work").with_detail(json!({"code": 7})))
            }),
        )
        .unwrap();
    registry
        .register(
            KindDefinition::new("slow", |args: &JobArguments| -> Result<Value, HandlerError> {
                let ms = args.require_i64("ms")?;
                std::thread::sleep(Duration::from_millis(ms as u64));
                Ok(json!("finished"))
            })
            .deadline(Duration::from_millis(100))
            .param("ms", ArgType::Integer),
        )
        .unwrap();
    registry
}

#[tokio::test]
async fn test_immediate_status_is_pending_before_workers_run() {
    let h = harness(registry());
    let id = h
        .dispatcher
        .enqueue("upper", JobArguments::new().with("text", "abc"))
        .await
        .unwrap();

    assert_eq!(h.resolver.status(&id).await.unwrap(), JobStatus::Pending);
}

#[tokio::test]
async fn test_success_converges_with_exact_payload() {
    let h = harness(registry());
    let pool = h.pool();
    pool.start().await.unwrap();

    let id = h
        .dispatcher
        .enqueue("upper", JobArguments::new().with("text", "quiet"))
        .await
        .unwrap();

    let status = h.wait_terminal(&id).await;
    assert_eq!(status, JobStatus::Succeeded { result: json!({"text": "QUIET"}) });

    // Repeated polling returns the same terminal value.
    for _ in 0..3 {
        assert_eq!(h.resolver.status(&id).await.unwrap(), status);
    }
    pool.shutdown().await;
}

#[tokio::test]
async fn test_handler_error_is_recorded_verbatim() {
    let h = harness(registry());
    let pool = h.pool();
    pool.start().await.unwrap();

    let id = h.dispatcher.enqueue("refuse", JobArguments::new()).await.unwrap();

    match h.wait_terminal(&id).await {
        JobStatus::Failed { error } => {
            assert_eq!(error.kind, FailureKind::HandlerError);
            assert_eq!(error.message, "refused to work");
            assert_eq!(error.detail, Some(json!({"code": 7})));
        }
        other => panic!("unexpected status {:?}", other),
    }
    pool.shutdown().await;
}

#[tokio::test]
async fn test_deadline_exceeded_is_final() {
    let h = harness(registry());
    let pool = h.pool();
    pool.start().await.unwrap();

    let id = h
        .dispatcher
        .enqueue("slow", JobArguments::new().with("ms", 600))
        .await
        .unwrap();

    let status = h.wait_terminal(&id).await;
    match &status {
        JobStatus::Failed { error } => assert_eq!(error.kind, FailureKind::DeadlineExceeded),
        other => panic!("unexpected status {:?}", other),
    }

    // The abandoned handler finishes after this; its output must not land.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(h.resolver.status(&id).await.unwrap(), status);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_fast_handler_within_deadline_succeeds() {
    let h = harness(registry());
    let pool = h.pool();
    pool.start().await.unwrap();

    let id = h
        .dispatcher
        .enqueue("slow", JobArguments::new().with("ms", 5))
        .await
        .unwrap();

    assert_eq!(
        h.wait_terminal(&id).await,
        JobStatus::Succeeded { result: json!("finished") }
    );
    pool.shutdown().await;
}

#[tokio::test]
async fn test_never_submitted_id_is_not_found() {
    let h = harness(registry());
    let err = h.resolver.status(&JobId::from("missing")).await.unwrap_err();
    assert!(matches!(err, JobError::NotFound(_)));
}

#[tokio::test]
async fn test_unknown_kind_rejected_at_enqueue() {
    let h = harness(registry());
    let err = h
        .dispatcher
        .enqueue("resize", JobArguments::new())
        .await
        .unwrap_err();

    assert!(matches!(err, JobError::UnknownKind(_)));
    assert_eq!(h.broker.queue_length().await.unwrap(), 0);
}

#[tokio::test]
async fn test_unknown_kind_at_execution_recorded_as_failure() {
    // Producer and worker disagree about the registered kinds.
    let h = harness(registry());
    let worker_registry = Arc::new(JobRegistry::new());
    let pool = WorkerPool::new(h.broker.clone(), worker_registry, pool_config());
    pool.start().await.unwrap();

    let id = h
        .dispatcher
        .enqueue("upper", JobArguments::new().with("text", "x"))
        .await
        .unwrap();

    match h.wait_terminal(&id).await {
        JobStatus::Failed { error } => assert_eq!(error.kind, FailureKind::UnknownKind),
        other => panic!("unexpected status {:?}", other),
    }
    pool.shutdown().await;
}

#[tokio::test]
async fn test_many_jobs_all_converge() {
    let h = harness(registry());
    let pool = h.pool();
    pool.start().await.unwrap();

    let mut ids = Vec::new();
    for n in 0..20 {
        let id = h
            .dispatcher
            .enqueue("upper", JobArguments::new().with("text", format!("job{}", n)))
            .await
            .unwrap();
        ids.push((n, id));
    }

    for (n, id) in ids {
        assert_eq!(
            h.wait_terminal(&id).await,
            JobStatus::Succeeded { result: json!({"text": format!("JOB{}", n)}) }
        );
    }

    pool.shutdown().await;
    assert_eq!(pool.stats().jobs_succeeded, 20);
    assert_eq!(h.broker.in_flight_len(), 0);
}

#[tokio::test]
async fn test_crashed_consumer_job_is_redelivered_and_runs_again() {
    let runs = Arc::new(AtomicU32::new(0));
    let mut registry = JobRegistry::new();
    {
        let runs = runs.clone();
        registry
            .register(KindDefinition::new("count", move |_: &JobArguments| -> Result<Value, HandlerError> {
                Ok(json!(runs.fetch_add(1, Ordering::SeqCst) + 1))
            }))
            .unwrap();
    }

    let broker = Arc::new(
        InMemoryBroker::new(AckMode::Late).with_heartbeat_ttl(Duration::from_millis(100)),
    );
    let registry = Arc::new(registry);
    let dispatcher = Dispatcher::new(broker.clone(), registry.clone());
    let resolver = StatusResolver::new(broker.clone());

    let id = dispatcher.enqueue("count", JobArguments::new()).await.unwrap();

    // A consumer takes the job and dies without acknowledging it.
    broker.heartbeat("crashed").await.unwrap();
    let lost = broker.consume("crashed").await.unwrap();
    assert_eq!(lost.job.id, id);
    tokio::time::sleep(Duration::from_millis(150)).await;

    let pool = WorkerPool::new(broker.clone(), registry, pool_config());
    pool.start().await.unwrap();

    let mut status = resolver.status(&id).await.unwrap();
    for _ in 0..500 {
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        status = resolver.status(&id).await.unwrap();
    }
    assert_eq!(status, JobStatus::Succeeded { result: json!(1) });
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    pool.shutdown().await;
}
