//! Worker pool: consumes jobs, enforces deadlines, records results.
//!
//! Every job goes through the same steps:
//!
//! 1. A redelivered job that already has a terminal result is acknowledged
//!    without running again.
//! 2. The kind is resolved and the arguments validated; a failure here is
//!    recorded as a `Failure` without executing anything.
//! 3. A `Started` record is written, then the handler runs on the blocking
//!    pool under the kind's deadline.
//! 4. The outcome is written. If the deadline elapsed the handler thread is
//!    abandoned and whatever it returns later is discarded; only the pool
//!    writes results, so a timed-out job can never turn into a success.

use crate::broker::{Broker, Delivery, PutOutcome};
use crate::config::WorkerConfig;
use crate::error::{JobError, JobsResult};
use crate::job::{JobFailure, JobResult};
use crate::metrics::{JobMetrics, WorkerMetrics};
use crate::registry::JobRegistry;
use crate::retry::{with_retries, Backoff};
use chrono::Utc;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers.
    pub concurrency: usize,

    /// How long `shutdown` waits for in-flight jobs.
    pub shutdown_timeout: Duration,

    /// Heartbeat interval.
    pub heartbeat_interval: Duration,

    /// Interval between recovery sweeps.
    pub recovery_interval: Duration,

    /// Backoff after broker transport errors.
    pub backoff: Backoff,

    /// Extra attempts for result writes that fail with a transport error.
    pub result_retries: u32,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for WorkerPoolConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            shutdown_timeout: config.shutdown_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            recovery_interval: config.recovery_interval(),
            backoff: Backoff::from(&config.backoff),
            result_retries: 5,
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

#[derive(Default)]
struct Counters {
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    active: AtomicU64,
}

/// State shared by every task of one pool.
struct Shared {
    id: String,
    broker: Arc<dyn Broker>,
    registry: Arc<JobRegistry>,
    config: WorkerPoolConfig,
    counters: Counters,
}

/// Pool of workers executing jobs from a [`Broker`].
pub struct WorkerPool {
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a new worker pool.
    pub fn new(broker: Arc<dyn Broker>, registry: Arc<JobRegistry>, config: WorkerPoolConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shared: Arc::new(Shared {
                id: format!("worker-{}", Uuid::new_v4().simple()),
                broker,
                registry,
                config,
                counters: Counters::default(),
            }),
            shutdown_tx,
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Registers the consumers and spawns the worker and maintenance tasks.
    /// Returns once the tasks are running.
    pub async fn start(&self) -> JobsResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(JobError::Worker("Worker pool already running".to_string()));
        }

        let shared = &self.shared;
        let consumers: Vec<String> = (0..shared.config.concurrency)
            .map(|n| format!("{}-{}", shared.id, n))
            .collect();

        for consumer_id in &consumers {
            if let Err(e) = shared.broker.heartbeat(consumer_id).await {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }

        info!(
            pool_id = %shared.id,
            concurrency = shared.config.concurrency,
            ack_mode = %shared.broker.ack_mode(),
            "Starting worker pool"
        );
        WorkerMetrics::update_concurrency(&shared.id, shared.config.concurrency);

        let mut tasks = self.tasks.lock();
        for consumer_id in consumers.iter().cloned() {
            let span = info_span!("worker", worker_id = %consumer_id);
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(
                run_worker(Arc::clone(shared), consumer_id, shutdown).instrument(span),
            ));
        }

        let shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(
            run_maintenance(Arc::clone(shared), consumers, shutdown)
                .instrument(info_span!("worker_maintenance", pool_id = %shared.id)),
        ));

        Ok(())
    }

    /// Signals every task to stop after its current job.
    pub fn stop(&self) {
        info!(pool_id = %self.shared.id, "Stopping worker pool...");
        let _ = self.shutdown_tx.send(());
    }

    /// Stops the pool and waits up to the shutdown timeout for in-flight
    /// jobs. Tasks still running after that are aborted; with late
    /// acknowledgment their jobs are redelivered after recovery.
    pub async fn shutdown(&self) {
        self.stop();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();

        let drained = tokio::time::timeout(
            self.shared.config.shutdown_timeout,
            futures::future::join_all(tasks),
        )
        .await;

        if drained.is_err() {
            warn!(
                pool_id = %self.shared.id,
                timeout_secs = self.shared.config.shutdown_timeout.as_secs(),
                "Workers did not finish in time, aborting"
            );
            for handle in aborts {
                handle.abort();
            }
        }

        self.running.store(false, Ordering::SeqCst);

        let stats = self.stats();
        info!(
            pool_id = %stats.id,
            succeeded = stats.jobs_succeeded,
            failed = stats.jobs_failed,
            "Worker pool stopped"
        );
    }

    /// Check if the pool is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get the pool ID.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Get pool statistics.
    pub fn stats(&self) -> WorkerPoolStats {
        let c = &self.shared.counters;
        WorkerPoolStats {
            id: self.shared.id.clone(),
            running: self.is_running(),
            concurrency: self.shared.config.concurrency,
            jobs_started: c.started.load(Ordering::Relaxed),
            jobs_succeeded: c.succeeded.load(Ordering::Relaxed),
            jobs_failed: c.failed.load(Ordering::Relaxed),
            redeliveries_skipped: c.skipped.load(Ordering::Relaxed),
            active: c.active.load(Ordering::Relaxed),
        }
    }
}

/// Worker pool statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerPoolStats {
    pub id: String,
    pub running: bool,
    pub concurrency: usize,
    pub jobs_started: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    /// Redelivered jobs acknowledged without running because a terminal
    /// result already existed.
    pub redeliveries_skipped: u64,
    /// Jobs executing right now.
    pub active: u64,
}

async fn run_worker(shared: Arc<Shared>, consumer_id: String, mut shutdown: broadcast::Receiver<()>) {
    debug!("Worker started");
    let mut consecutive_errors = 0u32;

    loop {
        let delivery = tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            delivery = shared.broker.consume(&consumer_id) => delivery,
        };

        match delivery {
            Ok(delivery) => {
                consecutive_errors = 0;
                let span = info_span!("job", job_id = %delivery.job.id, kind = %delivery.job.kind);
                shared.process(delivery).instrument(span).await;
            }
            Err(e) => {
                consecutive_errors = consecutive_errors.saturating_add(1);
                JobMetrics::broker_error("consume");
                let delay = shared.config.backoff.delay_for_attempt(consecutive_errors);
                warn!(error = %e, delay_ms = delay.as_millis() as u64, "Failed to consume job");

                tokio::select! {
                    biased;
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    debug!("Worker stopped");
}

async fn run_maintenance(shared: Arc<Shared>, consumers: Vec<String>, mut shutdown: broadcast::Receiver<()>) {
    let mut heartbeat = tokio::time::interval(shared.config.heartbeat_interval);
    let mut recovery = tokio::time::interval(shared.config.recovery_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    recovery.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            _ = heartbeat.tick() => {
                for consumer_id in &consumers {
                    if let Err(e) = shared.broker.heartbeat(consumer_id).await {
                        JobMetrics::broker_error("heartbeat");
                        warn!(consumer_id = %consumer_id, error = %e, "Heartbeat failed");
                    }
                }
                JobMetrics::update_active(shared.counters.active.load(Ordering::Relaxed));
            }
            _ = recovery.tick() => {
                match shared.broker.recover().await {
                    Ok(0) => {}
                    Ok(n) => JobMetrics::jobs_recovered(n),
                    Err(e) => {
                        JobMetrics::broker_error("recover");
                        warn!(error = %e, "Recovery sweep failed");
                    }
                }
                if let Ok(len) = shared.broker.queue_length().await {
                    JobMetrics::update_queue_length(len);
                }
            }
        }
    }
}

impl Shared {
    async fn process(&self, delivery: Delivery) {
        let job = &delivery.job;

        let previous = match self.broker.get_result(&job.id).await {
            Ok(previous) => previous,
            Err(e) => {
                warn!(error = %e, "Could not read previous result, assuming first attempt");
                None
            }
        };

        if let Some(previous) = &previous {
            if previous.is_terminal() {
                debug!(state = %previous.state, "Job already finished, acknowledging redelivery");
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                JobMetrics::redelivery_skipped(&job.kind);
                self.ack(&delivery).await;
                return;
            }
        }
        let attempt = previous.map_or(1, |p| p.attempt.saturating_add(1));
        if attempt > 1 {
            info!(attempt, "Re-executing redelivered job");
        }

        let entry = match self.registry.lookup(&job.kind) {
            Ok(entry) => entry,
            Err(_) => {
                warn!("No handler registered for job kind");
                let result = JobResult::rejected(job, &delivery.consumer_id, attempt, JobFailure::unknown_kind(&job.kind));
                self.finish(&delivery, result, Duration::ZERO).await;
                return;
            }
        };

        if let Err(e) = entry.validate(&job.arguments) {
            let reason = match e {
                JobError::InvalidArguments { reason, .. } => reason,
                other => other.to_string(),
            };
            warn!(reason = %reason, "Rejected job arguments");
            let result = JobResult::rejected(job, &delivery.consumer_id, attempt, JobFailure::invalid_arguments(reason));
            self.finish(&delivery, result, Duration::ZERO).await;
            return;
        }

        let started = JobResult::started(job, &delivery.consumer_id, attempt);
        match self.put_result(&started).await {
            Ok(PutOutcome::Stored) => {}
            Ok(PutOutcome::AlreadyTerminal) => {
                debug!("Job finished elsewhere, acknowledging");
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                self.ack(&delivery).await;
                return;
            }
            Err(e) => {
                // Not acknowledged: the delivery stays in flight for recovery.
                error!(error = %e, "Failed to record job start");
                return;
            }
        }

        let wait = (Utc::now() - job.submitted_at).to_std().unwrap_or_default();
        JobMetrics::job_started(&job.kind, wait);
        self.counters.started.fetch_add(1, Ordering::Relaxed);
        self.counters.active.fetch_add(1, Ordering::Relaxed);

        let deadline = entry.deadline();
        let handler = entry.handler();
        let arguments = job.arguments.clone();
        let clock = Instant::now();

        debug!(deadline_ms = deadline.as_millis() as u64, "Executing job");
        let execution = tokio::task::spawn_blocking(move || handler.call(&arguments));

        let result = match tokio::time::timeout(deadline, execution).await {
            Ok(Ok(Ok(payload))) => started.succeed(payload),
            Ok(Ok(Err(handler_error))) => started.fail(JobFailure::handler(handler_error)),
            Ok(Err(join_error)) => started.fail(JobFailure::panicked(panic_message(join_error))),
            Err(_) => {
                warn!(deadline_ms = deadline.as_millis() as u64, "Job exceeded its deadline");
                started.fail(JobFailure::deadline_exceeded(deadline))
            }
        };

        self.counters.active.fetch_sub(1, Ordering::Relaxed);
        self.finish(&delivery, result, clock.elapsed()).await;
    }

    /// Writes a terminal result and acknowledges the delivery.
    async fn finish(&self, delivery: &Delivery, result: JobResult, elapsed: Duration) {
        let kind = &delivery.job.kind;

        match self.put_result(&result).await {
            Ok(PutOutcome::Stored) => {}
            Ok(PutOutcome::AlreadyTerminal) => {
                debug!("Terminal result already recorded, discarding outcome");
                self.ack(delivery).await;
                return;
            }
            Err(e) => {
                error!(error = %e, state = %result.state, "Failed to record job result");
                return;
            }
        }

        match &result.error {
            None => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                JobMetrics::job_succeeded(kind, elapsed);
                info!(duration_ms = elapsed.as_millis() as u64, "Job succeeded");
            }
            Some(failure) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                JobMetrics::job_failed(kind, failure.kind, elapsed);
                info!(
                    failure = %failure.kind,
                    message = %failure.message,
                    duration_ms = elapsed.as_millis() as u64,
                    "Job failed"
                );
            }
        }

        self.ack(delivery).await;
    }

    async fn put_result(&self, result: &JobResult) -> JobsResult<PutOutcome> {
        with_retries("put_result", self.config.result_retries, &self.config.backoff, || {
            self.broker.put_result(result)
        })
        .await
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.broker.ack(delivery).await {
            JobMetrics::broker_error("ack");
            warn!(error = %e, "Failed to acknowledge delivery");
        }
    }
}

fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return "Handler task was cancelled".to_string();
    }
    let payload: Box<dyn Any + Send> = error.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("Handler panicked: {}", detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::AckMode;
    use crate::job::{FailureKind, Job, JobArguments, ResultState};
    use crate::memory::InMemoryBroker;
    use crate::registry::{ArgType, HandlerError, KindDefinition};
    use serde_json::{json, Value};

    fn registry() -> Arc<JobRegistry> {
        let mut registry = JobRegistry::new();
        registry
            .register(
                KindDefinition::new("double", |args: &JobArguments| -> Result<Value, HandlerError> {
                    Ok(json!(args.require_i64("n")? * 2))
                })
                .param("n", ArgType::Integer),
            )
            .unwrap();
        registry
            .register(KindDefinition::new("explode", |_: &JobArguments| -> Result<Value, HandlerError> {
                panic!("kaboom")
            }))
            .unwrap();
        Arc::new(registry)
    }

    fn config() -> WorkerPoolConfig {
        WorkerPoolConfig {
            concurrency: 2,
            shutdown_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_millis(50),
            recovery_interval: Duration::from_millis(100),
            backoff: Backoff::fixed(Duration::from_millis(10)),
            result_retries: 1,
        }
    }

    async fn wait_terminal(broker: &InMemoryBroker, job: &Job) -> JobResult {
        for _ in 0..200 {
            if let Some(result) = broker.get_result(&job.id).await.unwrap() {
                if result.is_terminal() {
                    return result;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} did not finish", job.id);
    }

    #[test]
    fn test_worker_pool_config_from_worker_config() {
        let config = WorkerPoolConfig::from(&WorkerConfig {
            concurrency: 0,
            ..WorkerConfig::default()
        });
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let broker = Arc::new(InMemoryBroker::new(AckMode::Late));
        let pool = WorkerPool::new(broker, registry(), config());
        pool.start().await.unwrap();
        assert!(matches!(pool.start().await, Err(JobError::Worker(_))));
        pool.shutdown().await;
        assert!(!pool.is_running());
    }

    #[tokio::test]
    async fn test_success_and_panic() {
        let broker = Arc::new(InMemoryBroker::new(AckMode::Late));
        let pool = WorkerPool::new(broker.clone(), registry(), config());
        pool.start().await.unwrap();

        let ok = Job::new("double", JobArguments::new().with("n", 21));
        let boom = Job::new("explode", JobArguments::new());
        broker.submit(&ok).await.unwrap();
        broker.submit(&boom).await.unwrap();

        let ok_result = wait_terminal(&broker, &ok).await;
        assert_eq!(ok_result.state, ResultState::Success);
        assert_eq!(ok_result.payload, Some(json!(42)));
        assert_eq!(ok_result.attempt, 1);

        let boom_result = wait_terminal(&broker, &boom).await;
        let failure = boom_result.error.unwrap();
        assert_eq!(failure.kind, FailureKind::Panicked);
        assert!(failure.message.contains("kaboom"));

        pool.shutdown().await;
        assert_eq!(broker.in_flight_len(), 0);
        let stats = pool.stats();
        assert_eq!(stats.jobs_succeeded, 1);
        assert_eq!(stats.jobs_failed, 1);
    }

    #[tokio::test]
    async fn test_invalid_arguments_recorded_without_execution() {
        let broker = Arc::new(InMemoryBroker::new(AckMode::Late));
        let pool = WorkerPool::new(broker.clone(), registry(), config());
        pool.start().await.unwrap();

        let job = Job::new("double", JobArguments::new().with("n", "seven"));
        broker.submit(&job).await.unwrap();

        let result = wait_terminal(&broker, &job).await;
        let failure = result.error.unwrap();
        assert_eq!(failure.kind, FailureKind::InvalidArguments);
        assert!(result.started_at.is_none());
        assert_eq!(pool.stats().jobs_started, 0);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_redelivered_terminal_job_is_not_rerun() {
        let broker = Arc::new(InMemoryBroker::new(AckMode::Late));
        let job = Job::new("double", JobArguments::new().with("n", 1));
        let finished = JobResult::started(&job, "gone", 1).succeed(json!("first"));
        broker.put_result(&finished).await.unwrap();
        broker.submit(&job).await.unwrap();

        let pool = WorkerPool::new(broker.clone(), registry(), config());
        pool.start().await.unwrap();

        for _ in 0..200 {
            if pool.stats().redeliveries_skipped == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.shutdown().await;

        assert_eq!(pool.stats().redeliveries_skipped, 1);
        let stored = broker.get_result(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.payload, Some(json!("first")));
        assert_eq!(broker.in_flight_len(), 0);
    }

    #[test]
    fn test_panic_message_from_string_payload() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let err = rt
            .block_on(tokio::spawn(async { panic!("{}", String::from("owned")) }))
            .unwrap_err();
        assert_eq!(panic_message(err), "Handler panicked: owned");
    }
}
