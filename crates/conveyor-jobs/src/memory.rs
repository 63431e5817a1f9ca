//! Process-local broker.
//!
//! Used for single-process deployments and tests. Honors the same contract
//! as the Redis broker (FIFO delivery, ack modes, result transition rule,
//! expiring submission markers) but nothing survives a restart.

use crate::broker::{AckMode, Broker, Delivery, JobSnapshot, PutOutcome};
use crate::config::JobsConfig;
use crate::error::{JobError, JobsResult};
use crate::job::{Job, JobId, JobResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    in_flight: HashMap<String, Vec<String>>,
    results: HashMap<JobId, (JobResult, Instant)>,
    submitted: HashMap<JobId, Instant>,
    heartbeats: HashMap<String, Instant>,
}

impl State {
    fn live_result(&mut self, job_id: &JobId, now: Instant) -> Option<JobResult> {
        match self.results.get(job_id) {
            Some((result, expires)) if *expires > now => Some(result.clone()),
            Some(_) => {
                self.results.remove(job_id);
                None
            }
            None => None,
        }
    }

    fn is_submitted(&self, job_id: &JobId, now: Instant) -> bool {
        matches!(self.submitted.get(job_id), Some(expires) if *expires > now)
    }

    /// Drops expired results, markers and heartbeats. Returns how many
    /// entries were removed.
    fn prune(&mut self, now: Instant) -> usize {
        let before = self.results.len() + self.submitted.len() + self.heartbeats.len();
        self.results.retain(|_, (_, expires)| *expires > now);
        self.submitted.retain(|_, expires| *expires > now);
        self.heartbeats.retain(|_, expires| *expires > now);
        before - (self.results.len() + self.submitted.len() + self.heartbeats.len())
    }
}

/// In-memory [`Broker`].
pub struct InMemoryBroker {
    state: Mutex<State>,
    available: Notify,
    closed: AtomicBool,
    ack_mode: AckMode,
    result_ttl: Duration,
    submission_ttl: Duration,
    heartbeat_ttl: Duration,
}

impl InMemoryBroker {
    /// Creates a broker with one-day result retention.
    pub fn new(ack_mode: AckMode) -> Self {
        let defaults = JobsConfig::default();
        Self {
            state: Mutex::new(State::default()),
            available: Notify::new(),
            closed: AtomicBool::new(false),
            ack_mode,
            result_ttl: defaults.results.ttl(),
            submission_ttl: defaults.results.submission_ttl(),
            heartbeat_ttl: defaults.worker.heartbeat_ttl(),
        }
    }

    pub fn from_config(config: &JobsConfig) -> Self {
        Self::new(config.broker.ack_mode)
            .with_result_ttl(config.results.ttl())
            .with_submission_ttl(config.results.submission_ttl())
            .with_heartbeat_ttl(config.worker.heartbeat_ttl())
    }

    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }

    pub fn with_submission_ttl(mut self, ttl: Duration) -> Self {
        self.submission_ttl = ttl;
        self
    }

    pub fn with_heartbeat_ttl(mut self, ttl: Duration) -> Self {
        self.heartbeat_ttl = ttl;
        self
    }

    /// Number of deliveries not yet acknowledged, across all consumers.
    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.values().map(Vec::len).sum()
    }

    fn ensure_open(&self) -> JobsResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(JobError::Transport("broker is closed".to_string()));
        }
        Ok(())
    }

    fn try_take(&self, consumer_id: &str) -> JobsResult<Option<Delivery>> {
        let mut state = self.state.lock();
        let Some(raw) = state.queue.pop_front() else {
            return Ok(None);
        };

        if self.ack_mode == AckMode::Late {
            state
                .in_flight
                .entry(consumer_id.to_string())
                .or_default()
                .push(raw.clone());
        }
        drop(state);

        let job = Job::from_json(&raw)?;
        Ok(Some(Delivery::new(job, consumer_id, raw)))
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    async fn submit(&self, job: &Job) -> JobsResult<()> {
        self.ensure_open()?;
        let raw = job.to_json()?;
        let now = Instant::now();

        {
            let mut state = self.state.lock();
            if state.is_submitted(&job.id, now) {
                return Err(JobError::DuplicateJobId(job.id.to_string()));
            }
            state.submitted.insert(job.id.clone(), now + self.submission_ttl);
            state.queue.push_back(raw);
        }

        self.available.notify_one();
        debug!(job_id = %job.id, kind = %job.kind, "Enqueued job");
        Ok(())
    }

    async fn consume(&self, consumer_id: &str) -> JobsResult<Delivery> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_open()?;
            if let Some(delivery) = self.try_take(consumer_id)? {
                return Ok(delivery);
            }

            notified.await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> JobsResult<()> {
        if self.ack_mode == AckMode::Early {
            return Ok(());
        }
        let mut state = self.state.lock();
        if let Some(list) = state.in_flight.get_mut(&delivery.consumer_id) {
            if let Some(pos) = list.iter().position(|raw| *raw == delivery.raw) {
                list.remove(pos);
            }
            if list.is_empty() {
                state.in_flight.remove(&delivery.consumer_id);
            }
        }
        Ok(())
    }

    async fn put_result(&self, result: &JobResult) -> JobsResult<PutOutcome> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut state = self.state.lock();

        if let Some((existing, expires)) = state.results.get(&result.job_id) {
            if *expires > now && !existing.state.can_transition_to(result.state) {
                return Ok(PutOutcome::AlreadyTerminal);
            }
        }

        let expires = now + self.result_ttl;
        state
            .results
            .insert(result.job_id.clone(), (result.clone(), expires));

        // Once terminal, the marker lives exactly as long as the result.
        if result.is_terminal() {
            if let Some(marker) = state.submitted.get_mut(&result.job_id) {
                *marker = expires;
            }
        }
        Ok(PutOutcome::Stored)
    }

    async fn get_result(&self, job_id: &JobId) -> JobsResult<Option<JobResult>> {
        self.ensure_open()?;
        Ok(self.state.lock().live_result(job_id, Instant::now()))
    }

    async fn is_submitted(&self, job_id: &JobId) -> JobsResult<bool> {
        self.ensure_open()?;
        Ok(self.state.lock().is_submitted(job_id, Instant::now()))
    }

    async fn snapshot(&self, job_id: &JobId) -> JobsResult<JobSnapshot> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        Ok(JobSnapshot {
            result: state.live_result(job_id, now),
            submitted: state.is_submitted(job_id, now),
        })
    }

    async fn heartbeat(&self, consumer_id: &str) -> JobsResult<()> {
        self.ensure_open()?;
        self.state
            .lock()
            .heartbeats
            .insert(consumer_id.to_string(), Instant::now() + self.heartbeat_ttl);
        Ok(())
    }

    async fn recover(&self) -> JobsResult<u64> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut requeued = 0u64;

        {
            let mut state = self.state.lock();
            let dead: Vec<String> = state
                .in_flight
                .keys()
                .filter(|consumer| {
                    !matches!(state.heartbeats.get(*consumer), Some(expires) if *expires > now)
                })
                .cloned()
                .collect();

            for consumer in dead {
                let Some(entries) = state.in_flight.remove(&consumer) else {
                    continue;
                };
                state.heartbeats.remove(&consumer);
                warn!(
                    consumer_id = %consumer,
                    count = entries.len(),
                    "Requeueing deliveries of dead consumer"
                );
                for raw in entries.into_iter().rev() {
                    state.queue.push_front(raw);
                    requeued += 1;
                }
            }

            let pruned = state.prune(now);
            if pruned > 0 {
                debug!(pruned, "Dropped expired broker entries");
            }
        }

        for _ in 0..requeued {
            self.available.notify_one();
        }
        Ok(requeued)
    }

    async fn queue_length(&self) -> JobsResult<u64> {
        self.ensure_open()?;
        Ok(self.state.lock().queue.len() as u64)
    }

    async fn health_check(&self) -> JobsResult<()> {
        self.ensure_open()
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.available.notify_waiters();
            info!("In-memory broker closed");
        }
    }
}
