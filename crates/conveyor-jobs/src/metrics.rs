//! Prometheus metrics for the job subsystem.
//!
//! Recording is a no-op until a recorder is installed (the server installs
//! the Prometheus exporter).

use crate::job::FailureKind;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names.
pub mod names {
    /// Total jobs accepted by the dispatcher.
    pub const JOBS_SUBMITTED_TOTAL: &str = "conveyor_jobs_submitted_total";
    /// Total jobs handed to a worker.
    pub const JOBS_STARTED_TOTAL: &str = "conveyor_jobs_started_total";
    /// Total jobs that finished with a success record.
    pub const JOBS_SUCCEEDED_TOTAL: &str = "conveyor_jobs_succeeded_total";
    /// Total jobs that finished with a failure record.
    pub const JOBS_FAILED_TOTAL: &str = "conveyor_jobs_failed_total";
    /// Total jobs whose deadline elapsed.
    pub const JOBS_DEADLINE_EXCEEDED_TOTAL: &str = "conveyor_jobs_deadline_exceeded_total";
    /// Total redeliveries skipped because a terminal result existed.
    pub const JOBS_REDELIVERED_SKIPPED_TOTAL: &str = "conveyor_jobs_redelivered_skipped_total";
    /// Total in-flight jobs requeued from dead consumers.
    pub const JOBS_RECOVERED_TOTAL: &str = "conveyor_jobs_recovered_total";

    /// Jobs waiting in the broker.
    pub const JOBS_QUEUED: &str = "conveyor_jobs_queued";
    /// Jobs currently executing in this process.
    pub const JOBS_ACTIVE: &str = "conveyor_jobs_active";

    /// Handler execution time in seconds.
    pub const JOB_DURATION_SECONDS: &str = "conveyor_job_duration_seconds";
    /// Time between submission and start of execution, in seconds.
    pub const JOB_WAIT_TIME_SECONDS: &str = "conveyor_job_wait_time_seconds";

    /// Configured worker concurrency.
    pub const WORKERS_CONCURRENCY: &str = "conveyor_workers_concurrency";
    /// Total broker calls that failed with a transport error.
    pub const BROKER_ERRORS_TOTAL: &str = "conveyor_broker_errors_total";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_SUBMITTED_TOTAL, "Total number of jobs submitted");
    describe_counter!(names::JOBS_STARTED_TOTAL, "Total number of jobs started by a worker");
    describe_counter!(names::JOBS_SUCCEEDED_TOTAL, "Total number of jobs that succeeded");
    describe_counter!(names::JOBS_FAILED_TOTAL, "Total number of jobs that failed");
    describe_counter!(
        names::JOBS_DEADLINE_EXCEEDED_TOTAL,
        "Total number of jobs that exceeded their deadline"
    );
    describe_counter!(
        names::JOBS_REDELIVERED_SKIPPED_TOTAL,
        "Total number of redelivered jobs acknowledged without execution"
    );
    describe_counter!(
        names::JOBS_RECOVERED_TOTAL,
        "Total number of in-flight jobs requeued from dead consumers"
    );

    describe_gauge!(names::JOBS_QUEUED, "Current number of jobs waiting in the broker");
    describe_gauge!(names::JOBS_ACTIVE, "Current number of jobs executing");

    describe_histogram!(names::JOB_DURATION_SECONDS, "Job execution duration in seconds");
    describe_histogram!(
        names::JOB_WAIT_TIME_SECONDS,
        "Job wait time (time in queue) in seconds"
    );

    describe_gauge!(names::WORKERS_CONCURRENCY, "Worker pool concurrency setting");
    describe_counter!(names::BROKER_ERRORS_TOTAL, "Total number of broker transport errors");
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    pub fn job_submitted(kind: &str) {
        counter!(names::JOBS_SUBMITTED_TOTAL, "kind" => kind.to_string()).increment(1);
    }

    /// Record a job picked up by a worker.
    pub fn job_started(kind: &str, wait_time: Duration) {
        counter!(names::JOBS_STARTED_TOTAL, "kind" => kind.to_string()).increment(1);
        histogram!(names::JOB_WAIT_TIME_SECONDS, "kind" => kind.to_string())
            .record(wait_time.as_secs_f64());
    }

    pub fn job_succeeded(kind: &str, duration: Duration) {
        counter!(names::JOBS_SUCCEEDED_TOTAL, "kind" => kind.to_string()).increment(1);
        histogram!(
            names::JOB_DURATION_SECONDS,
            "kind" => kind.to_string(),
            "status" => "success"
        )
        .record(duration.as_secs_f64());
    }

    pub fn job_failed(kind: &str, failure: FailureKind, duration: Duration) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "kind" => kind.to_string(),
            "failure" => failure.to_string()
        )
        .increment(1);

        if failure == FailureKind::DeadlineExceeded {
            counter!(names::JOBS_DEADLINE_EXCEEDED_TOTAL, "kind" => kind.to_string()).increment(1);
        }

        histogram!(
            names::JOB_DURATION_SECONDS,
            "kind" => kind.to_string(),
            "status" => "failure"
        )
        .record(duration.as_secs_f64());
    }

    pub fn redelivery_skipped(kind: &str) {
        counter!(names::JOBS_REDELIVERED_SKIPPED_TOTAL, "kind" => kind.to_string()).increment(1);
    }

    pub fn jobs_recovered(count: u64) {
        counter!(names::JOBS_RECOVERED_TOTAL).increment(count);
    }

    pub fn update_queue_length(queued: u64) {
        gauge!(names::JOBS_QUEUED).set(queued as f64);
    }

    pub fn update_active(active: u64) {
        gauge!(names::JOBS_ACTIVE).set(active as f64);
    }

    pub fn broker_error(operation: &'static str) {
        counter!(names::BROKER_ERRORS_TOTAL, "operation" => operation).increment(1);
    }
}

/// Worker metrics recorder.
#[derive(Clone)]
pub struct WorkerMetrics;

impl WorkerMetrics {
    pub fn update_concurrency(pool_id: &str, concurrency: usize) {
        gauge!(names::WORKERS_CONCURRENCY, "pool_id" => pool_id.to_string())
            .set(concurrency as f64);
    }
}
