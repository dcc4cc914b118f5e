//! Metrics for queue and scheduler monitoring.
//!
//! Recorded through the `metrics` facade; installing an exporter is left to
//! the embedding process.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names for the job system.
pub mod names {
    /// Total payloads pushed.
    pub const JOBS_PUSHED_TOTAL: &str = "courier_jobs_pushed_total";
    /// Total payloads popped.
    pub const JOBS_POPPED_TOTAL: &str = "courier_jobs_popped_total";
    /// Total executions dispatched.
    pub const JOBS_DISPATCHED_TOTAL: &str = "courier_jobs_dispatched_total";
    /// Total executions completed successfully.
    pub const JOBS_COMPLETED_TOTAL: &str = "courier_jobs_completed_total";
    /// Total executions failed, timeouts included.
    pub const JOBS_FAILED_TOTAL: &str = "courier_jobs_failed_total";
    /// Total executions timed out.
    pub const JOBS_TIMED_OUT_TOTAL: &str = "courier_jobs_timed_out_total";
    /// Total payloads requeued for retry.
    pub const JOBS_RETRIED_TOTAL: &str = "courier_jobs_retried_total";
    /// Total payloads dropped after their last retry.
    pub const JOBS_EXHAUSTED_TOTAL: &str = "courier_jobs_exhausted_total";
    /// Total retries lost to a failed requeue.
    pub const JOBS_RETRY_DROPPED_TOTAL: &str = "courier_jobs_retry_dropped_total";

    /// In-flight executions.
    pub const JOBS_RUNNING: &str = "courier_jobs_running";
    /// Running divided by max concurrency.
    pub const JOBS_UTILIZATION: &str = "courier_jobs_utilization";
    /// Pending payloads in a queue.
    pub const QUEUE_PENDING: &str = "courier_queue_pending";

    /// Execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "courier_job_duration_seconds";

    /// Loop task uptime in seconds.
    pub const TASK_UPTIME_SECONDS: &str = "courier_task_uptime_seconds";
    /// Loop task iterations.
    pub const TASK_ITERATIONS_TOTAL: &str = "courier_task_iterations_total";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_PUSHED_TOTAL, "Total number of payloads pushed");
    describe_counter!(names::JOBS_POPPED_TOTAL, "Total number of payloads popped");
    describe_counter!(names::JOBS_DISPATCHED_TOTAL, "Total number of executions dispatched");
    describe_counter!(names::JOBS_COMPLETED_TOTAL, "Total number of executions completed successfully");
    describe_counter!(names::JOBS_FAILED_TOTAL, "Total number of executions that failed or timed out");
    describe_counter!(names::JOBS_TIMED_OUT_TOTAL, "Total number of executions that timed out");
    describe_counter!(names::JOBS_RETRIED_TOTAL, "Total number of payloads requeued for retry");
    describe_counter!(names::JOBS_EXHAUSTED_TOTAL, "Total number of payloads dropped after their last retry");
    describe_counter!(names::JOBS_RETRY_DROPPED_TOTAL, "Total number of retries lost to a failed requeue");

    describe_gauge!(names::JOBS_RUNNING, "Current number of in-flight executions");
    describe_gauge!(names::JOBS_UTILIZATION, "In-flight executions divided by max concurrency");
    describe_gauge!(names::QUEUE_PENDING, "Current number of pending payloads");

    describe_histogram!(names::JOB_DURATION_SECONDS, "Execution duration in seconds");

    describe_gauge!(names::TASK_UPTIME_SECONDS, "Loop task uptime in seconds");
    describe_counter!(names::TASK_ITERATIONS_TOTAL, "Total number of loop task iterations");
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record a payload pushed.
    pub fn job_pushed(queue: &str, job_name: &str) {
        counter!(
            names::JOBS_PUSHED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    /// Record a payload popped.
    pub fn job_popped(queue: &str, job_name: &str) {
        counter!(
            names::JOBS_POPPED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    /// Record an execution dispatched.
    pub fn job_dispatched(job_name: &str) {
        counter!(names::JOBS_DISPATCHED_TOTAL, "job_name" => job_name.to_string()).increment(1);
    }

    /// Record an execution completed.
    pub fn job_completed(job_name: &str, duration: Duration) {
        counter!(names::JOBS_COMPLETED_TOTAL, "job_name" => job_name.to_string()).increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "job_name" => job_name.to_string(),
            "status" => "completed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record an execution failed.
    pub fn job_failed(job_name: &str, error_type: &str, duration: Duration) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "job_name" => job_name.to_string(),
            "error_type" => error_type.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "job_name" => job_name.to_string(),
            "status" => "failed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record an execution timeout.
    pub fn job_timed_out(job_name: &str) {
        counter!(names::JOBS_TIMED_OUT_TOTAL, "job_name" => job_name.to_string()).increment(1);
    }

    /// Record a payload requeued.
    pub fn job_retried(job_name: &str, attempt: u32) {
        counter!(
            names::JOBS_RETRIED_TOTAL,
            "job_name" => job_name.to_string(),
            "attempt" => attempt.to_string()
        )
        .increment(1);
    }

    /// Record a payload dropped after its last retry.
    pub fn job_exhausted(job_name: &str) {
        counter!(names::JOBS_EXHAUSTED_TOTAL, "job_name" => job_name.to_string()).increment(1);
    }

    /// Record a retry lost because the requeue push failed.
    pub fn job_retry_dropped(job_name: &str) {
        counter!(names::JOBS_RETRY_DROPPED_TOTAL, "job_name" => job_name.to_string()).increment(1);
    }

    /// Update the pool gauges of a job.
    pub fn update_pool(job_name: &str, running: u64, max_concurrency: usize) {
        gauge!(names::JOBS_RUNNING, "job_name" => job_name.to_string()).set(running as f64);

        gauge!(names::JOBS_UTILIZATION, "job_name" => job_name.to_string())
            .set(running as f64 / max_concurrency.max(1) as f64);
    }

    /// Update the pending gauge of a queue.
    pub fn update_queue_size(queue: &str, pending: u64) {
        gauge!(names::QUEUE_PENDING, "queue" => queue.to_string()).set(pending as f64);
    }
}

/// Loop task metrics recorder.
#[derive(Clone)]
pub struct TaskMetrics;

impl TaskMetrics {
    /// Record one loop iteration.
    pub fn iteration(task: &str) {
        counter!(names::TASK_ITERATIONS_TOTAL, "task" => task.to_string()).increment(1);
    }

    /// Update task uptime.
    pub fn uptime(task: &str, uptime: Duration) {
        gauge!(names::TASK_UPTIME_SECONDS, "task" => task.to_string()).set(uptime.as_secs_f64());
    }
}
