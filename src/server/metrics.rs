use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all scheduler metrics
const PREFIX: &str = "scheduler";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Execution Metrics
    pub static ref JOB_EXECUTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_job_executions_total"), "Total job executions by outcome"),
        &["job_id", "tier", "status"]
    ).expect("Failed to create job_executions_total metric");

    pub static ref JOB_EXECUTION_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_job_execution_duration_seconds"),
            "Job execution duration in seconds, retries included"
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0]),
        &["job_id"]
    ).expect("Failed to create job_execution_duration_seconds metric");

    pub static ref JOB_RETRIES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_job_retries_total"), "Total retry attempts"),
        &["job_id"]
    ).expect("Failed to create job_retries_total metric");

    pub static ref JOB_RUNNING: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_job_running"), "Whether a job is currently in flight (1) or not (0)"),
        &["job_id"]
    ).expect("Failed to create job_running metric");

    // Scheduling Metrics
    pub static ref JOB_DISPATCHES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_job_dispatches_total"), "Total dispatches by tier"),
        &["tier"]
    ).expect("Failed to create job_dispatches_total metric");

    pub static ref JOB_MISSED_RUNS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_job_missed_runs_total"), "Runs found overdue at startup"),
        &["job_id"]
    ).expect("Failed to create job_missed_runs_total metric");

    pub static ref REGISTERED_JOBS: IntGauge = IntGauge::new(
        format!("{PREFIX}_registered_jobs"),
        "Number of jobs in the job store"
    ).expect("Failed to create registered_jobs metric");

    // Failure Metrics
    pub static ref JOB_CONSECUTIVE_FAILURES: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_job_consecutive_failures"), "Consecutive failed executions per job"),
        &["job_id"]
    ).expect("Failed to create job_consecutive_failures metric");

    pub static ref FAILURE_ALERTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_failure_alerts_total"), "Consecutive failure threshold alerts"),
        &["job_id"]
    ).expect("Failed to create failure_alerts_total metric");

    pub static ref STORE_WRITE_FAILURES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_store_write_failures_total"), "Job store writes that failed"),
        &["operation"]
    ).expect("Failed to create store_write_failures_total metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Register all metrics - ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(JOB_EXECUTIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_EXECUTION_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(JOB_RETRIES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_RUNNING.clone()));
    let _ = REGISTRY.register(Box::new(JOB_DISPATCHES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_MISSED_RUNS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(REGISTERED_JOBS.clone()));
    let _ = REGISTRY.register(Box::new(JOB_CONSECUTIVE_FAILURES.clone()));
    let _ = REGISTRY.register(Box::new(FAILURE_ALERTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(STORE_WRITE_FAILURES_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

/// Record a finished dispatch (all attempts included)
pub fn record_job_execution(
    job_id: &str,
    tier: &str,
    success: bool,
    duration: Duration,
    retries_used: u32,
) {
    let status = if success { "success" } else { "failure" };
    JOB_EXECUTIONS_TOTAL
        .with_label_values(&[job_id, tier, status])
        .inc();
    JOB_EXECUTION_DURATION_SECONDS
        .with_label_values(&[job_id])
        .observe(duration.as_secs_f64());
    if retries_used > 0 {
        JOB_RETRIES_TOTAL
            .with_label_values(&[job_id])
            .inc_by(retries_used as f64);
    }
}

pub fn set_job_running(job_id: &str, running: bool) {
    JOB_RUNNING
        .with_label_values(&[job_id])
        .set(if running { 1.0 } else { 0.0 });
}

pub fn record_job_dispatch(tier: &str) {
    JOB_DISPATCHES_TOTAL.with_label_values(&[tier]).inc();
}

pub fn record_missed_run(job_id: &str) {
    JOB_MISSED_RUNS_TOTAL.with_label_values(&[job_id]).inc();
}

pub fn set_registered_jobs(count: usize) {
    REGISTERED_JOBS.set(count as i64);
}

pub fn set_consecutive_failures(job_id: &str, count: u32) {
    JOB_CONSECUTIVE_FAILURES
        .with_label_values(&[job_id])
        .set(count as f64);
}

pub fn record_failure_alert(job_id: &str) {
    FAILURE_ALERTS_TOTAL.with_label_values(&[job_id]).inc();
}

pub fn record_store_write_failure(operation: &str) {
    STORE_WRITE_FAILURES_TOTAL
        .with_label_values(&[operation])
        .inc();
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_else(|_| String::from(""));
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}
