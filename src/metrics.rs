use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

use crate::job_store::{JobStatus, JobStatusCount};

/// Metric name prefix for all job server metrics
const PREFIX: &str = "job_server";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref JOBS_CREATED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_created_total"), "Jobs created by schedulers or external triggers"),
        &["job_type"]
    ).expect("Failed to create jobs_created_total metric");

    pub static ref JOBS_CLAIMED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_claimed_total"), "Jobs claimed by workers"),
        &["job_type"]
    ).expect("Failed to create jobs_claimed_total metric");

    pub static ref JOBS_FINISHED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_finished_total"), "Jobs that reached a terminal status"),
        &["job_type", "status"]
    ).expect("Failed to create jobs_finished_total metric");

    pub static ref JOB_PANICS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_job_panics_total"), "Job executions that panicked"),
        &["job_type"]
    ).expect("Failed to create job_panics_total metric");

    pub static ref JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_job_duration_seconds"),
            "Job execution duration in seconds"
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 1800.0]),
        &["job_type"]
    ).expect("Failed to create job_duration_seconds metric");

    pub static ref SCHEDULER_TICKS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_scheduler_ticks_total"), "Scheduler ticks by outcome"),
        &["job_type", "outcome"]
    ).expect("Failed to create scheduler_ticks_total metric");

    pub static ref STORE_ERRORS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_store_errors_total"), "Job store errors by operation"),
        &["operation"]
    ).expect("Failed to create store_errors_total metric");

    pub static ref JOBS_BY_STATUS: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_jobs"), "Stored jobs by type and status"),
        &["job_type", "status"]
    ).expect("Failed to create jobs metric");
}

/// Register all metrics with the Prometheus registry
pub fn init_metrics() {
    // Ignore errors if already registered (tests)
    let _ = REGISTRY.register(Box::new(JOBS_CREATED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_CLAIMED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_FINISHED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_PANICS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(SCHEDULER_TICKS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(STORE_ERRORS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_BY_STATUS.clone()));

    tracing::info!("Metrics system initialized successfully");
}

pub fn record_job_created(job_type: &str) {
    JOBS_CREATED_TOTAL.with_label_values(&[job_type]).inc();
}

pub fn record_job_claimed(job_type: &str) {
    JOBS_CLAIMED_TOTAL.with_label_values(&[job_type]).inc();
}

pub fn record_job_finished(job_type: &str, status: JobStatus, duration: Duration) {
    JOBS_FINISHED_TOTAL
        .with_label_values(&[job_type, status.as_str()])
        .inc();
    JOB_DURATION_SECONDS
        .with_label_values(&[job_type])
        .observe(duration.as_secs_f64());
}

pub fn record_job_panic(job_type: &str) {
    JOB_PANICS_TOTAL.with_label_values(&[job_type]).inc();
}

pub fn record_scheduler_tick(job_type: &str, outcome: &str) {
    SCHEDULER_TICKS_TOTAL
        .with_label_values(&[job_type, outcome])
        .inc();
}

pub fn record_store_error(operation: &str) {
    STORE_ERRORS_TOTAL.with_label_values(&[operation]).inc();
}

/// Replaces the jobs-by-status gauge with a fresh count.
pub fn set_job_counts(counts: &[JobStatusCount]) {
    JOBS_BY_STATUS.reset();
    for count in counts {
        JOBS_BY_STATUS
            .with_label_values(&[count.job_type.as_str(), count.status.as_str()])
            .set(count.count as f64);
    }
}

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
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

/// Serves `/metrics` on localhost until the listener fails.
pub async fn run_metrics_server(port: u16) -> anyhow::Result<()> {
    let app = axum::Router::new().route("/metrics", axum::routing::get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    Ok(axum::serve(listener, app).await?)
}
