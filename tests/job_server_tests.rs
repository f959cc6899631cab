//! End-to-end tests of a running job server: loops, isolation and shutdown.

mod common;

use common::{fast_config, wait_until, TestJobServer};
use job_server::background_jobs::{
    JobContext, JobError, JobScheduler, JobWorker, PeriodicScheduler, ShutdownBehavior,
    SimpleWorker, TickOutcome,
};
use job_server::config::JobsConfig;
use job_server::job_store::{Job, JobStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const GRACE: Duration = Duration::from_secs(5);

fn data(key: &str, value: &str) -> HashMap<String, String> {
    HashMap::from([(key.to_string(), value.to_string())])
}

/// Sleeps in small steps, returning `Cancelled` as soon as the token fires.
struct SlowWorker {
    job_type: &'static str,
    duration: Duration,
    behavior: ShutdownBehavior,
}

impl JobWorker for SlowWorker {
    fn name(&self) -> &str {
        "Slow"
    }

    fn job_type(&self) -> &str {
        self.job_type
    }

    fn is_enabled(&self, _config: &JobsConfig) -> bool {
        true
    }

    fn shutdown_behavior(&self) -> ShutdownBehavior {
        self.behavior
    }

    fn execute(&self, ctx: &JobContext, _job: &Job) -> Result<(), JobError> {
        let step = Duration::from_millis(10);
        let mut slept = Duration::ZERO;
        while slept < self.duration {
            if ctx.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            std::thread::sleep(step);
            slept += step;
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_panicking_job_does_not_stop_its_worker() {
    let t = TestJobServer::new(fast_config(), GRACE);
    let executed = Arc::new(AtomicUsize::new(0));
    let counter = executed.clone();
    t.server
        .register_worker(Arc::new(SimpleWorker::new(
            "Flaky",
            "flaky",
            |_| true,
            move |_ctx, job| {
                counter.fetch_add(1, Ordering::SeqCst);
                if job.data.contains_key("explode") {
                    panic!("exploded on purpose");
                }
                Ok(())
            },
        )))
        .unwrap();

    let bad = t.server.create_job("flaky", &data("explode", "1")).unwrap();
    let good = t.server.create_job("flaky", &HashMap::new()).unwrap();
    t.server.start().unwrap();

    let bad = t.wait_for_status(&bad.id, JobStatus::Error).await;
    assert_eq!(bad.message.as_deref(), Some("job panicked: exploded on purpose"));
    assert!(bad.finished_at.is_some());
    t.wait_for_status(&good.id, JobStatus::Success).await;

    // The loop is still alive after the panic
    let later = t.server.create_job("flaky", &HashMap::new()).unwrap();
    t.wait_for_status(&later.id, JobStatus::Success).await;
    assert_eq!(executed.load(Ordering::SeqCst), 3);

    t.server.stop().await.unwrap();
}

#[tokio::test]
async fn test_exclusive_scheduler_keeps_one_outstanding_job() {
    let t = TestJobServer::new(fast_config(), GRACE);
    // No worker: created jobs stay pending
    t.server
        .register_scheduler(Arc::new(PeriodicScheduler::new(
            "report",
            Duration::from_millis(30),
            |_| true,
        )))
        .unwrap();
    t.server.start().unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    t.server.stop().await.unwrap();

    let jobs = t.store.list_jobs_by_type("report", 100).unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Pending);
}

#[tokio::test]
async fn test_scheduled_jobs_are_executed_one_after_another() {
    let t = TestJobServer::new(fast_config(), GRACE);
    let executed = Arc::new(AtomicUsize::new(0));
    let counter = executed.clone();
    t.server
        .register_scheduler(Arc::new(PeriodicScheduler::new(
            "tick",
            Duration::from_millis(50),
            |_| true,
        )))
        .unwrap();
    t.server
        .register_worker(Arc::new(SimpleWorker::new("Tick", "tick", |_| true, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })))
        .unwrap();
    t.server.start().unwrap();

    assert!(wait_until(Duration::from_secs(5), || executed.load(Ordering::SeqCst) >= 3).await);
    t.server.stop().await.unwrap();

    for job in t.store.list_jobs_by_type("tick", 100).unwrap() {
        assert!(job.status.is_terminal() || job.status == JobStatus::Pending);
    }
}

#[tokio::test]
async fn test_disabled_job_type_resumes_after_config_reload() {
    let config = JobsConfig {
        metrics_enabled: false,
        ..fast_config()
    };
    let t = TestJobServer::new(config, GRACE);
    let enabled = |c: &JobsConfig| c.metrics_enabled;
    t.server
        .register_scheduler(Arc::new(PeriodicScheduler::new(
            "gated",
            Duration::from_millis(30),
            enabled,
        )))
        .unwrap();
    t.server
        .register_worker(Arc::new(SimpleWorker::new("Gated", "gated", enabled, |_, _| Ok(()))))
        .unwrap();
    // A job created by hand is not picked up while disabled either
    let manual = t.server.create_job("gated", &HashMap::new()).unwrap();
    t.server.start().unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(t.store.list_jobs_by_type("gated", 100).unwrap().len(), 1);
    assert_eq!(t.status_of(&manual.id), JobStatus::Pending);

    let version = t.config.replace(fast_config());
    assert_eq!(version, 2);

    t.wait_for_status(&manual.id, JobStatus::Success).await;
    assert!(
        wait_until(Duration::from_secs(5), || {
            t.store.list_jobs_by_type("gated", 100).unwrap().len() > 1
        })
        .await
    );
    t.server.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_waits_for_running_job_to_finish() {
    let t = TestJobServer::new(fast_config(), GRACE);
    t.server
        .register_worker(Arc::new(SlowWorker {
            job_type: "slow",
            duration: Duration::from_millis(300),
            behavior: ShutdownBehavior::WaitForCompletion,
        }))
        .unwrap();
    let job = t.server.create_job("slow", &HashMap::new()).unwrap();
    t.server.start().unwrap();

    t.wait_for_status(&job.id, JobStatus::InProgress).await;
    t.server.stop().await.unwrap();

    // stop returned only after the result was recorded
    assert_eq!(t.status_of(&job.id), JobStatus::Success);
    assert!(!t.server.is_running());
}

#[tokio::test]
async fn test_stop_cancels_cancellable_job() {
    let t = TestJobServer::new(fast_config(), GRACE);
    t.server
        .register_worker(Arc::new(SlowWorker {
            job_type: "slow",
            duration: Duration::from_secs(30),
            behavior: ShutdownBehavior::Cancellable,
        }))
        .unwrap();
    let job = t.server.create_job("slow", &HashMap::new()).unwrap();
    t.server.start().unwrap();

    t.wait_for_status(&job.id, JobStatus::InProgress).await;
    let started = std::time::Instant::now();
    t.server.stop().await.unwrap();

    assert!(started.elapsed() < GRACE);
    assert_eq!(t.status_of(&job.id), JobStatus::Canceled);
}

#[tokio::test]
async fn test_job_past_grace_period_is_recorded_as_error() {
    let t = TestJobServer::new(fast_config(), Duration::from_millis(100));
    t.server
        .register_worker(Arc::new(SlowWorker {
            job_type: "stuck",
            duration: Duration::from_secs(1),
            behavior: ShutdownBehavior::WaitForCompletion,
        }))
        .unwrap();
    let job = t.server.create_job("stuck", &HashMap::new()).unwrap();
    t.server.start().unwrap();

    t.wait_for_status(&job.id, JobStatus::InProgress).await;
    t.server.stop().await.unwrap();

    let job = t.store.get_job(&job.id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(
        job.message.as_deref(),
        Some("job interrupted before recording a result")
    );

    // The body finishing later cannot overwrite the terminal status
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(t.status_of(&job.id), JobStatus::Error);
}

#[tokio::test]
async fn test_store_outage_is_survived() {
    let (t, failing) = TestJobServer::with_failing_store(fast_config());
    let scheduler = Arc::new(PeriodicScheduler::new(
        "outage",
        Duration::from_secs(3600),
        |_| true,
    ));
    assert_eq!(scheduler.job_type(), "outage");
    t.server.register_scheduler(scheduler).unwrap();
    t.server
        .register_worker(Arc::new(SimpleWorker::new("Outage", "outage", |_| true, |_, _| Ok(()))))
        .unwrap();

    failing.set_failing(true);
    t.server.start().unwrap();
    assert_eq!(
        t.server.trigger_scheduler("outage"),
        Some(TickOutcome::StoreError)
    );
    // Workers keep polling through claim failures
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(t.server.is_running());

    failing.set_failing(false);
    let Some(TickOutcome::Created(id)) = t.server.trigger_scheduler("outage") else {
        panic!("tick should create a job once the store is back");
    };
    t.wait_for_status(&id, JobStatus::Success).await;
    t.server.stop().await.unwrap();
}

#[tokio::test]
async fn test_canceled_pending_job_is_never_executed() {
    let t = TestJobServer::new(fast_config(), GRACE);
    let executed = Arc::new(AtomicUsize::new(0));
    let counter = executed.clone();
    t.server
        .register_worker(Arc::new(SimpleWorker::new("Count", "count", |_| true, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })))
        .unwrap();

    let canceled = t.server.create_job("count", &HashMap::new()).unwrap();
    assert!(t.server.cancel_job(&canceled.id).unwrap());
    let marker = t.server.create_job("count", &HashMap::new()).unwrap();
    t.server.start().unwrap();

    t.wait_for_status(&marker.id, JobStatus::Success).await;
    t.server.stop().await.unwrap();

    assert_eq!(executed.load(Ordering::SeqCst), 1);
    assert_eq!(t.status_of(&canceled.id), JobStatus::Canceled);
}
