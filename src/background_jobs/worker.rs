use super::context::JobContext;
use super::isolation::{execute_isolated, handle_job_panic, ClaimedJob, Execution};
use super::job::{JobError, JobWorker, ShutdownBehavior};
use crate::config::{ConfigSource, JobsConfig};
use crate::job_store::{JobStatus, JobStore};
use crate::metrics;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Result of one claim-and-execute attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Disabled,
    /// Nothing to claim.
    Idle,
    /// The claim failed; retried after the poll interval.
    StoreError,
    /// The claimed job had been canceled; the body was not run.
    Skipped(String),
    Finished { job_id: String, status: JobStatus },
}

impl AttemptOutcome {
    fn should_back_off(&self) -> bool {
        matches!(
            self,
            AttemptOutcome::Disabled | AttemptOutcome::Idle | AttemptOutcome::StoreError
        )
    }
}

/// Drives one registered [`JobWorker`]: claim, execute, record, repeat.
pub(crate) struct WorkerRunner {
    worker: Arc<dyn JobWorker>,
    store: Arc<dyn JobStore>,
    config: Arc<ConfigSource>,
}

impl WorkerRunner {
    pub(crate) fn new(
        worker: Arc<dyn JobWorker>,
        store: Arc<dyn JobStore>,
        config: Arc<ConfigSource>,
    ) -> Self {
        Self {
            worker,
            store,
            config,
        }
    }

    pub(crate) fn worker(&self) -> &Arc<dyn JobWorker> {
        &self.worker
    }

    pub(crate) async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Worker {} started for job type {}",
            self.worker.name(),
            self.worker.job_type()
        );

        while !shutdown.is_cancelled() {
            let outcome = self.run_once(&shutdown).await;
            if !outcome.should_back_off() {
                continue;
            }

            let delay = poll_delay(&self.config.current());
            trace!(
                "Worker {} idle ({:?}), polling again in {:?}",
                self.worker.name(),
                outcome,
                delay
            );
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Worker {} stopped", self.worker.name());
    }

    pub(crate) async fn run_once(&self, shutdown: &CancellationToken) -> AttemptOutcome {
        let job_type = self.worker.job_type();
        let config = self.config.current();

        if !self.worker.is_enabled(&config) {
            return AttemptOutcome::Disabled;
        }

        let job = match self.store.claim_next_pending(job_type) {
            Ok(Some(job)) => job,
            Ok(None) => return AttemptOutcome::Idle,
            Err(e) => {
                error!("Worker {} failed to claim a job: {:#}", self.worker.name(), e);
                metrics::record_store_error("claim_next_pending");
                return AttemptOutcome::StoreError;
            }
        };
        metrics::record_job_claimed(job_type);
        let mut claimed = ClaimedJob::new(self.store.clone(), job);
        let job_id = claimed.job().id.clone();

        // A cancel may land between the claim and here
        match self.store.get_job(&job_id) {
            Ok(Some(current)) if current.status == JobStatus::Canceled => {
                info!("Job {} was canceled before it started, skipping", job_id);
                claimed.release();
                return AttemptOutcome::Skipped(job_id);
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to re-read job {} before executing: {:#}", job_id, e),
        }

        let token = match self.worker.shutdown_behavior() {
            ShutdownBehavior::Cancellable => shutdown.child_token(),
            ShutdownBehavior::WaitForCompletion => CancellationToken::new(),
        };
        let ctx = JobContext::new(token, self.store.clone(), config, job_id.clone());

        debug!("Worker {} executing job {}", self.worker.name(), job_id);
        let started = Instant::now();
        let execution = execute_isolated(self.worker.clone(), ctx, claimed.job().clone()).await;
        let elapsed = started.elapsed();

        let status = match execution {
            Execution::Returned(Ok(())) => {
                info!("Job {} of type {} succeeded in {:?}", job_id, job_type, elapsed);
                self.record(&mut claimed, JobStatus::Success, None)
            }
            Execution::Returned(Err(JobError::Cancelled)) => {
                info!("Job {} of type {} was cancelled after {:?}", job_id, job_type, elapsed);
                self.record(&mut claimed, JobStatus::Canceled, Some("job cancelled during shutdown"))
            }
            Execution::Returned(Err(e)) => {
                warn!("Job {} of type {} failed after {:?}: {}", job_id, job_type, elapsed, e);
                self.record(&mut claimed, JobStatus::Error, Some(&e.to_string()))
            }
            Execution::Panicked(payload) => {
                match handle_job_panic(self.store.as_ref(), claimed.job(), payload) {
                    Ok(_) => claimed.release(),
                    Err(e) => error!("Failed to record panic of job {}: {:#}", job_id, e),
                }
                JobStatus::Error
            }
        };

        metrics::record_job_finished(job_type, status, elapsed);
        AttemptOutcome::Finished { job_id, status }
    }

    fn record(&self, claimed: &mut ClaimedJob, status: JobStatus, message: Option<&str>) -> JobStatus {
        let job_id = claimed.job().id.clone();
        match claimed.finish(status, message) {
            Ok(true) => {}
            Ok(false) => info!(
                "Job {} left in_progress while running (likely canceled), result {} discarded",
                job_id, status
            ),
            Err(e) => error!("Failed to record status {} for job {}: {:#}", status, job_id, e),
        }
        status
    }
}

/// Poll interval plus a random jitter, so that workers sharing a store spread out.
fn poll_delay(config: &JobsConfig) -> Duration {
    if config.poll_jitter.is_zero() {
        return config.poll_interval;
    }
    let jitter_millis = u64::try_from(config.poll_jitter.as_millis()).unwrap_or(u64::MAX);
    let random_jitter = rand::rng().random_range(0..=jitter_millis);
    config.poll_interval + Duration::from_millis(random_jitter)
}
