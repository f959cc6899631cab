//! Panic isolation around job bodies.
//!
//! A job body runs on the blocking pool under `catch_unwind`, and the claimed
//! job is held by a [`ClaimedJob`] guard that records an `error` status if it
//! is dropped before a terminal status was written. Between the two, a claimed
//! job can never stay `in_progress` because of a bug in its body.

use super::context::JobContext;
use super::job::{JobError, JobWorker};
use crate::job_store::{Job, JobStatus, JobStore};
use crate::metrics;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, info_span, warn};

pub type PanicPayload = Box<dyn Any + Send + 'static>;

/// How a job body ended.
pub(crate) enum Execution {
    Returned(Result<(), JobError>),
    Panicked(PanicPayload),
}

/// Runs `worker.execute` on the blocking pool and catches any panic.
pub(crate) async fn execute_isolated(
    worker: Arc<dyn JobWorker>,
    ctx: JobContext,
    job: Job,
) -> Execution {
    let span = info_span!("job", job_id = %job.id, job_type = %job.job_type);
    let result = tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        catch_unwind(AssertUnwindSafe(|| worker.execute(&ctx, &job)))
    })
    .await;

    match result {
        Ok(Ok(returned)) => Execution::Returned(returned),
        Ok(Err(payload)) => Execution::Panicked(payload),
        Err(join_error) => match join_error.try_into_panic() {
            Ok(payload) => Execution::Panicked(payload),
            Err(join_error) => Execution::Returned(Err(JobError::ExecutionFailed(format!(
                "job task did not complete: {}",
                join_error
            )))),
        },
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Logs a recovered panic and moves the job to `error`.
///
/// Returns whether the status write was accepted; it is rejected when the job
/// already left `in_progress` (e.g. it was canceled meanwhile).
pub fn handle_job_panic(
    store: &dyn JobStore,
    job: &Job,
    payload: PanicPayload,
) -> anyhow::Result<bool> {
    let message = panic_message(payload.as_ref());
    error!(
        job_id = %job.id,
        job_type = %job.job_type,
        "Job {} of type {} panicked: {}",
        job.id,
        job.job_type,
        message
    );
    metrics::record_job_panic(&job.job_type);
    store.update_status(
        &job.id,
        JobStatus::Error,
        Some(&format!("job panicked: {}", message)),
    )
}

/// A job this process claimed and has not yet finished.
pub(crate) struct ClaimedJob {
    store: Arc<dyn JobStore>,
    job: Job,
    recorded: bool,
}

impl ClaimedJob {
    pub(crate) fn new(store: Arc<dyn JobStore>, job: Job) -> Self {
        Self {
            store,
            job,
            recorded: false,
        }
    }

    pub(crate) fn job(&self) -> &Job {
        &self.job
    }

    /// Writes the terminal status. Returns false if the store rejected the
    /// transition because the job left `in_progress` without us.
    pub(crate) fn finish(&mut self, status: JobStatus, message: Option<&str>) -> anyhow::Result<bool> {
        let accepted = self.store.update_status(&self.job.id, status, message)?;
        self.recorded = true;
        Ok(accepted)
    }

    /// Marks the job as handled without writing anything.
    pub(crate) fn release(&mut self) {
        self.recorded = true;
    }
}

impl Drop for ClaimedJob {
    fn drop(&mut self) {
        if self.recorded {
            return;
        }
        warn!(
            "Job {} of type {} released without a result, marking it as failed",
            self.job.id, self.job.job_type
        );
        if let Err(e) = self.store.update_status(
            &self.job.id,
            JobStatus::Error,
            Some("job interrupted before recording a result"),
        ) {
            error!("Failed to mark job {} as failed: {:#}", self.job.id, e);
        }
    }
}
