//! Job history cleanup.
//!
//! Periodically deletes finished jobs older than the configured retention.

use crate::background_jobs::{JobContext, JobError, JobWorker, PeriodicScheduler};
use crate::config::JobsConfig;
use crate::job_store::{cutoff_days_before, Job};
use tracing::info;

pub const JOB_TYPE: &str = "job_cleanup";

fn is_enabled(config: &JobsConfig) -> bool {
    config.cleanup.enabled
}

pub fn scheduler(config: &JobsConfig) -> PeriodicScheduler {
    PeriodicScheduler::new(JOB_TYPE, config.cleanup.interval, is_enabled)
}

/// Deletes terminal jobs whose `finished_at` is older than `cleanup.retention_days`.
pub struct JobCleanupWorker;

impl JobWorker for JobCleanupWorker {
    fn name(&self) -> &str {
        "Job Cleanup"
    }

    fn job_type(&self) -> &str {
        JOB_TYPE
    }

    fn is_enabled(&self, config: &JobsConfig) -> bool {
        is_enabled(config)
    }

    fn execute(&self, ctx: &JobContext, _job: &Job) -> Result<(), JobError> {
        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let retention_days = ctx.config.cleanup.retention_days;
        let cutoff = cutoff_days_before(retention_days).ok_or_else(|| {
            JobError::ExecutionFailed(format!("retention of {} days is out of range", retention_days))
        })?;
        info!(
            "Deleting jobs finished more than {} days ago (before {})",
            retention_days, cutoff
        );

        let deleted = ctx
            .store
            .delete_finished_jobs_before(cutoff)
            .map_err(|e| JobError::ExecutionFailed(e.to_string()))?;

        if deleted > 0 {
            info!("Deleted {} old jobs", deleted);
        } else {
            info!("No old jobs to clean up");
        }
        Ok(())
    }
}
