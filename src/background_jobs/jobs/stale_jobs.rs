//! Stale job reaper.
//!
//! A job left `in_progress` by a crashed process would otherwise stay there
//! forever. This job fails every `in_progress` job whose last recorded
//! activity is older than `stale.threshold`. Jobs are not requeued;
//! long-running bodies must call [`JobContext::touch`] to stay alive.

use crate::background_jobs::{JobContext, JobError, JobWorker, PeriodicScheduler};
use crate::config::JobsConfig;
use crate::job_store::{cutoff_before, Job};
use tracing::{info, warn};

pub const JOB_TYPE: &str = "stale_job_reaper";

fn is_enabled(config: &JobsConfig) -> bool {
    config.stale.enabled
}

pub fn scheduler(config: &JobsConfig) -> PeriodicScheduler {
    PeriodicScheduler::new(JOB_TYPE, config.stale.interval, is_enabled)
}

pub struct StaleJobReaper;

impl JobWorker for StaleJobReaper {
    fn name(&self) -> &str {
        "Stale Job Reaper"
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

        let threshold = ctx.config.stale.threshold;
        let inactive_since = cutoff_before(threshold).ok_or_else(|| {
            JobError::ExecutionFailed(format!("stale threshold {:?} is out of range", threshold))
        })?;

        let failed = ctx.store.fail_stale_jobs(inactive_since)?;
        if failed > 0 {
            warn!(
                "Failed {} jobs with no activity since {}",
                failed, inactive_since
            );
        } else {
            info!("No stale jobs found");
        }
        Ok(())
    }
}
