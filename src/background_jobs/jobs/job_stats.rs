//! Publishes job counts per type and status to the metrics registry.

use crate::background_jobs::{JobContext, JobError, JobWorker, PeriodicScheduler};
use crate::config::JobsConfig;
use crate::job_store::Job;
use crate::metrics;
use tracing::debug;

pub const JOB_TYPE: &str = "job_stats";

fn is_enabled(config: &JobsConfig) -> bool {
    config.metrics_enabled
}

pub fn scheduler(config: &JobsConfig) -> PeriodicScheduler {
    PeriodicScheduler::new(JOB_TYPE, config.stats.interval, is_enabled)
}

pub struct JobStatsWorker;

impl JobWorker for JobStatsWorker {
    fn name(&self) -> &str {
        "Job Stats"
    }

    fn job_type(&self) -> &str {
        JOB_TYPE
    }

    fn is_enabled(&self, config: &JobsConfig) -> bool {
        is_enabled(config)
    }

    fn execute(&self, ctx: &JobContext, _job: &Job) -> Result<(), JobError> {
        let counts = ctx.store.count_jobs_by_status()?;
        debug!("Publishing {} job status counts", counts.len());
        metrics::set_job_counts(&counts);
        Ok(())
    }
}
