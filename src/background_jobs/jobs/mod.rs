//! Job types that maintain the job system itself.

pub mod job_cleanup;
pub mod job_stats;
pub mod stale_jobs;

pub use job_cleanup::JobCleanupWorker;
pub use job_stats::JobStatsWorker;
pub use stale_jobs::StaleJobReaper;

use super::{JobServer, JobServerError};
use crate::config::JobsConfig;
use std::sync::Arc;

/// Registers the scheduler and worker of every built-in job type.
pub fn register_builtin_jobs(server: &JobServer, config: &JobsConfig) -> Result<(), JobServerError> {
    server.register_scheduler(Arc::new(job_cleanup::scheduler(config)))?;
    server.register_worker(Arc::new(JobCleanupWorker))?;

    server.register_scheduler(Arc::new(stale_jobs::scheduler(config)))?;
    server.register_worker(Arc::new(StaleJobReaper))?;

    server.register_scheduler(Arc::new(job_stats::scheduler(config)))?;
    server.register_worker(Arc::new(JobStatsWorker))?;
    Ok(())
}
