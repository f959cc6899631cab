mod models;
mod schema;
mod sqlite_job_store;

pub use models::{Job, JobStatus, JobStatusCount};
pub use schema::JOB_VERSIONED_SCHEMAS;
pub use sqlite_job_store::SqliteJobStore;

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

/// The instant `age` ago, or `None` when it falls outside the representable range.
pub fn cutoff_before(age: Duration) -> Option<DateTime<Utc>> {
    let age = chrono::Duration::from_std(age).ok()?;
    Utc::now().checked_sub_signed(age)
}

/// Cutoff for a retention expressed in days.
pub fn cutoff_days_before(days: u64) -> Option<DateTime<Utc>> {
    cutoff_before(Duration::from_secs(days.checked_mul(24 * 60 * 60)?))
}

/// Durable storage of job records.
///
/// Every status write is conditional on the job's current status (see
/// [`JobStatus::allowed_predecessors`]); a rejected write returns `Ok(false)`.
pub trait JobStore: Send + Sync {
    /// Inserts a new `pending` job.
    fn create_job(&self, job_type: &str, data: &HashMap<String, String>) -> Result<Job>;

    /// Atomically moves the oldest `pending` job of `job_type` to `in_progress`.
    /// Returns `None` when there is nothing to claim.
    fn claim_next_pending(&self, job_type: &str) -> Result<Option<Job>>;

    fn update_status(&self, id: &str, status: JobStatus, message: Option<&str>) -> Result<bool>;

    fn list_non_terminal_by_type(&self, job_type: &str) -> Result<Vec<Job>>;
    fn get_job(&self, id: &str) -> Result<Option<Job>>;
    fn list_jobs_by_type(&self, job_type: &str, limit: usize) -> Result<Vec<Job>>;
    fn list_recent_jobs(&self, limit: usize) -> Result<Vec<Job>>;

    fn cancel_job(&self, id: &str) -> Result<bool> {
        self.update_status(id, JobStatus::Canceled, Some("canceled by request"))
    }

    /// Heartbeat for a running job.
    fn touch_job(&self, id: &str) -> Result<bool>;

    /// Fails `in_progress` jobs with no activity since `inactive_since`.
    fn fail_stale_jobs(&self, inactive_since: DateTime<Utc>) -> Result<usize>;

    /// Deletes terminal jobs that finished before `cutoff`.
    fn delete_finished_jobs_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    fn count_jobs_by_status(&self) -> Result<Vec<JobStatusCount>>;
}
