//! Shared fixtures for the job server integration tests.

#![allow(dead_code)]

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use job_server::background_jobs::{JobServer, JobServerSettings};
use job_server::config::{ConfigSource, JobsConfig};
use job_server::job_store::{Job, JobStatus, JobStatusCount, JobStore, SqliteJobStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Fast polling so tests don't wait on the default one second interval.
pub fn fast_config() -> JobsConfig {
    JobsConfig {
        poll_interval: Duration::from_millis(20),
        poll_jitter: Duration::ZERO,
        ..JobsConfig::default()
    }
}

pub struct TestJobServer {
    pub server: JobServer,
    pub store: Arc<dyn JobStore>,
    pub config: Arc<ConfigSource>,
    pub db_path: std::path::PathBuf,
    _temp_dir: TempDir,
}

impl TestJobServer {
    pub fn new(config: JobsConfig, grace: Duration) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("jobs.db");
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(&db_path).unwrap());
        Self::with_store(store, config, grace, temp_dir, db_path)
    }

    /// Server whose store can be switched into a failing mode.
    pub fn with_failing_store(config: JobsConfig) -> (Self, Arc<FailingStore>) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("jobs.db");
        let inner = SqliteJobStore::new(&db_path).unwrap();
        let failing = Arc::new(FailingStore::new(inner));
        let store: Arc<dyn JobStore> = failing.clone();
        let server = Self::with_store(store, config, Duration::from_secs(5), temp_dir, db_path);
        (server, failing)
    }

    fn with_store(
        store: Arc<dyn JobStore>,
        config: JobsConfig,
        grace: Duration,
        temp_dir: TempDir,
        db_path: std::path::PathBuf,
    ) -> Self {
        let config = Arc::new(ConfigSource::new(config));
        let server = JobServer::new(
            store.clone(),
            config.clone(),
            JobServerSettings {
                shutdown_grace_period: grace,
            },
        );
        Self {
            server,
            store,
            config,
            db_path,
            _temp_dir: temp_dir,
        }
    }

    pub fn status_of(&self, id: &str) -> JobStatus {
        self.store.get_job(id).unwrap().unwrap().status
    }

    pub async fn wait_for_status(&self, id: &str, status: JobStatus) -> Job {
        let found = wait_until(Duration::from_secs(5), || {
            self.store
                .get_job(id)
                .ok()
                .flatten()
                .is_some_and(|job| job.status == status)
        })
        .await;
        let job = self.store.get_job(id).unwrap().unwrap();
        assert!(found, "job {} is {}, expected {}", id, job.status, status);
        job
    }
}

/// Polls `condition` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A store that fails every call while `failing` is set.
pub struct FailingStore {
    inner: SqliteJobStore,
    failing: AtomicBool,
}

impl FailingStore {
    pub fn new(inner: SqliteJobStore) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("database is locked");
        }
        Ok(())
    }
}

impl JobStore for FailingStore {
    fn create_job(&self, job_type: &str, data: &HashMap<String, String>) -> Result<Job> {
        self.check()?;
        self.inner.create_job(job_type, data)
    }

    fn claim_next_pending(&self, job_type: &str) -> Result<Option<Job>> {
        self.check()?;
        self.inner.claim_next_pending(job_type)
    }

    fn update_status(&self, id: &str, status: JobStatus, message: Option<&str>) -> Result<bool> {
        self.check()?;
        self.inner.update_status(id, status, message)
    }

    fn list_non_terminal_by_type(&self, job_type: &str) -> Result<Vec<Job>> {
        self.check()?;
        self.inner.list_non_terminal_by_type(job_type)
    }

    fn get_job(&self, id: &str) -> Result<Option<Job>> {
        self.check()?;
        self.inner.get_job(id)
    }

    fn list_jobs_by_type(&self, job_type: &str, limit: usize) -> Result<Vec<Job>> {
        self.check()?;
        self.inner.list_jobs_by_type(job_type, limit)
    }

    fn list_recent_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        self.check()?;
        self.inner.list_recent_jobs(limit)
    }

    fn touch_job(&self, id: &str) -> Result<bool> {
        self.check()?;
        self.inner.touch_job(id)
    }

    fn fail_stale_jobs(&self, inactive_since: DateTime<Utc>) -> Result<usize> {
        self.check()?;
        self.inner.fail_stale_jobs(inactive_since)
    }

    fn delete_finished_jobs_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.check()?;
        self.inner.delete_finished_jobs_before(cutoff)
    }

    fn count_jobs_by_status(&self) -> Result<Vec<JobStatusCount>> {
        self.check()?;
        self.inner.count_jobs_by_status()
    }
}
