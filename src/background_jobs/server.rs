use super::isolation::{self, PanicPayload};
use super::job::{JobScheduler, JobWorker};
use super::scheduler::{SchedulerRunner, TickOutcome};
use super::worker::WorkerRunner;
use crate::config::ConfigSource;
use crate::job_store::{Job, JobStore};
use crate::metrics;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Errors reported synchronously by the [`JobServer`] API.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JobServerError {
    #[error("job server already started")]
    AlreadyStarted,
    #[error("job server is not running")]
    NotRunning,
    #[error("a scheduler for job type {0} is already registered")]
    DuplicateScheduler(String),
    #[error("a worker for job type {0} is already registered")]
    DuplicateWorker(String),
    #[error("scheduler for job type {0} has a zero interval")]
    InvalidInterval(String),
}

#[derive(Debug, Clone)]
pub struct JobServerSettings {
    /// How long `stop` waits for loops and running job bodies before aborting them.
    pub shutdown_grace_period: Duration,
}

impl Default for JobServerSettings {
    fn default() -> Self {
        Self {
            shutdown_grace_period: Duration::from_secs(30),
        }
    }
}

/// Observability view of one registered job type.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobTypeInfo {
    pub job_type: String,
    pub worker: Option<String>,
    pub worker_enabled: Option<bool>,
    pub schedule_interval_secs: Option<u64>,
    pub schedule_exclusive: Option<bool>,
    pub schedule_enabled: Option<bool>,
}

struct Running {
    shutdown: CancellationToken,
    handles: Vec<(String, JoinHandle<()>)>,
}

#[derive(Default)]
struct Registry {
    schedulers: BTreeMap<String, Arc<SchedulerRunner>>,
    workers: BTreeMap<String, Arc<WorkerRunner>>,
    started: bool,
    running: Option<Running>,
}

/// Owns the registered schedulers and workers and runs them as independent tasks.
///
/// Schedulers and workers never talk to each other; the job store is the only
/// thing they share.
pub struct JobServer {
    store: Arc<dyn JobStore>,
    config: Arc<ConfigSource>,
    settings: JobServerSettings,
    registry: Mutex<Registry>,
}

impl JobServer {
    pub fn new(
        store: Arc<dyn JobStore>,
        config: Arc<ConfigSource>,
        settings: JobServerSettings,
    ) -> Self {
        Self {
            store,
            config,
            settings,
            registry: Mutex::new(Registry::default()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // Nothing panics while holding the lock; recover rather than propagate
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn config(&self) -> &Arc<ConfigSource> {
        &self.config
    }

    pub fn register_scheduler(&self, scheduler: Arc<dyn JobScheduler>) -> Result<(), JobServerError> {
        let mut registry = self.registry();
        if registry.started {
            return Err(JobServerError::AlreadyStarted);
        }
        let job_type = scheduler.job_type().to_string();
        if scheduler.interval().is_zero() {
            return Err(JobServerError::InvalidInterval(job_type));
        }
        if registry.schedulers.contains_key(&job_type) {
            return Err(JobServerError::DuplicateScheduler(job_type));
        }

        info!(
            "Registering scheduler for {} (every {:?}, exclusive: {})",
            job_type,
            scheduler.interval(),
            scheduler.is_exclusive()
        );
        let runner = SchedulerRunner::new(scheduler, self.store.clone(), self.config.clone());
        registry.schedulers.insert(job_type, Arc::new(runner));
        Ok(())
    }

    pub fn register_worker(&self, worker: Arc<dyn JobWorker>) -> Result<(), JobServerError> {
        let mut registry = self.registry();
        if registry.started {
            return Err(JobServerError::AlreadyStarted);
        }
        let job_type = worker.job_type().to_string();
        if registry.workers.contains_key(&job_type) {
            return Err(JobServerError::DuplicateWorker(job_type));
        }

        info!("Registering worker {} for {}", worker.name(), job_type);
        let runner = WorkerRunner::new(worker, self.store.clone(), self.config.clone());
        registry.workers.insert(job_type, Arc::new(runner));
        Ok(())
    }

    /// Spawns one task per scheduler and per worker. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) -> Result<(), JobServerError> {
        let mut registry = self.registry();
        if registry.started {
            return Err(JobServerError::AlreadyStarted);
        }
        registry.started = true;

        info!(
            "Starting job server with {} schedulers and {} workers",
            registry.schedulers.len(),
            registry.workers.len()
        );

        let shutdown = CancellationToken::new();
        let mut handles = Vec::with_capacity(registry.schedulers.len() + registry.workers.len());
        for (job_type, runner) in &registry.schedulers {
            let handle = tokio::spawn(runner.clone().run(shutdown.clone()));
            handles.push((format!("scheduler:{}", job_type), handle));
        }
        for (job_type, runner) in &registry.workers {
            let handle = tokio::spawn(runner.clone().run(shutdown.clone()));
            handles.push((format!("worker:{}", job_type), handle));
        }

        registry.running = Some(Running { shutdown, handles });
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.registry().running.is_some()
    }

    /// Signals every loop to finish and waits for them, up to the grace period.
    ///
    /// A worker in the middle of a job lets it finish and records its status
    /// before exiting. Loops still running after the grace period are
    /// aborted; their claimed jobs are recorded as `error`.
    pub async fn stop(&self) -> Result<(), JobServerError> {
        let Running {
            shutdown,
            mut handles,
        } = self.registry().running.take().ok_or(JobServerError::NotRunning)?;

        info!("Stopping job server ({} tasks)...", handles.len());
        shutdown.cancel();

        let grace = self.settings.shutdown_grace_period;
        let all_done = futures::future::join_all(handles.iter_mut().map(|(_, handle)| handle));
        let waited = tokio::time::timeout(grace, all_done).await;
        match waited {
            Ok(results) => {
                for ((name, _), result) in handles.iter().zip(results) {
                    if let Err(e) = result {
                        error!("Job server task {} ended abnormally: {}", name, e);
                    }
                }
            }
            Err(_) => {
                let mut aborted = 0;
                for (name, handle) in &handles {
                    if !handle.is_finished() {
                        warn!("Task {} did not stop within {:?}, aborting", name, grace);
                        handle.abort();
                        aborted += 1;
                    }
                }
                // Wait for aborted tasks to drop their state
                for (_, handle) in handles {
                    let _ = handle.await;
                }
                warn!("Aborted {} job server tasks after the grace period", aborted);
            }
        }

        info!("Job server stopped");
        Ok(())
    }

    /// Runs one tick of the scheduler for `job_type` right now, outside its timer.
    pub fn trigger_scheduler(&self, job_type: &str) -> Option<TickOutcome> {
        let runner = self.registry().schedulers.get(job_type).cloned()?;
        Some(runner.tick())
    }

    /// Creates a one-off job outside any schedule.
    pub fn create_job(&self, job_type: &str, data: &HashMap<String, String>) -> anyhow::Result<Job> {
        let job = self.store.create_job(job_type, data)?;
        metrics::record_job_created(job_type);
        info!("Created one-off job {} of type {}", job.id, job_type);
        Ok(job)
    }

    pub fn cancel_job(&self, id: &str) -> anyhow::Result<bool> {
        let canceled = self.store.cancel_job(id)?;
        if canceled {
            info!("Canceled job {}", id);
        }
        Ok(canceled)
    }

    pub fn get_job(&self, id: &str) -> anyhow::Result<Option<Job>> {
        self.store.get_job(id)
    }

    pub fn list_jobs(&self, job_type: &str, limit: usize) -> anyhow::Result<Vec<Job>> {
        self.store.list_jobs_by_type(job_type, limit)
    }

    pub fn registered_types(&self) -> Vec<JobTypeInfo> {
        // Predicates are user code; evaluate them without holding the registry lock
        let (schedulers, workers) = {
            let registry = self.registry();
            (registry.schedulers.clone(), registry.workers.clone())
        };
        let config = self.config.current();
        let job_types: BTreeSet<&String> = schedulers.keys().chain(workers.keys()).collect();

        job_types
            .into_iter()
            .map(|job_type| {
                let scheduler = schedulers.get(job_type).map(|r| r.scheduler());
                let worker = workers.get(job_type).map(|r| r.worker());
                JobTypeInfo {
                    job_type: job_type.clone(),
                    worker: worker.map(|w| w.name().to_string()),
                    worker_enabled: worker.map(|w| w.is_enabled(&config)),
                    schedule_interval_secs: scheduler.map(|s| s.interval().as_secs()),
                    schedule_exclusive: scheduler.map(|s| s.is_exclusive()),
                    schedule_enabled: scheduler.map(|s| s.is_enabled(&config)),
                }
            })
            .collect()
    }

    /// Logs a panic recovered from `job`'s body and records the job as `error`.
    pub fn handle_job_panic(&self, job: &Job, payload: PanicPayload) -> anyhow::Result<bool> {
        isolation::handle_job_panic(self.store.as_ref(), job, payload)
    }
}

impl Drop for JobServer {
    fn drop(&mut self) {
        let registry = self
            .registry
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(running) = registry.running.take() {
            warn!("Job server dropped while running, cancelling its tasks");
            running.shutdown.cancel();
        }
    }
}
