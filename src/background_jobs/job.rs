use super::context::JobContext;
use crate::config::JobsConfig;
use crate::job_store::Job;
use std::collections::HashMap;
use std::time::Duration;

/// How a running job body is treated when the server stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownBehavior {
    /// The job's cancellation token fires on stop; the body should return
    /// `JobError::Cancelled` at its next check.
    #[default]
    Cancellable,
    /// The token is left alone and the body runs to completion (bounded by
    /// the server's grace period).
    WaitForCompletion,
}

/// Errors a job body can return.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("job was cancelled")]
    Cancelled,
    #[error("job store error: {0}")]
    Store(String),
}

impl From<anyhow::Error> for JobError {
    fn from(e: anyhow::Error) -> Self {
        JobError::Store(format!("{:#}", e))
    }
}

/// Executes jobs of one type.
///
/// `execute` runs on the blocking thread pool, so it may block on I/O. It is
/// called inside a `tracing` span that carries the job id and type.
pub trait JobWorker: Send + Sync {
    fn name(&self) -> &str;

    fn job_type(&self) -> &str;

    /// Evaluated against the current configuration before every claim.
    fn is_enabled(&self, config: &JobsConfig) -> bool;

    fn shutdown_behavior(&self) -> ShutdownBehavior {
        ShutdownBehavior::Cancellable
    }

    fn execute(&self, ctx: &JobContext, job: &Job) -> Result<(), JobError>;
}

/// Decides when a new job of its type should be created.
pub trait JobScheduler: Send + Sync {
    fn job_type(&self) -> &str;

    /// Time between ticks. Must be non-zero.
    fn interval(&self) -> Duration;

    /// Evaluated against the current configuration on every tick.
    fn is_enabled(&self, config: &JobsConfig) -> bool;

    /// An exclusive scheduler never creates a job while another job of its
    /// type is still pending or in progress.
    fn is_exclusive(&self) -> bool {
        true
    }

    fn initial_data(&self) -> HashMap<String, String> {
        HashMap::new()
    }
}

type EnabledFn = Box<dyn Fn(&JobsConfig) -> bool + Send + Sync>;
type ExecuteFn = Box<dyn Fn(&JobContext, &Job) -> Result<(), JobError> + Send + Sync>;

/// A fixed-interval scheduler gated by a configuration predicate.
pub struct PeriodicScheduler {
    job_type: String,
    interval: Duration,
    exclusive: bool,
    is_enabled: EnabledFn,
}

impl PeriodicScheduler {
    pub fn new(
        job_type: impl Into<String>,
        interval: Duration,
        is_enabled: impl Fn(&JobsConfig) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            job_type: job_type.into(),
            interval,
            exclusive: true,
            is_enabled: Box::new(is_enabled),
        }
    }

    /// Allow several outstanding jobs of this type at once.
    pub fn non_exclusive(mut self) -> Self {
        self.exclusive = false;
        self
    }
}

impl JobScheduler for PeriodicScheduler {
    fn job_type(&self) -> &str {
        &self.job_type
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn is_enabled(&self, config: &JobsConfig) -> bool {
        (self.is_enabled)(config)
    }

    fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

/// A worker assembled from a predicate and an execute function.
pub struct SimpleWorker {
    name: String,
    job_type: String,
    is_enabled: EnabledFn,
    execute: ExecuteFn,
}

impl SimpleWorker {
    pub fn new(
        name: impl Into<String>,
        job_type: impl Into<String>,
        is_enabled: impl Fn(&JobsConfig) -> bool + Send + Sync + 'static,
        execute: impl Fn(&JobContext, &Job) -> Result<(), JobError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            job_type: job_type.into(),
            is_enabled: Box::new(is_enabled),
            execute: Box::new(execute),
        }
    }
}

impl JobWorker for SimpleWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn job_type(&self) -> &str {
        &self.job_type
    }

    fn is_enabled(&self, config: &JobsConfig) -> bool {
        (self.is_enabled)(config)
    }

    fn execute(&self, ctx: &JobContext, job: &Job) -> Result<(), JobError> {
        (self.execute)(ctx, job)
    }
}
