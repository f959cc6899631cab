use crate::config::JobsConfig;
use crate::job_store::JobStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Context provided to a job body during execution.
#[derive(Clone)]
pub struct JobContext {
    /// Fires when the server is stopping, for cancellable workers.
    pub cancellation_token: CancellationToken,

    pub store: Arc<dyn JobStore>,

    /// Configuration snapshot taken when the job was claimed.
    pub config: Arc<JobsConfig>,

    job_id: String,
}

impl JobContext {
    pub fn new(
        cancellation_token: CancellationToken,
        store: Arc<dyn JobStore>,
        config: Arc<JobsConfig>,
        job_id: impl Into<String>,
    ) -> Self {
        Self {
            cancellation_token,
            store,
            config,
            job_id: job_id.into(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Records activity on the running job so it is not reaped as stale.
    /// Returns false if the job is no longer in progress.
    pub fn touch(&self) -> bool {
        match self.store.touch_job(&self.job_id) {
            Ok(touched) => touched,
            Err(e) => {
                warn!("Failed to record activity for job {}: {:#}", self.job_id, e);
                false
            }
        }
    }
}
