use super::job::JobScheduler;
use crate::config::ConfigSource;
use crate::job_store::JobStore;
use crate::metrics;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of one scheduler tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The predicate rejected the current configuration.
    Disabled,
    /// An exclusive scheduler found a pending or running job of its type.
    SkippedOutstanding,
    Created(String),
    /// The store failed; nothing was created and the next tick retries.
    StoreError,
}

impl TickOutcome {
    fn label(&self) -> &'static str {
        match self {
            TickOutcome::Disabled => "disabled",
            TickOutcome::SkippedOutstanding => "skipped",
            TickOutcome::Created(_) => "created",
            TickOutcome::StoreError => "store_error",
        }
    }
}

/// Drives one registered [`JobScheduler`].
pub(crate) struct SchedulerRunner {
    scheduler: Arc<dyn JobScheduler>,
    store: Arc<dyn JobStore>,
    config: Arc<ConfigSource>,
    /// Serializes ticks from the timer loop and manual triggers.
    tick_lock: Mutex<()>,
}

impl SchedulerRunner {
    pub(crate) fn new(
        scheduler: Arc<dyn JobScheduler>,
        store: Arc<dyn JobStore>,
        config: Arc<ConfigSource>,
    ) -> Self {
        Self {
            scheduler,
            store,
            config,
            tick_lock: Mutex::new(()),
        }
    }

    pub(crate) fn scheduler(&self) -> &Arc<dyn JobScheduler> {
        &self.scheduler
    }

    pub(crate) async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let job_type = self.scheduler.job_type().to_string();
        let period = self.scheduler.interval();
        info!("Scheduler for {} started, ticking every {:?}", job_type, period);

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the first immediate tick, wait for the first interval
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }

        info!("Scheduler for {} stopped", job_type);
    }

    pub(crate) fn tick(&self) -> TickOutcome {
        let _guard = self
            .tick_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let outcome = self.evaluate();
        metrics::record_scheduler_tick(self.scheduler.job_type(), outcome.label());
        outcome
    }

    fn evaluate(&self) -> TickOutcome {
        let job_type = self.scheduler.job_type();
        let config = self.config.current();

        if !self.scheduler.is_enabled(&config) {
            debug!("Scheduler for {} is disabled, skipping tick", job_type);
            return TickOutcome::Disabled;
        }

        if self.scheduler.is_exclusive() {
            match self.store.list_non_terminal_by_type(job_type) {
                Ok(outstanding) if !outstanding.is_empty() => {
                    debug!(
                        "Scheduler for {} skipping tick, job {} is still {}",
                        job_type, outstanding[0].id, outstanding[0].status
                    );
                    return TickOutcome::SkippedOutstanding;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Scheduler for {} failed to list jobs: {:#}", job_type, e);
                    metrics::record_store_error("list_non_terminal");
                    return TickOutcome::StoreError;
                }
            }
        }

        match self
            .store
            .create_job(job_type, &self.scheduler.initial_data())
        {
            Ok(job) => {
                info!("Scheduled job {} of type {}", job.id, job_type);
                metrics::record_job_created(job_type);
                TickOutcome::Created(job.id)
            }
            Err(e) => {
                warn!("Scheduler for {} failed to create job: {:#}", job_type, e);
                metrics::record_store_error("create_job");
                TickOutcome::StoreError
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background_jobs::PeriodicScheduler;
    use crate::config::JobsConfig;
    use crate::job_store::{JobStatus, SqliteJobStore};
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        store: Arc<dyn JobStore>,
        config: Arc<ConfigSource>,
        _temp_dir: TempDir,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let store: Arc<dyn JobStore> =
            Arc::new(SqliteJobStore::new(temp_dir.path().join("jobs.db")).unwrap());
        Fixture {
            store,
            config: Arc::new(ConfigSource::default()),
            _temp_dir: temp_dir,
        }
    }

    fn runner(f: &Fixture, scheduler: PeriodicScheduler) -> SchedulerRunner {
        SchedulerRunner::new(Arc::new(scheduler), f.store.clone(), f.config.clone())
    }

    #[test]
    fn test_exclusive_tick_waits_for_outstanding_job() {
        let f = fixture();
        let runner = runner(
            &f,
            PeriodicScheduler::new("report", Duration::from_secs(60), |_| true),
        );

        let TickOutcome::Created(id) = runner.tick() else {
            panic!("first tick should create a job");
        };
        assert_eq!(runner.tick(), TickOutcome::SkippedOutstanding);

        f.store.claim_next_pending("report").unwrap();
        assert_eq!(runner.tick(), TickOutcome::SkippedOutstanding);

        f.store
            .update_status(&id, JobStatus::Success, None)
            .unwrap();
        assert!(matches!(runner.tick(), TickOutcome::Created(_)));
    }

    #[test]
    fn test_non_exclusive_tick_always_creates() {
        let f = fixture();
        let runner = runner(
            &f,
            PeriodicScheduler::new("report", Duration::from_secs(60), |_| true).non_exclusive(),
        );

        for _ in 0..3 {
            assert!(matches!(runner.tick(), TickOutcome::Created(_)));
        }
        assert_eq!(f.store.list_non_terminal_by_type("report").unwrap().len(), 3);
    }

    #[test]
    fn test_disabled_predicate_never_creates() {
        let f = fixture();
        let runner = runner(
            &f,
            PeriodicScheduler::new("report", Duration::from_secs(60), |c: &JobsConfig| {
                c.metrics_enabled
            }),
        );
        f.config.replace(JobsConfig {
            metrics_enabled: false,
            ..JobsConfig::default()
        });

        for _ in 0..5 {
            assert_eq!(runner.tick(), TickOutcome::Disabled);
        }
        assert!(f.store.list_jobs_by_type("report", 10).unwrap().is_empty());

        // Picks up the new snapshot without a restart
        f.config.replace(JobsConfig::default());
        assert!(matches!(runner.tick(), TickOutcome::Created(_)));
    }

    #[test]
    fn test_initial_data_is_attached() {
        struct WithData;
        impl JobScheduler for WithData {
            fn job_type(&self) -> &str {
                "with_data"
            }
            fn interval(&self) -> Duration {
                Duration::from_secs(1)
            }
            fn is_enabled(&self, _config: &JobsConfig) -> bool {
                true
            }
            fn initial_data(&self) -> HashMap<String, String> {
                HashMap::from([("origin".to_string(), "schedule".to_string())])
            }
        }

        let f = fixture();
        let runner = SchedulerRunner::new(Arc::new(WithData), f.store.clone(), f.config.clone());

        let TickOutcome::Created(id) = runner.tick() else {
            panic!("tick should create a job");
        };
        let job = f.store.get_job(&id).unwrap().unwrap();
        assert_eq!(job.data.get("origin").map(String::as_str), Some("schedule"));
    }

    #[tokio::test]
    async fn test_run_ticks_on_interval_and_stops_on_cancel() {
        let f = fixture();
        let runner = Arc::new(runner(
            &f,
            PeriodicScheduler::new("report", Duration::from_millis(100), |_| true)
                .non_exclusive(),
        ));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(runner.clone().run(shutdown.clone()));

        // No tick at start
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(f.store.list_jobs_by_type("report", 10).unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!f.store.list_jobs_by_type("report", 10).unwrap().is_empty());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
