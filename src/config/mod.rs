mod file_config;
mod snapshot;

pub use file_config::{
    CleanupConfig, FileConfig, JobTypesConfig, MetricsConfig, ShutdownConfig, StaleConfig,
    StatsConfig, WorkersConfig,
};
pub use snapshot::{ConfigSnapshot, ConfigSource};

use crate::job_store::{cutoff_before, cutoff_days_before};
use anyhow::{bail, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub metrics_port: u16,
    pub poll_interval_ms: Option<u64>,
    pub grace_period_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    pub metrics_port: u16,
    pub shutdown_grace_period: Duration,

    /// Initial value of the hot-swappable snapshot.
    pub jobs: JobsConfig,
}

/// Settings read by schedulers and workers on every tick and poll.
///
/// Never mutated after construction; a change produces a whole new value
/// published through [`ConfigSource`].
#[derive(Debug, Clone, PartialEq)]
pub struct JobsConfig {
    pub poll_interval: Duration,
    pub poll_jitter: Duration,
    pub metrics_enabled: bool,
    pub cleanup: CleanupSettings,
    pub stale: StaleSettings,
    pub stats: StatsSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CleanupSettings {
    pub enabled: bool,
    pub retention_days: u64,
    /// Read when the scheduler is registered; a reload does not change it.
    pub interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StaleSettings {
    pub enabled: bool,
    /// An `in_progress` job with no activity for this long is failed.
    pub threshold: Duration,
    pub interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsSettings {
    pub interval: Duration,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            poll_jitter: Duration::from_millis(250),
            metrics_enabled: true,
            cleanup: CleanupSettings {
                enabled: true,
                retention_days: 30,
                interval: Duration::from_secs(60 * 60),
            },
            stale: StaleSettings {
                enabled: true,
                threshold: Duration::from_secs(60 * 60),
                interval: Duration::from_secs(5 * 60),
            },
            stats: StatsSettings {
                interval: Duration::from_secs(10 * 60),
            },
        }
    }
}

impl JobsConfig {
    /// Builds the snapshot from the file, falling back to CLI values and then defaults.
    pub fn resolve(cli: &CliConfig, file: &FileConfig) -> Self {
        let defaults = Self::default();
        let workers = file.workers.clone().unwrap_or_default();
        let metrics = file.metrics.clone().unwrap_or_default();
        let jobs = file.jobs.clone().unwrap_or_default();
        let cleanup = jobs.cleanup.unwrap_or_default();
        let stale = jobs.stale.unwrap_or_default();
        let stats = jobs.stats.unwrap_or_default();

        let poll_interval = workers
            .poll_interval_ms
            .or(cli.poll_interval_ms)
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);

        Self {
            poll_interval,
            poll_jitter: workers
                .jitter_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_jitter),
            metrics_enabled: metrics.enable.unwrap_or(defaults.metrics_enabled),
            cleanup: CleanupSettings {
                enabled: cleanup.enabled.unwrap_or(defaults.cleanup.enabled),
                retention_days: cleanup
                    .retention_days
                    .unwrap_or(defaults.cleanup.retention_days),
                interval: cleanup
                    .interval_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.cleanup.interval),
            },
            stale: StaleSettings {
                enabled: stale.enabled.unwrap_or(defaults.stale.enabled),
                threshold: stale
                    .threshold_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.stale.threshold),
                interval: stale
                    .interval_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.stale.interval),
            },
            stats: StatsSettings {
                interval: stats
                    .interval_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.stats.interval),
            },
        }
    }

    /// Re-reads the job settings from a config file, for hot reload.
    pub fn load(cli: &CliConfig, path: &Path) -> Result<Self> {
        let file = FileConfig::load(path)?;
        let config = Self::resolve(cli, &file);
        config.validate()?;
        Ok(config)
    }

    /// Settings in `next` that differ from `self` but are only read when the
    /// schedulers are registered, so a reload does not apply them.
    pub fn restart_only_changes(&self, next: &JobsConfig) -> Vec<&'static str> {
        let intervals = [
            (
                "jobs.cleanup.interval_secs",
                self.cleanup.interval,
                next.cleanup.interval,
            ),
            (
                "jobs.stale.interval_secs",
                self.stale.interval,
                next.stale.interval,
            ),
            (
                "jobs.stats.interval_secs",
                self.stats.interval,
                next.stats.interval,
            ),
        ];
        intervals
            .into_iter()
            .filter(|(_, current, next)| current != next)
            .map(|(name, _, _)| name)
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            bail!("workers.poll_interval_ms must be greater than 0");
        }
        if self.stale.threshold.is_zero() {
            bail!("jobs.stale.threshold_secs must be greater than 0");
        }
        if cutoff_before(self.stale.threshold).is_none() {
            bail!("jobs.stale.threshold_secs is out of range");
        }
        if cutoff_days_before(self.cleanup.retention_days).is_none() {
            bail!("jobs.cleanup.retention_days is out of range");
        }
        Ok(())
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .clone()
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);

        let grace_period_secs = file
            .shutdown
            .as_ref()
            .and_then(|s| s.grace_period_secs)
            .or(cli.grace_period_secs)
            .unwrap_or(30);

        let jobs = JobsConfig::resolve(cli, &file);
        jobs.validate()?;

        Ok(Self {
            db_dir,
            metrics_port,
            shutdown_grace_period: Duration::from_secs(grace_period_secs),
            jobs,
        })
    }

    pub fn jobs_db_path(&self) -> PathBuf {
        self.db_dir.join("jobs.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_temp_db_dir() -> TempDir {
        TempDir::new().unwrap()
    }

    #[test]
    fn test_resolve_cli_only() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            metrics_port: 9091,
            poll_interval_ms: Some(200),
            grace_period_secs: Some(5),
        };

        let config = AppConfig::resolve(&cli, None).unwrap();

        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.metrics_port, 9091);
        assert_eq!(config.shutdown_grace_period, Duration::from_secs(5));
        assert_eq!(config.jobs.poll_interval, Duration::from_millis(200));
        assert_eq!(config.jobs_db_path(), temp_dir.path().join("jobs.db"));
    }

    #[test]
    fn test_toml_overrides_cli() {
        let cli_dir = make_temp_db_dir();
        let toml_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(cli_dir.path().to_path_buf()),
            metrics_port: 9091,
            poll_interval_ms: Some(200),
            grace_period_secs: None,
        };
        let file = FileConfig {
            db_dir: Some(toml_dir.path().to_string_lossy().into_owned()),
            metrics_port: Some(0),
            workers: Some(WorkersConfig {
                poll_interval_ms: Some(50),
                jitter_ms: Some(0),
            }),
            shutdown: Some(ShutdownConfig {
                grace_period_secs: Some(2),
            }),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, Some(file)).unwrap();

        assert_eq!(config.db_dir, toml_dir.path());
        assert_eq!(config.metrics_port, 0);
        assert_eq!(config.shutdown_grace_period, Duration::from_secs(2));
        assert_eq!(config.jobs.poll_interval, Duration::from_millis(50));
        assert_eq!(config.jobs.poll_jitter, Duration::ZERO);
    }

    #[test]
    fn test_defaults_when_nothing_set() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, None).unwrap();

        assert_eq!(config.shutdown_grace_period, Duration::from_secs(30));
        assert_eq!(config.jobs, JobsConfig::default());
    }

    #[test]
    fn test_job_sections() {
        let file: FileConfig = toml::from_str(
            r#"
            [metrics]
            enable = false

            [jobs.cleanup]
            enabled = false
            retention_days = 3

            [jobs.stale]
            threshold_secs = 120
            "#,
        )
        .unwrap();

        let jobs = JobsConfig::resolve(&CliConfig::default(), &file);

        assert!(!jobs.metrics_enabled);
        assert!(!jobs.cleanup.enabled);
        assert_eq!(jobs.cleanup.retention_days, 3);
        assert!(jobs.stale.enabled);
        assert_eq!(jobs.stale.threshold, Duration::from_secs(120));
    }

    #[test]
    fn test_missing_db_dir() {
        let cli = CliConfig::default();
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("db_dir"));
    }

    #[test]
    fn test_nonexistent_db_dir() {
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/nonexistent/path/to/db")),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            poll_interval_ms: Some(0),
            ..Default::default()
        };
        assert!(AppConfig::resolve(&cli, None).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = make_temp_db_dir();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[jobs.stats]\ninterval_secs = 15\n").unwrap();

        let jobs = JobsConfig::load(&CliConfig::default(), &path).unwrap();
        assert_eq!(jobs.stats.interval, Duration::from_secs(15));

        std::fs::write(&path, "[jobs.stats\n").unwrap();
        assert!(JobsConfig::load(&CliConfig::default(), &path).is_err());

        std::fs::write(&path, "[jobs.stale]\nthreshold_secs = 0\n").unwrap();
        let err = JobsConfig::load(&CliConfig::default(), &path).unwrap_err();
        assert!(err.to_string().contains("threshold_secs"));

        std::fs::write(&path, "[jobs.stale]\nthreshold_secs = 99999999999999\n").unwrap();
        let err = JobsConfig::load(&CliConfig::default(), &path).unwrap_err();
        assert!(err.to_string().contains("out of range"));

        std::fs::write(&path, "[jobs.cleanup]\nretention_days = 9999999999\n").unwrap();
        let err = JobsConfig::load(&CliConfig::default(), &path).unwrap_err();
        assert!(err.to_string().contains("retention_days"));
    }

    #[test]
    fn test_restart_only_changes_lists_intervals() {
        let current = JobsConfig::default();
        let mut next = current.clone();
        next.poll_interval = Duration::from_millis(5);
        next.cleanup.enabled = false;
        assert!(current.restart_only_changes(&next).is_empty());

        next.stale.interval = Duration::from_secs(1);
        next.stats.interval = Duration::from_secs(2);
        assert_eq!(
            current.restart_only_changes(&next),
            vec!["jobs.stale.interval_secs", "jobs.stats.interval_secs"]
        );
    }
}
