use anyhow::Result;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use job_server::background_jobs::jobs::register_builtin_jobs;
use job_server::background_jobs::{JobServer, JobServerSettings};
use job_server::config::{self, ConfigSource, JobsConfig};
use job_server::job_store::{JobStore, SqliteJobStore};
use job_server::{metrics, shutdown};

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(s);
    if path.is_absolute() {
        return Ok(path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(path))
}

fn parse_dir(s: &str) -> Result<PathBuf, String> {
    let path = parse_path(s)?;
    if !path.exists() {
        return Err(format!("Directory does not exist: {}", s));
    }
    if !path.is_dir() {
        return Err(format!("Path is not a directory: {}", s));
    }
    Ok(path)
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    /// Sending SIGHUP re-reads the job settings from it.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory holding jobs.db. Can also be specified in config file.
    #[clap(long, value_parser = parse_dir)]
    pub db_dir: Option<PathBuf>,

    /// The port for the metrics server (Prometheus scraping). 0 disables it.
    #[clap(long, default_value_t = 9091)]
    pub metrics_port: u16,

    /// How often idle workers poll for pending jobs.
    #[clap(long)]
    pub poll_interval_ms: Option<u64>,

    /// How long shutdown waits for running jobs before aborting them.
    #[clap(long)]
    pub grace_period_secs: Option<u64>,
}

impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        config::CliConfig {
            db_dir: args.db_dir.clone(),
            metrics_port: args.metrics_port,
            poll_interval_ms: args.poll_interval_ms,
            grace_period_secs: args.grace_period_secs,
        }
    }
}

/// Publishes a new snapshot on every SIGHUP. A file that fails to load or
/// validate leaves the current snapshot in place.
fn spawn_config_reloader(
    config_path: PathBuf,
    cli_config: config::CliConfig,
    source: Arc<ConfigSource>,
) -> Result<()> {
    let mut hangups = shutdown::reload_signal()?;
    tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            reload(&config_path, &cli_config, &source);
        }
    });
    Ok(())
}

fn reload(path: &Path, cli_config: &config::CliConfig, source: &ConfigSource) {
    info!("Reloading job configuration from {:?}", path);
    match JobsConfig::load(cli_config, path) {
        Ok(jobs) => {
            let current = source.current();
            if *current == jobs {
                info!("Job configuration unchanged");
                return;
            }
            for setting in current.restart_only_changes(&jobs) {
                warn!("{} changed, the new value applies after a restart", setting);
            }
            let version = source.replace(jobs);
            info!("Job configuration reloaded (version {})", version);
        }
        Err(e) => error!("Failed to reload configuration, keeping current: {:#}", e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(config::FileConfig::load(path)?)
        }
        None => None,
    };

    let cli_config: config::CliConfig = (&cli_args).into();
    let app_config = config::AppConfig::resolve(&cli_config, file_config)?;

    info!("Configuration loaded:");
    info!("  db_dir: {:?}", app_config.db_dir);
    info!("  metrics_port: {}", app_config.metrics_port);
    info!("  poll_interval: {:?}", app_config.jobs.poll_interval);
    info!("  shutdown_grace_period: {:?}", app_config.shutdown_grace_period);

    let db_path = app_config.jobs_db_path();
    if !db_path.exists() {
        info!("Creating new jobs database at {:?}", db_path);
    }
    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(&db_path)?);

    info!("Initializing metrics...");
    metrics::init_metrics();

    let config_source = Arc::new(ConfigSource::new(app_config.jobs.clone()));
    let server = JobServer::new(
        store,
        config_source.clone(),
        JobServerSettings {
            shutdown_grace_period: app_config.shutdown_grace_period,
        },
    );
    register_builtin_jobs(&server, &app_config.jobs)?;

    let shutdown_token = shutdown::install_shutdown_handler()?;
    if let Some(path) = cli_args.config.clone() {
        spawn_config_reloader(path, cli_config.clone(), config_source.clone())?;
    }

    if app_config.metrics_port > 0 {
        let port = app_config.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = metrics::run_metrics_server(port).await {
                error!("Metrics server failed: {:#}", e);
            }
        });
        info!("Metrics available at port {}!", port);
    }

    server.start()?;
    for info in server.registered_types() {
        info!(
            "  {}: worker {:?}, every {:?}s",
            info.job_type,
            info.worker.as_deref().unwrap_or("-"),
            info.schedule_interval_secs
        );
    }

    shutdown_token.cancelled().await;
    server.stop().await?;
    info!("Shutdown complete");
    Ok(())
}
