use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct FileConfig {
    // Process settings (can override CLI)
    pub db_dir: Option<String>,
    pub metrics_port: Option<u16>,

    pub workers: Option<WorkersConfig>,
    pub shutdown: Option<ShutdownConfig>,
    pub metrics: Option<MetricsConfig>,
    pub jobs: Option<JobTypesConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct WorkersConfig {
    pub poll_interval_ms: Option<u64>,
    pub jitter_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ShutdownConfig {
    pub grace_period_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct MetricsConfig {
    pub enable: Option<bool>,
}

/// Per job type settings, under `[jobs.<name>]`.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct JobTypesConfig {
    pub cleanup: Option<CleanupConfig>,
    pub stale: Option<StaleConfig>,
    pub stats: Option<StatsConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: Option<bool>,
    pub retention_days: Option<u64>,
    pub interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct StaleConfig {
    pub enabled: Option<bool>,
    pub threshold_secs: Option<u64>,
    pub interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct StatsConfig {
    pub interval_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
