//! Process-wide, hot-swappable job configuration.

use super::JobsConfig;
use std::sync::Arc;
use tokio::sync::watch;

/// One published configuration, tagged with a monotonically increasing version.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub config: Arc<JobsConfig>,
}

/// Holds the current [`JobsConfig`] and replaces it wholesale on update.
///
/// Readers take an `Arc` to the snapshot that is current at the time of the
/// call, so a decision made with it can never see half of an update.
pub struct ConfigSource {
    tx: watch::Sender<ConfigSnapshot>,
}

impl ConfigSource {
    pub fn new(initial: JobsConfig) -> Self {
        let (tx, _) = watch::channel(ConfigSnapshot {
            version: 1,
            config: Arc::new(initial),
        });
        Self { tx }
    }

    pub fn current(&self) -> Arc<JobsConfig> {
        self.tx.borrow().config.clone()
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        self.tx.borrow().clone()
    }

    pub fn version(&self) -> u64 {
        self.tx.borrow().version
    }

    /// Publishes `config` and returns its version.
    pub fn replace(&self, config: JobsConfig) -> u64 {
        let config = Arc::new(config);
        let mut version = 0;
        self.tx.send_modify(|snapshot| {
            snapshot.version += 1;
            snapshot.config = config;
            version = snapshot.version;
        });
        version
    }

    pub fn subscribe(&self) -> watch::Receiver<ConfigSnapshot> {
        self.tx.subscribe()
    }
}

impl Default for ConfigSource {
    fn default() -> Self {
        Self::new(JobsConfig::default())
    }
}
