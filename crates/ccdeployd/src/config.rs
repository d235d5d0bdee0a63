//! ccdeployd.toml configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use ccdeploy_updater::UpdaterConfig;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory holding `ccdeploy.redb`.
    pub data_dir: PathBuf,
    /// `host:port` of the workload scheduler.
    pub scheduler_address: String,
    pub scheduler_timeout_ms: u64,
    /// Seconds between control loop ticks.
    pub update_frequency_secs: u64,
    pub max_workers: usize,
    pub log_format: LogFormat,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/ccdeploy"),
            scheduler_address: "127.0.0.1:8889".to_string(),
            scheduler_timeout_ms: 10_000,
            update_frequency_secs: 5,
            max_workers: UpdaterConfig::default().max_workers,
            log_format: LogFormat::Text,
        }
    }
}

/// Values given on the command line; each one set wins over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub data_dir: Option<PathBuf>,
    pub scheduler_address: Option<String>,
    pub update_frequency_secs: Option<u64>,
    pub max_workers: Option<usize>,
    pub log_format: Option<LogFormat>,
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from `path` when given, defaults otherwise, then apply overrides.
    pub fn load(path: Option<&Path>, overrides: ConfigOverrides) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply(overrides);
        anyhow::ensure!(config.update_frequency_secs > 0, "update_frequency_secs must be positive");
        anyhow::ensure!(config.max_workers > 0, "max_workers must be positive");
        Ok(config)
    }

    fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(data_dir) = overrides.data_dir {
            self.data_dir = data_dir;
        }
        if let Some(address) = overrides.scheduler_address {
            self.scheduler_address = address;
        }
        if let Some(secs) = overrides.update_frequency_secs {
            self.update_frequency_secs = secs;
        }
        if let Some(max_workers) = overrides.max_workers {
            self.max_workers = max_workers;
        }
        if let Some(format) = overrides.log_format {
            self.log_format = format;
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("ccdeploy.redb")
    }

    pub fn scheduler_timeout(&self) -> Duration {
        Duration::from_millis(self.scheduler_timeout_ms)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_frequency_secs)
    }

    pub fn updater(&self) -> UpdaterConfig {
        UpdaterConfig {
            max_workers: self.max_workers,
        }
    }
}
