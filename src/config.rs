use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use tracing::debug;

use crate::core::SplitPolicy;
use crate::planning::DEFAULT_MAX_NODES;
use crate::{Error, Result};

/// Scheduler limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum in-flight transfers per campaign run.
    pub max_concurrent: usize,
    pub transfer_timeout_secs: u64,
    /// Automatic retries per task before operator intervention is needed.
    pub max_retries: u32,
    /// Base delay before a retried transfer; doubles with each retry.
    pub retry_backoff_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            transfer_timeout_secs: 30,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl SchedulerConfig {
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Split policy applied to map specs that do not name one.
    #[serde(default)]
    pub default_split_policy: SplitPolicy,
    /// Safety limit on nodes per map.
    #[serde(default = "default_max_nodes")]
    pub max_nodes: u64,
    /// State file override; defaults to `~/.washmap/state.json`.
    pub state_file: Option<String>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

fn default_max_nodes() -> u64 {
    DEFAULT_MAX_NODES
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_split_policy: SplitPolicy::default(),
            max_nodes: DEFAULT_MAX_NODES,
            state_file: None,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Config {
    pub fn washmap_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".washmap"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::washmap_dir()?.join("washmap.toml"))
    }

    /// Effective state file location.
    pub fn state_path(&self) -> Result<PathBuf> {
        match &self.state_file {
            Some(file) => Ok(expand_tilde(file)),
            None => Ok(Self::washmap_dir()?.join("state.json")),
        }
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        debug!(
            max_concurrent = config.scheduler.max_concurrent,
            max_retries = config.scheduler.max_retries,
            policy = %config.default_split_policy,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        Self::ensure_dirs()?;
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn ensure_dirs() -> Result<()> {
        let dir = Self::washmap_dir()?;
        if !dir.exists() {
            debug!(dir = %dir.display(), "creating washmap directory");
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
