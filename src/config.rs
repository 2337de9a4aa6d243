use crate::{ChurnError, Result, log_debug};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_INTERVAL_SECONDS: u64 = 30;
pub const DEFAULT_WORKERS: usize = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChurnConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub migration: MigrationTuning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Stop after this many completed cycles. Unbounded when absent.
    #[serde(default)]
    pub max_cycles: Option<u64>,
    /// Give up on a single migration after this many seconds. No limit when absent.
    #[serde(default)]
    pub migration_timeout_seconds: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            workers: default_workers(),
            max_cycles: None,
            migration_timeout_seconds: None,
        }
    }
}

fn default_interval_seconds() -> u64 {
    DEFAULT_INTERVAL_SECONDS
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tls,
    Ssh,
    Tcp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tls => "tls",
            Transport::Ssh => "ssh",
            Transport::Tcp => "tcp",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Transport::Tls => 16514,
            Transport::Ssh => 22,
            Transport::Tcp => 16509,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub server: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default = "default_true")]
    pub verify_tls: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            server: None,
            port: None,
            user: None,
            transport: Transport::default(),
            verify_tls: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Live migration knobs handed to the migration engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationTuning {
    #[serde(default = "default_true")]
    pub auto_converge: bool,
    #[serde(default)]
    pub compress: bool,
    #[serde(default = "default_parallel_connections")]
    pub parallel_connections: u32,
    #[serde(default)]
    pub bandwidth_limit_mbps: Option<u32>,
}

impl Default for MigrationTuning {
    fn default() -> Self {
        Self {
            auto_converge: true,
            compress: false,
            parallel_connections: default_parallel_connections(),
            bandwidth_limit_mbps: None,
        }
    }
}

fn default_parallel_connections() -> u32 {
    1
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub interval_seconds: Option<u64>,
    pub workers: Option<usize>,
    pub max_cycles: Option<u64>,
    pub migration_timeout_seconds: Option<u64>,
}

/// Validated scheduler settings for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    pub interval: Duration,
    pub workers: usize,
    pub max_cycles: Option<u64>,
    pub migration_timeout: Option<Duration>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECONDS),
            workers: DEFAULT_WORKERS,
            max_cycles: None,
            migration_timeout: None,
        }
    }
}

impl ChurnConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Self> {
        let config: ChurnConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// `$XDG_CONFIG_HOME/churn/config.toml` or the platform equivalent.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("churn").join("config.toml"))
    }

    /// Load an explicit config file, or the default one when it exists.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            if !path.is_file() {
                return Err(ChurnError::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            log_debug!("Loading configuration from {}", path.display());
            return Self::from_file(path);
        }

        match Self::default_path() {
            Some(path) if path.is_file() => {
                log_debug!("Loading configuration from {}", path.display());
                Self::from_file(path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn run_settings(&self, overrides: &RunOverrides) -> Result<RunSettings> {
        let workers = overrides.workers.unwrap_or(self.run.workers);
        if workers == 0 {
            return Err(ChurnError::Config(
                "worker count must be at least 1".to_string(),
            ));
        }

        let interval = overrides
            .interval_seconds
            .unwrap_or(self.run.interval_seconds);

        let max_cycles = overrides.max_cycles.or(self.run.max_cycles);
        if max_cycles == Some(0) {
            return Err(ChurnError::Config(
                "cycle limit must be at least 1".to_string(),
            ));
        }

        let migration_timeout = overrides
            .migration_timeout_seconds
            .or(self.run.migration_timeout_seconds)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Ok(RunSettings {
            interval: Duration::from_secs(interval),
            workers,
            max_cycles,
            migration_timeout,
        })
    }
}
