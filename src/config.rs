use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::cleanup::CleanupTracker;
use crate::error::ConfigError;

pub const MEMORY_LIMIT_MB_ENV: &str = "PYSANDBOX_MEMORY_LIMIT_MB";
pub const CPU_TIME_LIMIT_SECS_ENV: &str = "PYSANDBOX_CPU_TIME_LIMIT_SECS";
pub const WALL_TIME_LIMIT_SECS_ENV: &str = "PYSANDBOX_WALL_TIME_LIMIT_SECS";
pub const IDLE_TIMEOUT_MIN_ENV: &str = "PYSANDBOX_IDLE_TIMEOUT_MIN";
pub const DEBUG_ENV: &str = "PYSANDBOX_DEBUG";
pub const AUTO_CLEANUP_ENV: &str = "PYSANDBOX_AUTO_CLEANUP";
pub const WORK_DIR_ROOT_ENV: &str = "PYSANDBOX_WORK_DIR_ROOT";
pub const ISOLATED_ENV_ENV: &str = "PYSANDBOX_ISOLATED_ENV";
pub const PYTHON_ENV: &str = "PYSANDBOX_PYTHON";

const DEFAULT_MEMORY_LIMIT_MB: u64 = 512;
const DEFAULT_CPU_TIME_LIMIT_SECS: u64 = 30;
const DEFAULT_WALL_TIME_LIMIT_SECS: u64 = 1800;
const DEFAULT_IDLE_TIMEOUT_MIN: u64 = 5;
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Settings fixed when a session is created.
///
/// `idle_timeout` and `wall_time_limit_secs` are unrelated: the first decides
/// when an unused session is evicted, the second bounds a single command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub memory_limit_mb: u64,
    pub cpu_time_limit_secs: u64,
    pub wall_time_limit_secs: u64,
    /// Zero makes the session single-use.
    pub idle_timeout: Duration,
    pub debug: bool,
    pub auto_cleanup: bool,
    pub work_dir_root: PathBuf,
    /// Provision a private virtual environment for the worker.
    pub isolated_env: bool,
    pub python: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            cpu_time_limit_secs: DEFAULT_CPU_TIME_LIMIT_SECS,
            wall_time_limit_secs: DEFAULT_WALL_TIME_LIMIT_SECS,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_MIN * 60),
            debug: false,
            auto_cleanup: true,
            work_dir_root: std::env::temp_dir(),
            isolated_env: true,
            python: None,
        }
    }
}

impl SessionConfig {
    pub fn single_use() -> Self {
        Self {
            idle_timeout: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn with_idle_timeout_minutes(mut self, minutes: u64) -> Self {
        self.idle_timeout = Duration::from_secs(minutes.saturating_mul(60));
        self
    }

    pub fn is_single_use(&self) -> bool {
        self.idle_timeout.is_zero()
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb.saturating_mul(1024 * 1024)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_limit_mb == 0 {
            return Err(ConfigError::Zero("memory_limit_mb"));
        }
        if self.cpu_time_limit_secs == 0 {
            return Err(ConfigError::Zero("cpu_time_limit_secs"));
        }
        if self.wall_time_limit_secs == 0 {
            return Err(ConfigError::Zero("wall_time_limit_secs"));
        }
        Ok(())
    }

    /// Defaults overlaid with any `PYSANDBOX_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(value) = get(MEMORY_LIMIT_MB_ENV) {
            config.memory_limit_mb = parse_u64(MEMORY_LIMIT_MB_ENV, &value)?;
        }
        if let Some(value) = get(CPU_TIME_LIMIT_SECS_ENV) {
            config.cpu_time_limit_secs = parse_u64(CPU_TIME_LIMIT_SECS_ENV, &value)?;
        }
        if let Some(value) = get(WALL_TIME_LIMIT_SECS_ENV) {
            config.wall_time_limit_secs = parse_u64(WALL_TIME_LIMIT_SECS_ENV, &value)?;
        }
        if let Some(value) = get(IDLE_TIMEOUT_MIN_ENV) {
            config = config.with_idle_timeout_minutes(parse_u64(IDLE_TIMEOUT_MIN_ENV, &value)?);
        }
        if let Some(value) = get(DEBUG_ENV) {
            config.debug = parse_bool(DEBUG_ENV, &value)?;
        }
        if let Some(value) = get(AUTO_CLEANUP_ENV) {
            config.auto_cleanup = parse_bool(AUTO_CLEANUP_ENV, &value)?;
        }
        if let Some(value) = get(WORK_DIR_ROOT_ENV) {
            config.work_dir_root = PathBuf::from(value);
        }
        if let Some(value) = get(ISOLATED_ENV_ENV) {
            config.isolated_env = parse_bool(ISOLATED_ENV_ENV, &value)?;
        }
        if let Some(value) = get(PYTHON_ENV) {
            config.python = Some(PathBuf::from(value));
        }

        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub sweep_interval: Duration,
    /// Defaults to the process-wide tracker.
    pub tracker: Option<Arc<CleanupTracker>>,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            tracker: None,
        }
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|err| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: err.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
