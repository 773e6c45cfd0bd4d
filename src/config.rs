use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from idle-halt.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct SupervisorConfig {
    pub command: CommandConfig,
    pub watchdog: WatchdogConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment variables, layered over the supervisor's own.
    pub env: BTreeMap<String, String>,
    /// Inject `PYTHONUNBUFFERED=1` so line output arrives as it is produced.
    pub unbuffered: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub idle_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub grace_period_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub enabled: bool,
    pub command: Vec<String>,
}

// --- Default implementations ---

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            program: "label-studio".to_string(),
            args: vec![
                "start".to_string(),
                "--port".to_string(),
                "9000".to_string(),
            ],
            env: BTreeMap::new(),
            unbuffered: true,
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 1200,
            poll_interval_secs: 5,
            grace_period_secs: 5,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: vec![
                "sudo".to_string(),
                // fail instead of prompting for a password
                "-n".to_string(),
                "shutdown".to_string(),
                "-h".to_string(),
                "now".to_string(),
            ],
        }
    }
}

impl WatchdogConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

impl SupervisorConfig {
    /// Reject settings the supervisor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.program.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "command.program must not be empty".to_string(),
            ));
        }
        if self.watchdog.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "watchdog.idle_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.watchdog.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "watchdog.poll_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.shutdown.enabled && self.shutdown.command.is_empty() {
            return Err(ConfigError::Invalid(
                "shutdown.command must not be empty while shutdown is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load config from `path`. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<SupervisorConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(SupervisorConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Errors from loading or validating the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}
