/// Host shutdown: the one irreversible side effect, gated so it fires at most
/// once per supervisor run.
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Capability to power off the host.
pub trait HostShutdown: Send + Sync {
    /// Human-readable description for logs (e.g., the command line).
    fn describe(&self) -> String;

    fn shutdown_host(&self) -> Result<(), ShutdownError>;
}

/// Errors from invoking the host shutdown.
#[derive(Debug)]
pub enum ShutdownError {
    EmptyCommand,
    Spawn {
        command: String,
        source: std::io::Error,
    },
    Failed {
        command: String,
        status: std::process::ExitStatus,
    },
    /// The blocking shutdown call panicked or was cancelled.
    Join { source: tokio::task::JoinError },
}

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownError::EmptyCommand => write!(f, "shutdown command is empty"),
            ShutdownError::Spawn { command, source } => {
                write!(f, "failed to run shutdown command ({}): {}", command, source)
            }
            ShutdownError::Failed { command, status } => {
                write!(f, "shutdown command ({}) failed: {}", command, status)
            }
            ShutdownError::Join { source } => {
                write!(f, "host shutdown task did not complete: {}", source)
            }
        }
    }
}

impl std::error::Error for ShutdownError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShutdownError::Spawn { source, .. } => Some(source),
            ShutdownError::Join { source } => Some(source),
            _ => None,
        }
    }
}

/// Powers off by running an external command, `sudo -n shutdown -h now` by default.
///
/// stdin is closed so a command that wants to prompt (e.g. sudo asking for a
/// password) fails instead of hanging the supervisor.
pub struct CommandShutdown {
    argv: Vec<String>,
}

impl CommandShutdown {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

impl HostShutdown for CommandShutdown {
    fn describe(&self) -> String {
        self.argv.join(" ")
    }

    fn shutdown_host(&self) -> Result<(), ShutdownError> {
        let Some((program, args)) = self.argv.split_first() else {
            return Err(ShutdownError::EmptyCommand);
        };
        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .status()
            .map_err(|e| ShutdownError::Spawn {
                command: self.describe(),
                source: e,
            })?;
        if !status.success() {
            return Err(ShutdownError::Failed {
                command: self.describe(),
                status,
            });
        }
        Ok(())
    }
}

/// Stand-in used with `--no-shutdown`: logs instead of powering off.
pub struct LogOnlyShutdown;

impl HostShutdown for LogOnlyShutdown {
    fn describe(&self) -> String {
        "log only".to_string()
    }

    fn shutdown_host(&self) -> Result<(), ShutdownError> {
        tracing::warn!("host shutdown disabled, leaving the machine running");
        Ok(())
    }
}

/// At-most-once wrapper around a [`HostShutdown`].
pub struct ShutdownTrigger {
    host: Arc<dyn HostShutdown>,
    fired: AtomicBool,
}

impl ShutdownTrigger {
    pub fn new(host: Box<dyn HostShutdown>) -> Self {
        Self {
            host: Arc::from(host),
            fired: AtomicBool::new(false),
        }
    }

    /// Power off the host. Returns `Ok(false)` if it was already triggered.
    ///
    /// A failed attempt still counts: the command is not re-run. The host
    /// call runs on the blocking pool, off the async workers.
    pub async fn fire(&self) -> Result<bool, ShutdownError> {
        if self.fired.swap(true, Ordering::SeqCst) {
            tracing::debug!("host shutdown already triggered");
            return Ok(false);
        }
        tracing::warn!(via = %self.host.describe(), "initiating host shutdown");
        let host = Arc::clone(&self.host);
        tokio::task::spawn_blocking(move || host.shutdown_host())
            .await
            .map_err(|e| ShutdownError::Join { source: e })??;
        Ok(true)
    }
}

/// Counts invocations instead of powering anything off.
#[cfg(test)]
pub(crate) struct CountingShutdown(pub std::sync::Arc<std::sync::atomic::AtomicUsize>);

#[cfg(test)]
impl HostShutdown for CountingShutdown {
    fn describe(&self) -> String {
        "counting".to_string()
    }

    fn shutdown_host(&self) -> Result<(), ShutdownError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
