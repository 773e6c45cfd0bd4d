/// Termination sequencer: SIGTERM, wait out the grace period, then SIGKILL.
use crate::launcher::Subordinate;
use std::process::ExitStatus;
use std::time::Duration;
use tracing::{info, warn};

/// How long to wait for the kernel to reap a force-killed subordinate.
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that leave the subordinate's state unknown.
#[derive(Debug)]
pub enum TerminationError {
    /// Sending a signal to the process group failed.
    Signal { pid: u32, source: nix::Error },
    /// Waiting for the subordinate failed.
    Wait { pid: u32, source: std::io::Error },
    /// The subordinate survived SIGKILL for the whole confirmation window.
    StillAlive { pid: u32, waited: Duration },
}

impl std::fmt::Display for TerminationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationError::Signal { pid, source } => {
                write!(f, "failed to signal subordinate {}: {}", pid, source)
            }
            TerminationError::Wait { pid, source } => {
                write!(f, "failed to wait for subordinate {}: {}", pid, source)
            }
            TerminationError::StillAlive { pid, waited } => write!(
                f,
                "subordinate {} still alive {:.1}s after force-kill",
                pid,
                waited.as_secs_f64()
            ),
        }
    }
}

impl std::error::Error for TerminationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TerminationError::Signal { source, .. } => Some(source),
            TerminationError::Wait { source, .. } => Some(source),
            TerminationError::StillAlive { .. } => None,
        }
    }
}

/// Stop the subordinate, escalating to SIGKILL after `grace`.
///
/// On `Ok` the subordinate is confirmed dead and its status is returned.
pub async fn terminate(
    sub: &mut Subordinate,
    grace: Duration,
) -> Result<ExitStatus, TerminationError> {
    terminate_within(sub, grace, KILL_CONFIRM_TIMEOUT).await
}

async fn terminate_within(
    sub: &mut Subordinate,
    grace: Duration,
    kill_confirm: Duration,
) -> Result<ExitStatus, TerminationError> {
    let pid = sub.pid();

    let already = sub
        .try_exit_status()
        .map_err(|e| TerminationError::Wait { pid, source: e })?;
    if let Some(status) = already {
        info!(pid, %status, "subordinate already exited, nothing to terminate");
        return Ok(status);
    }

    info!(pid, grace_secs = grace.as_secs_f64(), "requesting graceful stop");
    sub.request_stop()
        .map_err(|e| TerminationError::Signal { pid, source: e })?;

    let stopped = sub
        .wait_timeout(grace)
        .await
        .map_err(|e| TerminationError::Wait { pid, source: e })?;
    if let Some(status) = stopped {
        info!(pid, %status, "subordinate stopped gracefully");
        return Ok(status);
    }

    warn!(pid, "subordinate ignored graceful stop, force-killing");
    sub.force_kill()
        .map_err(|e| TerminationError::Signal { pid, source: e })?;

    match sub
        .wait_timeout(kill_confirm)
        .await
        .map_err(|e| TerminationError::Wait { pid, source: e })?
    {
        Some(status) => {
            info!(pid, %status, "subordinate force-killed");
            Ok(status)
        }
        None => Err(TerminationError::StillAlive {
            pid,
            waited: kill_confirm,
        }),
    }
}
