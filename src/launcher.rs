/// Subordinate process lifecycle: spawn with stdout and stderr merged into
/// one pipe, then poll, signal and wait on the resulting handle.
use crate::config::CommandConfig;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::fd::OwnedFd;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};

/// Read end of the pipe shared by the subordinate's stdout and stderr.
pub type MergedOutput = pipe::Receiver;

/// Handle to the running subordinate.
///
/// The subordinate leads its own process group, so signals sent through the
/// handle also reach any helpers it forked.
#[derive(Debug)]
pub struct Subordinate {
    child: Child,
    pid: u32,
    output: Option<MergedOutput>,
    exit_status: Option<ExitStatus>,
}

/// Errors that can occur while starting the subordinate.
#[derive(Debug)]
pub enum LaunchError {
    /// No program was configured.
    EmptyCommand,
    /// Failed to create the output pipe.
    Pipe { source: std::io::Error },
    /// Failed to spawn the subordinate (missing executable, permission denied).
    Spawn {
        program: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::EmptyCommand => write!(f, "no command configured"),
            LaunchError::Pipe { source } => {
                write!(f, "failed to create output pipe: {}", source)
            }
            LaunchError::Spawn { program, source } => {
                write!(f, "failed to spawn {}: {}", program, source)
            }
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::EmptyCommand => None,
            LaunchError::Pipe { source } => Some(source),
            LaunchError::Spawn { source, .. } => Some(source),
        }
    }
}

/// Spawn the subordinate described by `command`.
///
/// Must be called from within a tokio runtime: the read end of the output
/// pipe is registered with the reactor.
pub fn launch(command: &CommandConfig) -> Result<Subordinate, LaunchError> {
    if command.program.trim().is_empty() {
        return Err(LaunchError::EmptyCommand);
    }

    let (reader, writer) = std::io::pipe().map_err(|e| LaunchError::Pipe { source: e })?;
    // stderr needs its own handle to the same pipe
    let writer_stderr = writer
        .try_clone()
        .map_err(|e| LaunchError::Pipe { source: e })?;

    tracing::info!(
        program = %command.program,
        args = ?command.args,
        "spawning subordinate"
    );

    // Register the read end before spawning so nothing fallible is left
    // between spawn and handing the child to its handle.
    let output = pipe::Receiver::from_owned_fd(OwnedFd::from(reader))
        .map_err(|e| LaunchError::Pipe { source: e })?;

    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .envs(&command.env)
        .stdin(Stdio::null())
        .stdout(Stdio::from(writer))
        .stderr(Stdio::from(writer_stderr))
        .process_group(0); // New process group for clean kill
    if command.unbuffered {
        cmd.env("PYTHONUNBUFFERED", "1");
    }

    let mut child = cmd.spawn().map_err(|e| LaunchError::Spawn {
        program: command.program.clone(),
        source: e,
    })?;
    // The parent's copies of the write end must close, or EOF never arrives.
    drop(cmd);

    let Some(pid) = child.id() else {
        kill_unsupervised(&mut child);
        return Err(LaunchError::Spawn {
            program: command.program.clone(),
            source: std::io::Error::other("subordinate exited before its pid was read"),
        });
    };
    tracing::info!(pid, "subordinate started");

    Ok(Subordinate {
        child,
        pid,
        output: Some(output),
        exit_status: None,
    })
}

/// Kill a child that will never be wrapped in a [`Subordinate`].
fn kill_unsupervised(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "failed to kill unsupervised child");
    }
}

impl Subordinate {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Take the merged output stream. Returns `None` after the first call.
    pub fn take_output(&mut self) -> Option<MergedOutput> {
        self.output.take()
    }

    /// Exit status once it has been observed, without polling the OS.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Poll liveness. `Ok(None)` means still running.
    pub fn try_exit_status(&mut self) -> std::io::Result<Option<ExitStatus>> {
        if self.exit_status.is_some() {
            return Ok(self.exit_status);
        }
        let status = self.child.try_wait()?;
        if status.is_some() {
            self.exit_status = status;
        }
        Ok(status)
    }

    /// Ask the subordinate's process group to stop (SIGTERM).
    pub fn request_stop(&self) -> nix::Result<()> {
        self.signal_group(Signal::SIGTERM)
    }

    /// Kill the subordinate's process group unconditionally (SIGKILL).
    pub fn force_kill(&mut self) -> nix::Result<()> {
        self.signal_group(Signal::SIGKILL)?;
        if self.exit_status.is_none() {
            // The leader may have moved to another group; signal it directly too.
            if let Err(e) = self.child.start_kill() {
                tracing::debug!(error = %e, "direct kill of subordinate failed");
            }
        }
        Ok(())
    }

    /// Wait up to `timeout` for the subordinate to exit.
    ///
    /// Returns `Ok(None)` if it is still running when the timeout elapses.
    pub async fn wait_timeout(
        &mut self,
        timeout: Duration,
    ) -> std::io::Result<Option<ExitStatus>> {
        if self.exit_status.is_some() {
            return Ok(self.exit_status);
        }
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(result) => {
                let status = result?;
                self.exit_status = Some(status);
                Ok(Some(status))
            }
            Err(_) => Ok(None),
        }
    }

    fn signal_group(&self, signal: Signal) -> nix::Result<()> {
        // Once reaped, the pid may belong to someone else.
        if self.exit_status.is_some() {
            return Ok(());
        }
        let pgid = Pid::from_raw(self.pid as i32);
        match killpg(pgid, signal) {
            Ok(()) => {
                tracing::debug!(pid = self.pid, ?signal, "signalled subordinate process group");
                Ok(())
            }
            // Group already gone; the leader is a zombie awaiting reaping.
            Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
