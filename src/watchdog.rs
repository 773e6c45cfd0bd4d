/// Idle watchdog: runs alongside the subordinate, polling the activity clock.
///
/// If no output arrives for `idle_timeout`, the subordinate is terminated and
/// the host is shut down. If the subordinate exits on its own first, the host
/// is shut down without the termination sequence. An operator interrupt ends
/// monitoring without touching the host.
use crate::activity::activity_clock;
use crate::config::{CommandConfig, WatchdogConfig};
use crate::drain::{drain, DrainEnd};
use crate::launcher::{launch, LaunchError, Subordinate};
use crate::shutdown::{ShutdownError, ShutdownTrigger};
use crate::terminate::{terminate, TerminationError};
use std::future::Future;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Watchdog decision states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Waiting,
    TimedOut,
    SelfExited,
    Done,
}

/// Supervisor lifecycle, logged at each transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    Stopping,
    Stopped,
}

/// Decide the next state from one observation.
///
/// The idle check comes first: a process that is both silent past the
/// deadline and exited is treated as timed out.
pub fn evaluate(idle: Duration, idle_timeout: Duration, exited: bool) -> WatchdogState {
    if idle > idle_timeout {
        WatchdogState::TimedOut
    } else if exited {
        WatchdogState::SelfExited
    } else {
        WatchdogState::Waiting
    }
}

/// Terminal decision of the watchdog loop.
#[derive(Debug)]
enum Decision {
    TimedOut { idle: Duration },
    SelfExited { status: ExitStatus },
}

/// Timing knobs for a supervisor run.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogSettings {
    pub idle_timeout: Duration,
    pub poll_interval: Duration,
    pub grace_period: Duration,
}

impl From<&WatchdogConfig> for WatchdogSettings {
    fn from(config: &WatchdogConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            poll_interval: config.poll_interval(),
            grace_period: config.grace_period(),
        }
    }
}

/// How a supervisor run ended.
#[derive(Debug)]
pub enum Outcome {
    /// Silent past the deadline; terminated, host shutdown triggered.
    TimedOut { idle: Duration, status: ExitStatus },
    /// Exited on its own; host shutdown triggered.
    SelfExited { status: ExitStatus },
    /// Operator interrupt; host left running.
    Cancelled,
}

/// Errors that end a supervisor run.
#[derive(Debug)]
pub enum SupervisorError {
    Launch(LaunchError),
    /// The OS could not report the subordinate's status.
    Poll { source: std::io::Error },
    Termination(TerminationError),
    Shutdown(ShutdownError),
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Launch(e) => write!(f, "launch failed: {e}"),
            SupervisorError::Poll { source } => {
                write!(f, "failed to poll subordinate status: {source}")
            }
            SupervisorError::Termination(e) => {
                write!(f, "termination failed, host shutdown skipped: {e}")
            }
            SupervisorError::Shutdown(e) => write!(f, "host shutdown failed: {e}"),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Launch(e) => Some(e),
            SupervisorError::Poll { source } => Some(source),
            SupervisorError::Termination(e) => Some(e),
            SupervisorError::Shutdown(e) => Some(e),
        }
    }
}

impl From<LaunchError> for SupervisorError {
    fn from(e: LaunchError) -> Self {
        SupervisorError::Launch(e)
    }
}

impl From<TerminationError> for SupervisorError {
    fn from(e: TerminationError) -> Self {
        SupervisorError::Termination(e)
    }
}

impl From<ShutdownError> for SupervisorError {
    fn from(e: ShutdownError) -> Self {
        SupervisorError::Shutdown(e)
    }
}

/// Launches one subordinate and watches it until a single decision is made.
pub struct Supervisor {
    command: CommandConfig,
    settings: WatchdogSettings,
    trigger: ShutdownTrigger,
}

impl Supervisor {
    pub fn new(command: CommandConfig, settings: WatchdogSettings, trigger: ShutdownTrigger) -> Self {
        Self {
            command,
            settings,
            trigger,
        }
    }

    /// Run the subordinate to completion.
    ///
    /// Subordinate output is copied to `sink`. When `cancel` resolves the run
    /// ends with `Outcome::Cancelled` and the host is left alone. An interrupt
    /// that arrives after the decision lets the termination sequence finish
    /// but still skips host shutdown.
    pub async fn run<W, C>(&self, sink: W, cancel: C) -> Result<Outcome, SupervisorError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
        C: Future<Output = ()>,
    {
        let mut sub = launch(&self.command)?;
        let pid = sub.pid();
        info!(
            pid,
            idle_timeout_secs = self.settings.idle_timeout.as_secs_f64(),
            "monitoring subordinate for silence"
        );

        let (recorder, clock) = activity_clock();
        let mut drain_task = sub
            .take_output()
            .map(|output| tokio::spawn(drain(output, sink, recorder)));
        let mut run_state = RunState::Running;
        debug!(?run_state, "supervisor state");

        tokio::pin!(cancel);
        let decision = loop {
            let status = sub
                .try_exit_status()
                .map_err(|e| SupervisorError::Poll { source: e })?;
            let idle = clock.idle();
            let state = evaluate(idle, self.settings.idle_timeout, status.is_some());
            debug!(?state, idle_secs = idle.as_secs(), "watchdog check");
            match (state, status) {
                (WatchdogState::TimedOut, _) => break Decision::TimedOut { idle },
                (WatchdogState::SelfExited, Some(status)) => {
                    break Decision::SelfExited { status }
                }
                _ => {}
            }

            let cancelled = tokio::select! {
                biased;
                _ = &mut cancel => true,
                end = wait_drain(&mut drain_task) => {
                    // Advisory only: the handle's exit status decides.
                    log_drain_end(pid, end);
                    false
                }
                _ = tokio::time::sleep(self.settings.poll_interval) => false,
            };
            if cancelled {
                self.abort(&mut sub, drain_task).await;
                return Ok(Outcome::Cancelled);
            }
        };

        run_state = RunState::Stopping;
        debug!(?run_state, ?decision, "supervisor state");

        let stopping = async {
            let outcome = match decision {
                Decision::TimedOut { idle } => {
                    warn!(
                        pid,
                        idle_secs = idle.as_secs(),
                        "no output within idle timeout, terminating subordinate"
                    );
                    let status = terminate(&mut sub, self.settings.grace_period).await?;
                    Outcome::TimedOut { idle, status }
                }
                Decision::SelfExited { status } => {
                    warn!(pid, %status, "subordinate stopped unexpectedly");
                    Outcome::SelfExited { status }
                }
            };
            self.flush_drain(pid, drain_task).await;
            Ok::<Outcome, SupervisorError>(outcome)
        };
        tokio::pin!(stopping);

        // Termination is never cut short, but an interrupt still vetoes shutdown.
        let mut interrupted = false;
        let outcome = loop {
            tokio::select! {
                result = &mut stopping => break result?,
                _ = &mut cancel, if !interrupted => {
                    warn!(pid, "interrupt received during termination, host shutdown will be skipped");
                    interrupted = true;
                }
            }
        };

        run_state = RunState::Stopped;
        debug!(?run_state, "supervisor state");

        if interrupted {
            warn!(pid, ?outcome, "monitoring interrupted, host shutdown aborted");
            return Ok(Outcome::Cancelled);
        }

        self.trigger.fire().await?;
        debug!(state = ?WatchdogState::Done, "watchdog finished");
        Ok(outcome)
    }

    /// Cancellation path: best-effort graceful stop, no host shutdown.
    async fn abort(&self, sub: &mut Subordinate, drain_task: Option<JoinHandle<DrainEnd>>) {
        let pid = sub.pid();
        warn!(pid, "monitoring interrupted, host shutdown aborted");

        match sub.try_exit_status() {
            Ok(Some(status)) => info!(pid, %status, "subordinate already exited"),
            Ok(None) => {
                if let Err(e) = sub.request_stop() {
                    warn!(pid, error = %e, "failed to request graceful stop");
                } else {
                    match sub.wait_timeout(self.settings.grace_period).await {
                        Ok(Some(status)) => info!(pid, %status, "subordinate stopped"),
                        Ok(None) => warn!(pid, "subordinate still running after graceful stop request"),
                        Err(e) => warn!(pid, error = %e, "failed to wait for subordinate"),
                    }
                }
            }
            Err(e) => warn!(pid, error = %e, "failed to poll subordinate status"),
        }

        if sub.exit_status().is_some() {
            self.flush_drain(pid, drain_task).await;
        } else if let Some(task) = drain_task {
            task.abort();
        }
    }

    /// Let the drain forward whatever output is still buffered in the pipe.
    ///
    /// Bounded by the grace period: a helper that inherited the pipe can keep
    /// it open after the subordinate itself is gone.
    async fn flush_drain(&self, pid: u32, drain_task: Option<JoinHandle<DrainEnd>>) {
        let Some(mut task) = drain_task else {
            return;
        };
        match tokio::time::timeout(self.settings.grace_period, &mut task).await {
            Ok(end) => log_drain_end(pid, end.ok()),
            Err(_) => {
                debug!(pid, "output still open after subordinate exit, abandoning drain");
                task.abort();
            }
        }
    }
}

/// Resolve when the drain task ends; pending forever once it has.
async fn wait_drain(task: &mut Option<JoinHandle<DrainEnd>>) -> Option<DrainEnd> {
    let Some(handle) = task.as_mut() else {
        return std::future::pending().await;
    };
    let result = handle.await;
    *task = None;
    result.ok()
}

fn log_drain_end(pid: u32, end: Option<DrainEnd>) {
    match end {
        Some(DrainEnd::Closed { lines }) => {
            info!(pid, lines, "subordinate closed its output")
        }
        Some(DrainEnd::Failed { lines, error }) => {
            warn!(pid, lines, error = %error, "subordinate output ended with a read error")
        }
        None => warn!(pid, "output drain task ended abnormally"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::CountingShutdown;
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    use std::os::unix::process::ExitStatusExt;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};
    use std::time::Instant;

    fn shell(script: &str) -> CommandConfig {
        CommandConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: Default::default(),
            unbuffered: true,
        }
    }

    fn supervisor(
        command: CommandConfig,
        idle_timeout: Duration,
        poll_interval: Duration,
        grace_period: Duration,
    ) -> (Supervisor, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let trigger = ShutdownTrigger::new(Box::new(CountingShutdown(Arc::clone(&count))));
        let settings = WatchdogSettings {
            idle_timeout,
            poll_interval,
            grace_period,
        };
        (Supervisor::new(command, settings, trigger), count)
    }

    fn never() -> impl Future<Output = ()> {
        std::future::pending()
    }

    /// In-memory output sink that stays readable after the run.
    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl SharedSink {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }

        /// The subordinate's pid, printed as its first line of output.
        fn first_line_pid(&self) -> Pid {
            let contents = self.contents();
            let first = contents.lines().next().unwrap();
            Pid::from_raw(first.trim().parse().unwrap())
        }
    }

    impl AsyncWrite for SharedSink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_evaluate_waits_while_active() {
        let timeout = Duration::from_secs(10);
        assert_eq!(
            evaluate(Duration::from_secs(3), timeout, false),
            WatchdogState::Waiting
        );
    }

    #[test]
    fn test_evaluate_deadline_is_strict() {
        let timeout = Duration::from_secs(10);
        assert_eq!(evaluate(timeout, timeout, false), WatchdogState::Waiting);
        assert_eq!(
            evaluate(timeout + Duration::from_millis(1), timeout, false),
            WatchdogState::TimedOut
        );
    }

    #[test]
    fn test_evaluate_self_exit() {
        assert_eq!(
            evaluate(Duration::from_secs(3), Duration::from_secs(1200), true),
            WatchdogState::SelfExited
        );
    }

    #[test]
    fn test_evaluate_timeout_takes_precedence_over_exit() {
        assert_eq!(
            evaluate(Duration::from_secs(11), Duration::from_secs(10), true),
            WatchdogState::TimedOut
        );
    }

    #[test]
    fn test_settings_from_config() {
        let settings = WatchdogSettings::from(&WatchdogConfig::default());
        assert_eq!(settings.idle_timeout, Duration::from_secs(1200));
        assert_eq!(settings.poll_interval, Duration::from_secs(5));
        assert_eq!(settings.grace_period, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_regular_output_never_times_out() {
        // Gaps of 100ms against a 400ms deadline, for well past the deadline.
        let (sup, count) = supervisor(
            shell("for i in 1 2 3 4 5 6 7 8 9 10; do echo tick; sleep 0.1; done"),
            Duration::from_millis(400),
            Duration::from_millis(50),
            Duration::from_secs(1),
        );

        let outcome = sup.run(tokio::io::sink(), never()).await.unwrap();

        match outcome {
            Outcome::SelfExited { status } => assert_eq!(status.code(), Some(0)),
            other => panic!("expected SelfExited, got {other:?}"),
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_silence_times_out_and_shuts_down_once() {
        // Scaled-down version of: one line at t=0, then nothing.
        let idle_timeout = Duration::from_millis(500);
        let poll = Duration::from_millis(100);
        let (sup, count) = supervisor(
            shell("echo started; sleep 30"),
            idle_timeout,
            poll,
            Duration::from_secs(1),
        );
        let start = Instant::now();

        let outcome = sup.run(tokio::io::sink(), never()).await.unwrap();

        let elapsed = start.elapsed();
        match outcome {
            Outcome::TimedOut { idle, status } => {
                assert!(idle > idle_timeout);
                assert!(idle <= idle_timeout + poll + Duration::from_millis(200));
                assert_eq!(status.signal(), Some(nix::libc::SIGTERM));
            }
            other => panic!("expected TimedOut, got {other:?}"),
        }
        assert!(elapsed < Duration::from_secs(3));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_force_kills_stubborn_subordinate() {
        let grace = Duration::from_millis(500);
        let (sup, count) = supervisor(
            shell("trap '' TERM; echo armed; while :; do sleep 0.1; done"),
            Duration::from_millis(400),
            Duration::from_millis(50),
            grace,
        );
        let start = Instant::now();

        let outcome = sup.run(tokio::io::sink(), never()).await.unwrap();

        match outcome {
            Outcome::TimedOut { status, .. } => {
                assert_eq!(status.signal(), Some(nix::libc::SIGKILL))
            }
            other => panic!("expected TimedOut, got {other:?}"),
        }
        assert!(start.elapsed() < Duration::from_secs(4));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_self_exit_detected_within_a_poll() {
        let poll = Duration::from_millis(200);
        let (sup, count) = supervisor(
            shell("echo working; sleep 0.3; echo done; exit 3"),
            Duration::from_secs(1200),
            poll,
            Duration::from_secs(1),
        );
        let start = Instant::now();

        let outcome = sup.run(tokio::io::sink(), never()).await.unwrap();

        match outcome {
            Outcome::SelfExited { status } => assert_eq!(status.code(), Some(3)),
            other => panic!("expected SelfExited, got {other:?}"),
        }
        assert!(start.elapsed() < Duration::from_millis(300) + poll + Duration::from_secs(1));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_silent_quick_exit_is_self_exit() {
        let (sup, count) = supervisor(
            shell("exit 0"),
            Duration::from_secs(1200),
            Duration::from_millis(100),
            Duration::from_secs(1),
        );

        let outcome = sup.run(tokio::io::sink(), never()).await.unwrap();

        assert!(matches!(outcome, Outcome::SelfExited { .. }));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_skips_shutdown_and_stops_subordinate() {
        // A grace period far longer than the run: only SIGTERM can end it early.
        let (sup, count) = supervisor(
            shell("echo $$; exec sleep 30"),
            Duration::from_secs(1200),
            Duration::from_millis(100),
            Duration::from_secs(10),
        );
        let sink = SharedSink::default();
        let start = Instant::now();

        let outcome = sup
            .run(
                sink.clone(),
                tokio::time::sleep(Duration::from_millis(300)),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, Outcome::Cancelled));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(start.elapsed() < Duration::from_millis(1500));
        assert_eq!(
            kill(sink.first_line_pid(), None::<Signal>),
            Err(Errno::ESRCH)
        );
    }

    #[tokio::test]
    async fn test_cancel_forwards_output_written_while_stopping() {
        let (sup, count) = supervisor(
            shell("trap 'echo stopping; exit 0' TERM; echo up; while :; do sleep 0.1; done"),
            Duration::from_secs(1200),
            Duration::from_millis(100),
            Duration::from_secs(5),
        );
        let sink = SharedSink::default();

        let outcome = sup
            .run(
                sink.clone(),
                tokio::time::sleep(Duration::from_millis(400)),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, Outcome::Cancelled));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(sink.contents(), "up\nstopping\n");
    }

    #[tokio::test]
    async fn test_interrupt_during_termination_skips_shutdown() {
        // Timeout fires at ~300ms; the interrupt lands inside the 1s grace period.
        let (sup, count) = supervisor(
            shell("trap '' TERM; echo $$; while :; do sleep 0.1; done"),
            Duration::from_millis(300),
            Duration::from_millis(50),
            Duration::from_secs(1),
        );
        let sink = SharedSink::default();

        let outcome = sup
            .run(
                sink.clone(),
                tokio::time::sleep(Duration::from_millis(700)),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, Outcome::Cancelled));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        // Termination still ran to completion.
        assert_eq!(
            kill(sink.first_line_pid(), None::<Signal>),
            Err(Errno::ESRCH)
        );
    }

    #[tokio::test]
    async fn test_launch_failure_never_reaches_watchdog() {
        let (sup, count) = supervisor(
            CommandConfig {
                program: "nonexistent-binary-xyz".to_string(),
                args: Vec::new(),
                env: Default::default(),
                unbuffered: true,
            },
            Duration::from_secs(1),
            Duration::from_millis(50),
            Duration::from_secs(1),
        );

        let err = sup.run(tokio::io::sink(), never()).await.unwrap_err();

        assert!(matches!(err, SupervisorError::Launch(LaunchError::Spawn { .. })));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_shutdown_is_reported() {
        use crate::shutdown::CommandShutdown;

        let trigger = ShutdownTrigger::new(Box::new(CommandShutdown::new(vec![
            "false".to_string(),
        ])));
        let sup = Supervisor::new(
            shell("exit 0"),
            WatchdogSettings {
                idle_timeout: Duration::from_secs(60),
                poll_interval: Duration::from_millis(50),
                grace_period: Duration::from_secs(1),
            },
            trigger,
        );

        let err = sup.run(tokio::io::sink(), never()).await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Shutdown(ShutdownError::Failed { .. })
        ));
    }
}
