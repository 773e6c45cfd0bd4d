mod activity;
mod config;
mod drain;
mod launcher;
mod shutdown;
mod signals;
mod terminate;
mod watchdog;

use clap::Parser;
use config::SupervisorConfig;
use shutdown::{CommandShutdown, HostShutdown, LogOnlyShutdown, ShutdownTrigger};
use signals::SignalHandler;
use std::path::PathBuf;
use std::process::ExitCode;
use watchdog::{Outcome, Supervisor, WatchdogSettings};

/// Exit code after an operator interrupt (128 + SIGINT).
const EXIT_CANCELLED: u8 = 130;

/// Supervise a long-running process and power off the host once it has been
/// silent for too long, or once it exits on its own.
#[derive(Parser, Debug)]
#[command(name = "idle-halt", version, about)]
pub struct Cli {
    /// Command to supervise (overrides config)
    #[arg(value_name = "COMMAND", trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,

    /// Config file path
    #[arg(short, long, default_value = "idle-halt.toml")]
    config: PathBuf,

    /// Idle timeout in seconds (overrides config)
    #[arg(long)]
    timeout: Option<u64>,

    /// Seconds between watchdog checks (overrides config)
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Seconds to wait after SIGTERM before SIGKILL (overrides config)
    #[arg(long)]
    grace_period: Option<u64>,

    /// Log instead of powering off the host
    #[arg(long)]
    no_shutdown: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (watchdog checks, signal delivery)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

impl Cli {
    /// Apply command-line overrides on top of the loaded config.
    fn apply_overrides(&self, config: &mut SupervisorConfig) {
        if let Some((program, args)) = self.command.split_first() {
            config.command.program = program.clone();
            config.command.args = args.to_vec();
        }
        if let Some(secs) = self.timeout {
            config.watchdog.idle_timeout_secs = secs;
        }
        if let Some(secs) = self.poll_interval {
            config.watchdog.poll_interval_secs = secs;
        }
        if let Some(secs) = self.grace_period {
            config.watchdog.grace_period_secs = secs;
        }
        if self.no_shutdown {
            config.shutdown.enabled = false;
        }
    }

    fn default_log_filter(&self) -> &'static str {
        if self.verbose {
            "idle_halt=debug"
        } else if self.quiet {
            "idle_halt=warn"
        } else {
            "idle_halt=info"
        }
    }
}

fn print_resolved(config: &SupervisorConfig) {
    let command = &config.command;
    println!("command:        {} {}", command.program, command.args.join(" "));
    for (key, value) in &command.env {
        println!("env:            {key}={value}");
    }
    println!("unbuffered:     {}", command.unbuffered);
    println!("idle timeout:   {}s", config.watchdog.idle_timeout_secs);
    println!("poll interval:  {}s", config.watchdog.poll_interval_secs);
    println!("grace period:   {}s", config.watchdog.grace_period_secs);
    if config.shutdown.enabled {
        println!("host shutdown:  {}", config.shutdown.command.join(" "));
    } else {
        println!("host shutdown:  disabled");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the subordinate's output untouched.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.default_log_filter())),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match config::load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "cannot load config");
            return ExitCode::FAILURE;
        }
    };
    cli.apply_overrides(&mut config);
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "cannot start");
        return ExitCode::FAILURE;
    }

    if cli.dry_run {
        print_resolved(&config);
        return ExitCode::SUCCESS;
    }

    let mut signals = match SignalHandler::install() {
        Ok(handler) => handler,
        Err(e) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            return ExitCode::FAILURE;
        }
    };

    let host: Box<dyn HostShutdown> = if config.shutdown.enabled {
        Box::new(CommandShutdown::new(config.shutdown.command.clone()))
    } else {
        Box::new(LogOnlyShutdown)
    };
    let settings = WatchdogSettings::from(&config.watchdog);
    let supervisor = Supervisor::new(config.command, settings, ShutdownTrigger::new(host));

    let cancel = async move {
        let interrupt = signals.recv().await;
        tracing::info!(?interrupt, "received interrupt");
    };

    match supervisor.run(tokio::io::stdout(), cancel).await {
        Ok(Outcome::TimedOut { idle, status }) => {
            tracing::info!(idle_secs = idle.as_secs(), %status, "subordinate terminated after idle timeout");
            ExitCode::SUCCESS
        }
        Ok(Outcome::SelfExited { status }) => {
            tracing::info!(%status, "subordinate exited on its own");
            ExitCode::SUCCESS
        }
        Ok(Outcome::Cancelled) => {
            tracing::info!("stopped by operator, host left running");
            ExitCode::from(EXIT_CANCELLED)
        }
        Err(e) => {
            tracing::error!(error = %e, "supervisor failed");
            ExitCode::FAILURE
        }
    }
}
