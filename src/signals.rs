/// Signal handling for operator aborts.
///
/// SIGINT (Ctrl-C) and SIGTERM both cancel monitoring. Cancellation never
/// powers off the host.
use tokio::signal::unix::{signal, Signal, SignalKind};

/// Which signal interrupted monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Sigint,
    Sigterm,
}

pub struct SignalHandler {
    sigint: Signal,
    sigterm: Signal,
}

impl SignalHandler {
    /// Install the handlers. Must be called from within a tokio runtime.
    pub fn install() -> std::io::Result<SignalHandler> {
        Ok(SignalHandler {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next SIGINT or SIGTERM.
    pub async fn recv(&mut self) -> Interrupt {
        tokio::select! {
            _ = self.sigint.recv() => Interrupt::Sigint,
            _ = self.sigterm.recv() => Interrupt::Sigterm,
        }
    }
}
