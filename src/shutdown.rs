use std::future::Future;

#[cfg(not(unix))]
use log::error;
use log::info;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::error::Result;

/// Process termination request that reached the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Interrupt,
    Terminate,
}

/// One-shot latch fired by the first SIGINT or SIGTERM. Clones observe the
/// same latch; only the coordinator can fire it.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    pub fn is_fired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes immediately when the signal has already fired.
    pub async fn fired(&self) {
        self.token.cancelled().await
    }

    pub fn fired_owned(self) -> WaitForCancellationFutureOwned {
        self.token.cancelled_owned()
    }
}

/// Installs the SIGINT/SIGTERM listener. Must run on a tokio runtime and
/// before anything else blocks, so no early signal is lost.
pub fn arm() -> Result<ShutdownSignal> {
    Ok(arm_with(os_interrupt()?))
}

/// Fires the signal when `interrupt` completes, then the listener exits.
pub fn arm_with<F>(interrupt: F) -> ShutdownSignal
where
    F: Future<Output = Option<Interrupt>> + Send + 'static,
{
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        if let Some(sig) = interrupt.await {
            info!("Receive {:?} to exit", sig);
            trigger.cancel();
        }
    });

    ShutdownSignal { token }
}

// Handlers are registered when the streams are created, not on first poll.
#[cfg(unix)]
fn os_interrupt() -> Result<impl Future<Output = Option<Interrupt>> + Send + 'static> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt()).map_err(crate::Error::Signal)?;
    let mut terminate = signal(SignalKind::terminate()).map_err(crate::Error::Signal)?;

    Ok(async move {
        tokio::select! {
            Some(()) = interrupt.recv() => Some(Interrupt::Interrupt),
            Some(()) = terminate.recv() => Some(Interrupt::Terminate),
            else => None,
        }
    })
}

#[cfg(not(unix))]
fn os_interrupt() -> Result<impl Future<Output = Option<Interrupt>> + Send + 'static> {
    Ok(async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => Some(Interrupt::Interrupt),
            Err(e) => {
                error!("failed to listen for ctrl-c: {}", e);
                None
            }
        }
    })
}
