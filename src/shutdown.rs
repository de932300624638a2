// Shutdown module - Turns the first termination signal into cancellation

use crate::error::{KeeperError, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};

/// Waits for SIGTERM or SIGINT and cancels the shared token once
///
/// Handlers are registered by `listen`, so signals delivered between
/// registration and `wait` are not lost. Signals after the first are
/// ignored; shutdown is already under way.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    #[cfg(unix)]
    terminate: Signal,
    #[cfg(unix)]
    interrupt: Signal,
}

impl ShutdownCoordinator {
    #[cfg(unix)]
    pub fn listen(token: CancellationToken) -> Result<Self> {
        let terminate = signal(SignalKind::terminate())
            .map_err(|e| KeeperError::SignalError(format!("SIGTERM handler: {}", e)))?;
        let interrupt = signal(SignalKind::interrupt())
            .map_err(|e| KeeperError::SignalError(format!("SIGINT handler: {}", e)))?;

        Ok(Self {
            token,
            terminate,
            interrupt,
        })
    }

    #[cfg(not(unix))]
    pub fn listen(token: CancellationToken) -> Result<Self> {
        Ok(Self { token })
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Wait for the first signal, cancel the token and return the signal name
    #[cfg(unix)]
    pub async fn wait(mut self) -> String {
        let name = tokio::select! {
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.interrupt.recv() => "SIGINT",
        };
        self.trigger(name)
    }

    #[cfg(not(unix))]
    pub async fn wait(self) -> String {
        let name = match tokio::signal::ctrl_c().await {
            Ok(()) => "CTRL-C",
            Err(_) => "signal listener failure",
        };
        self.trigger(name)
    }

    fn trigger(self, name: &str) -> String {
        info!("Received {}, shutting down", name);
        self.token.cancel();
        name.to_string()
    }
}
