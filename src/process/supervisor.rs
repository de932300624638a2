use crate::config::Config;
use crate::error::{KeeperError, Result};
use crate::metrics::Metrics;
use crate::process::{CommandSpec, Runner};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Delay between the exit of the server and the next start attempt
pub const DEFAULT_RESTART_COOLDOWN: Duration = Duration::from_secs(30);

/// Lifecycle of the managed server as seen by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Running,
    CoolingDown,
    Stopped,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorState::Starting => write!(f, "starting"),
            SupervisorState::Running => write!(f, "running"),
            SupervisorState::CoolingDown => write!(f, "cooling down"),
            SupervisorState::Stopped => write!(f, "stopped"),
        }
    }
}

/// What the supervisor launches and how long it waits between runs
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Script that starts the server
    pub start_script: PathBuf,
    /// Server artifact passed to the start script
    pub server_jar: PathBuf,
    /// Working directory of the server
    pub work_dir: PathBuf,
    /// Fixed delay before each restart
    pub cooldown: Duration,
}

impl From<&Config> for ServerSettings {
    fn from(config: &Config) -> Self {
        Self {
            start_script: config.start_script.clone(),
            server_jar: config.server_jar.clone(),
            work_dir: config.work_dir.clone(),
            cooldown: config.restart_cooldown,
        }
    }
}

/// Keeps the managed server running until shutdown
///
/// Every exit, clean or not, is followed by the same fixed cooldown and a
/// new start attempt. There is no restart ceiling. Cancellation is observed
/// before each attempt and during the cooldown; a run in progress is
/// stopped by forwarding the token to the child.
pub struct ServerSupervisor {
    runner: Arc<dyn Runner>,
    metrics: Arc<Metrics>,
    settings: ServerSettings,
    state: watch::Sender<SupervisorState>,
}

impl ServerSupervisor {
    pub fn new(runner: Arc<dyn Runner>, metrics: Arc<Metrics>, settings: ServerSettings) -> Self {
        let (state, _) = watch::channel(SupervisorState::Starting);
        Self {
            runner,
            metrics,
            settings,
            state,
        }
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Command used for one server run
    pub fn command(&self, token: &CancellationToken) -> CommandSpec {
        CommandSpec::new("run world server", self.settings.start_script.as_os_str())
            .arg(self.settings.server_jar.as_os_str())
            .current_dir(&self.settings.work_dir)
            .cancel_on(token.clone())
    }

    fn set_state(&self, state: SupervisorState) {
        debug!("Server supervisor: {}", state);
        self.state.send_replace(state);
    }

    /// Run the restart loop until `token` is cancelled
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        info!(
            "Starting server supervisor (cooldown: {:?})",
            self.settings.cooldown
        );

        while !token.is_cancelled() {
            self.set_state(SupervisorState::Running);
            self.metrics.record_server_start();

            match self.runner.run(&self.command(&token)).await {
                Ok(_) => info!("Server exited"),
                Err(KeeperError::Cancelled(_)) => break,
                Err(e) => {
                    self.metrics.record_server_error();
                    error!("Server run failed: {}", e);
                }
            }

            self.set_state(SupervisorState::CoolingDown);
            info!("Restarting server in {:?}", self.settings.cooldown);

            tokio::select! {
                _ = token.cancelled() => break,
                _ = sleep(self.settings.cooldown) => {}
            }
        }

        self.set_state(SupervisorState::Stopped);
        info!("Server supervisor stopped");
        Ok(())
    }
}
