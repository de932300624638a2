// App module - Wires the components together and runs them as tasks

use crate::backup::{BackupEngine, BackupSettings};
use crate::config::Config;
use crate::error::{KeeperError, Result};
use crate::health::{HealthServer, HealthState};
use crate::metrics::Metrics;
use crate::plugins::PluginUpdater;
use crate::process::{Runner, ServerSettings, ServerSupervisor};
use crate::shutdown::ShutdownCoordinator;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Why the keeper stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// A termination signal was received
    Signal(String),
    /// The shared token was cancelled from outside
    Cancelled,
    /// A task failed or panicked
    Fatal(String),
}

impl ExitReason {
    /// Process exit status for this reason
    pub fn exit_code(&self) -> u8 {
        match self {
            ExitReason::Signal(_) | ExitReason::Cancelled => 0,
            ExitReason::Fatal(_) => 1,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Signal(name) => write!(f, "received {}", name),
            ExitReason::Cancelled => write!(f, "cancelled"),
            ExitReason::Fatal(reason) => write!(f, "{}", reason),
        }
    }
}

/// Task name and, for the shutdown coordinator, the signal received
type TaskResult = (&'static str, Result<Option<String>>);

fn spawn_task<F>(tasks: &mut JoinSet<TaskResult>, name: &'static str, task: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tasks.spawn(async move { (name, task.await.map(|_| None)) });
}

/// Runs the supervisor, backup engine, plugin updater, health surface and
/// shutdown coordinator until the first of them decides it is time to stop
pub struct Keeper {
    config: Config,
    runner: Arc<dyn Runner>,
    metrics: Arc<Metrics>,
    token: CancellationToken,
}

impl Keeper {
    pub fn new(config: Config, runner: Arc<dyn Runner>, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            runner,
            metrics,
            token: CancellationToken::new(),
        }
    }

    /// Token shared by every task; cancelling it stops the keeper
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Run every task to completion
    ///
    /// Listener bind and signal registration happen before anything is
    /// spawned and their failures are returned as errors. Task failures are
    /// reported through the returned `ExitReason`.
    pub async fn run(self) -> Result<ExitReason> {
        let state = HealthState::new(self.metrics.clone(), self.config.server_addr.clone());
        let health = HealthServer::bind(self.config.metrics_port, state).await?;
        let shutdown = ShutdownCoordinator::listen(self.token.clone())?;

        let mut tasks: JoinSet<TaskResult> = JoinSet::new();

        let supervisor = ServerSupervisor::new(
            self.runner.clone(),
            self.metrics.clone(),
            ServerSettings::from(&self.config),
        );
        spawn_task(&mut tasks, "server supervisor", supervisor.run(self.token()));

        if self.config.disable_backup {
            info!("Backups disabled");
        } else {
            let engine = BackupEngine::new(
                self.runner.clone(),
                self.metrics.clone(),
                BackupSettings::from(&self.config),
            );
            spawn_task(&mut tasks, "backup engine", engine.run(self.token()));
        }

        match PluginUpdater::from_config(self.runner.clone(), self.metrics.clone(), &self.config) {
            Some(updater) => spawn_task(&mut tasks, "plugin updater", updater.run(self.token())),
            None => info!("Plugin updates disabled"),
        }

        spawn_task(&mut tasks, "health server", health.serve(self.token()));

        let token = self.token.clone();
        tasks.spawn(async move {
            let signal = tokio::select! {
                name = shutdown.wait() => Some(name),
                _ = token.cancelled() => None,
            };
            ("shutdown coordinator", Ok(signal))
        });

        let reason = self.join_all(tasks).await;
        info!("All tasks stopped");
        Ok(reason)
    }

    /// Await every task, cancelling the rest as soon as one ends
    async fn join_all(&self, mut tasks: JoinSet<TaskResult>) -> ExitReason {
        let mut reason = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((task, Ok(Some(signal)))) => {
                    info!("{} finished", task);
                    reason.get_or_insert(ExitReason::Signal(signal));
                }
                Ok((task, Ok(None))) => info!("{} finished", task),
                Ok((task, Err(e))) => {
                    error!("{} failed: {}", task, e);
                    reason.get_or_insert(ExitReason::Fatal(format!("{} failed: {}", task, e)));
                }
                Err(e) => {
                    let e = KeeperError::Internal(format!("task panicked: {}", e));
                    error!("{}", e);
                    reason.get_or_insert(ExitReason::Fatal(e.to_string()));
                }
            }
            self.token.cancel();
        }

        reason.unwrap_or(ExitReason::Cancelled)
    }
}
