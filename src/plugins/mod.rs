// Plugins module - Keeps the plugin checkout in sync with its upstream branch

use crate::config::Config;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::process::{CommandSpec, Runner};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_PLUGIN_DIR: &str = "plugins";
const PLUGIN_REMOTE: &str = "origin";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginSettings {
    /// Upstream branch to follow
    pub branch: String,
    #[serde(with = "crate::config::duration_text")]
    pub interval: Duration,
    /// Plugin checkout, relative to the working directory
    pub dir: PathBuf,
}

/// Result of one update check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginCheck {
    UpToDate { revision: String },
    Updated { from: String, to: String },
    Skipped { reason: String },
}

/// Pulls plugin updates whenever the local and upstream heads differ
pub struct PluginUpdater {
    runner: Arc<dyn Runner>,
    metrics: Arc<Metrics>,
    branch: String,
    interval: Duration,
    dir: PathBuf,
}

impl PluginUpdater {
    pub fn new(
        runner: Arc<dyn Runner>,
        metrics: Arc<Metrics>,
        work_dir: PathBuf,
        settings: PluginSettings,
    ) -> Self {
        Self {
            runner,
            metrics,
            branch: settings.branch,
            interval: settings.interval,
            dir: work_dir.join(settings.dir),
        }
    }

    /// Build an updater when plugin updates are configured
    pub fn from_config(
        runner: Arc<dyn Runner>,
        metrics: Arc<Metrics>,
        config: &Config,
    ) -> Option<Self> {
        config
            .plugins
            .clone()
            .map(|settings| Self::new(runner, metrics, config.work_dir.clone(), settings))
    }

    fn git(&self, name: &str) -> CommandSpec {
        CommandSpec::new(name, "git").current_dir(&self.dir)
    }

    async fn revision(&self, name: &str, rev: &str) -> Result<String> {
        let output = self
            .runner
            .run(&self.git(name).args(["rev-parse", rev]).capture_stdout())
            .await?;
        Ok(output.stdout.trim().to_string())
    }

    fn skip(&self, reason: String) -> PluginCheck {
        self.metrics.record_plugin_error();
        warn!("Skipping plugin update check: {}", reason);
        PluginCheck::Skipped { reason }
    }

    /// Compare local and upstream heads once, pulling when they differ
    pub async fn check_once(&self) -> PluginCheck {
        let fetch = self
            .git("fetch plugins")
            .args(["fetch", PLUGIN_REMOTE, self.branch.as_str()]);
        if let Err(e) = self.runner.run(&fetch).await {
            return self.skip(format!("failed to fetch upstream: {}", e));
        }

        let local = match self.revision("local plugin revision", "@").await {
            Ok(rev) => rev,
            Err(e) => return self.skip(format!("failed to get local commit ID: {}", e)),
        };
        debug!("Local plugin commit ID {}", local);

        let upstream_ref = format!("{}/{}", PLUGIN_REMOTE, self.branch);
        let upstream = match self.revision("upstream plugin revision", &upstream_ref).await {
            Ok(rev) => rev,
            Err(e) => return self.skip(format!("failed to get upstream commit ID: {}", e)),
        };
        debug!("Upstream plugin commit ID {}", upstream);

        if local == upstream {
            return PluginCheck::UpToDate { revision: local };
        }

        info!("Updating plugins from {} to {}", local, upstream);
        let pull = self
            .git("update plugins")
            .args(["pull", PLUGIN_REMOTE, self.branch.as_str()]);
        if let Err(e) = self.runner.run(&pull).await {
            return self.skip(format!("failed to pull latest plugins: {}", e));
        }

        self.metrics.record_plugin_update();
        PluginCheck::Updated {
            from: local,
            to: upstream,
        }
    }

    /// Check for updates on every tick until `token` is cancelled
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        info!(
            "Starting plugin updater (branch: {}, interval: {:?})",
            self.branch, self.interval
        );

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_once().await;
                }
            }
        }

        info!("Plugin updater stopped");
        Ok(())
    }
}
