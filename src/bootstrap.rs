// Bootstrap module - One-shot preparation of the world data checkout

use crate::config::Config;
use crate::error::{KeeperError, Result};
use crate::process::{CommandSpec, Runner};
use std::path::{Path, PathBuf};
use tracing::info;

const ORIGIN: &str = "origin";

/// Prepares SSH access and the working directory before anything is supervised
pub struct Bootstrap<'a> {
    runner: &'a dyn Runner,
    repo: &'a str,
    ssh_script: &'a Path,
    work_dir: &'a Path,
}

impl<'a> Bootstrap<'a> {
    pub fn new(runner: &'a dyn Runner, config: &'a Config) -> Self {
        Self {
            runner,
            repo: &config.world_data_repo,
            ssh_script: &config.ssh_script,
            work_dir: &config.work_dir,
        }
    }

    /// Run every bootstrap step; any failure is fatal
    ///
    /// Returns the absolute working directory. A relative `WORK_DIR` stops
    /// resolving once the process has moved into it, so later commands must
    /// use the returned path.
    pub async fn run(&self) -> Result<PathBuf> {
        self.start_ssh_agent().await?;
        self.ensure_checkout().await?;
        let work_dir = enter_work_dir(self.work_dir)?;
        self.set_remote(&work_dir).await?;
        info!("Bootstrap complete in {}", work_dir.display());
        Ok(work_dir)
    }

    /// Everything except changing the process working directory
    pub async fn prepare(&self) -> Result<()> {
        self.start_ssh_agent().await?;
        self.ensure_checkout().await?;
        self.set_remote(self.work_dir).await
    }

    async fn start_ssh_agent(&self) -> Result<()> {
        let command = CommandSpec::new("start ssh agent", self.ssh_script.as_os_str());
        self.runner
            .run(&command)
            .await
            .map_err(|e| KeeperError::Bootstrap(format!("failed to start ssh agent: {}", e)))?;
        Ok(())
    }

    /// Clone the data repository unless the working directory already holds it
    async fn ensure_checkout(&self) -> Result<()> {
        if self.work_dir.join(".git").exists() {
            info!("Using existing checkout at {}", self.work_dir.display());
            return Ok(());
        }

        info!("Cloning {} into {}", self.repo, self.work_dir.display());
        let command = CommandSpec::new("clone world data", "git")
            .args(["clone", "--recurse-submodules", self.repo])
            .arg(self.work_dir.as_os_str());
        self.runner
            .run(&command)
            .await
            .map_err(|e| KeeperError::Bootstrap(format!("failed to clone world data: {}", e)))?;
        Ok(())
    }

    async fn set_remote(&self, work_dir: &Path) -> Result<()> {
        let command = CommandSpec::new("set remote url", "git")
            .args(["remote", "set-url", ORIGIN, self.repo])
            .current_dir(work_dir);
        self.runner
            .run(&command)
            .await
            .map_err(|e| KeeperError::Bootstrap(format!("failed to set remote url: {}", e)))?;
        Ok(())
    }
}

/// Make `dir` the process working directory, returning its absolute path
pub fn enter_work_dir(dir: &Path) -> Result<PathBuf> {
    std::env::set_current_dir(dir).map_err(|e| {
        KeeperError::Bootstrap(format!("failed to enter {}: {}", dir.display(), e))
    })?;
    Ok(std::env::current_dir()?)
}
