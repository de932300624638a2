// Backup module - Periodic snapshot, commit and push of the world data

use crate::config::Config;
use crate::error::Result;
use crate::metrics::{BackupStep, Metrics};
use crate::process::{CommandSpec, Runner};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const DEFAULT_ARCHIVE_NAME: &str = "server.tar.gz";
pub const DEFAULT_BACKUP_BRANCH: &str = "main";
pub const BACKUP_REMOTE: &str = "origin";

/// How local changes are prepared for the commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupMode {
    /// Compress the working directory into one archive and stage only that
    #[default]
    Archive,
    /// Stage every change in the working directory as is
    InPlace,
}

impl FromStr for BackupMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "archive" => Ok(BackupMode::Archive),
            "in-place" | "inplace" | "stage" => Ok(BackupMode::InPlace),
            other => Err(format!(
                "unknown backup mode '{}', expected 'archive' or 'in-place'",
                other
            )),
        }
    }
}

impl std::fmt::Display for BackupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupMode::Archive => write!(f, "archive"),
            BackupMode::InPlace => write!(f, "in-place"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub work_dir: PathBuf,
    pub interval: Duration,
    pub mode: BackupMode,
    /// Archive file name, relative to the working directory
    pub archive_name: String,
    pub branch: String,
}

impl From<&Config> for BackupSettings {
    fn from(config: &Config) -> Self {
        Self {
            work_dir: config.work_dir.clone(),
            interval: config.backup_interval,
            mode: config.backup_mode,
            archive_name: config.backup_archive.clone(),
            branch: config.backup_branch.clone(),
        }
    }
}

/// Result of one pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    Completed { at: DateTime<Utc> },
    Failed { step: BackupStep, reason: String },
}

impl BackupOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, BackupOutcome::Completed { .. })
    }
}

/// Snapshots the working directory into git on a fixed schedule
pub struct BackupEngine {
    runner: Arc<dyn Runner>,
    metrics: Arc<Metrics>,
    settings: BackupSettings,
    clock: Clock,
}

/// Source of backup timestamps
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

impl BackupEngine {
    pub fn new(runner: Arc<dyn Runner>, metrics: Arc<Metrics>, settings: BackupSettings) -> Self {
        Self {
            runner,
            metrics,
            settings,
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the wall clock used for commit messages and backup times
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Commands of one pipeline run, in execution order
    pub fn pipeline(&self, now: DateTime<Utc>) -> Vec<(BackupStep, CommandSpec)> {
        let dir = &self.settings.work_dir;
        let mut steps = Vec::with_capacity(4);

        match self.settings.mode {
            BackupMode::Archive => {
                let archive = &self.settings.archive_name;
                steps.push((
                    BackupStep::Archive,
                    CommandSpec::new("archive world data", "tar")
                        .arg(format!("--exclude=./{}", archive))
                        .arg("--exclude=./.git")
                        .args(["-czf", archive.as_str(), "."])
                        .current_dir(dir),
                ));
                steps.push((
                    BackupStep::Stage,
                    CommandSpec::new("stage world data", "git")
                        .args(["add", archive.as_str()])
                        .current_dir(dir),
                ));
            }
            BackupMode::InPlace => {
                steps.push((
                    BackupStep::Stage,
                    CommandSpec::new("stage world data", "git")
                        .args(["add", "--all"])
                        .current_dir(dir),
                ));
            }
        }

        steps.push((
            BackupStep::Commit,
            CommandSpec::new("commit world data", "git")
                .args(["commit", "-m"])
                .arg(format!("backup {}", now.to_rfc3339()))
                .current_dir(dir),
        ));
        steps.push((
            BackupStep::Push,
            CommandSpec::new("push world data", "git")
                .args(["push", BACKUP_REMOTE, self.settings.branch.as_str()])
                .current_dir(dir),
        ));

        steps
    }

    /// Run the pipeline once, stopping at the first failing step
    pub async fn run_once(&self) -> BackupOutcome {
        for (step, command) in self.pipeline((self.clock)()) {
            if let Err(e) = self.runner.run(&command).await {
                self.metrics.record_backup_error(step);
                error!("Backup failed at step '{}': {}", step, e);
                return BackupOutcome::Failed {
                    step,
                    reason: e.to_string(),
                };
            }
        }

        let at = self.metrics.record_backup((self.clock)()).await;
        info!("Backup completed at {}", at.to_rfc3339());
        BackupOutcome::Completed { at }
    }

    /// Back up on every tick until `token` is cancelled, then once more
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let period = self.settings.interval;
        info!(
            "Starting backup engine (interval: {:?}, mode: {})",
            period, self.settings.mode
        );

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let shutdown = tokio::select! {
                biased;
                _ = token.cancelled() => true,
                _ = ticker.tick() => false,
            };

            if shutdown {
                info!("Backup before termination");
                self.run_once().await;
                break;
            }

            self.run_once().await;
        }

        info!("Backup engine stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::{exit_failure, ScriptedRunner};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn create_test_settings(mode: BackupMode) -> BackupSettings {
        BackupSettings {
            work_dir: PathBuf::from("/srv/world"),
            interval: Duration::from_secs(10),
            mode,
            archive_name: DEFAULT_ARCHIVE_NAME.to_string(),
            branch: DEFAULT_BACKUP_BRANCH.to_string(),
        }
    }

    fn create_engine(runner: Arc<ScriptedRunner>, metrics: Arc<Metrics>) -> BackupEngine {
        BackupEngine::new(runner, metrics, create_test_settings(BackupMode::Archive))
    }

    fn failing_on(program_arg: &'static str) -> ScriptedRunner {
        ScriptedRunner::new(move |spec| {
            if spec.command_line().contains(program_arg) {
                Err(exit_failure(spec))
            } else {
                Ok(Default::default())
            }
        })
    }

    fn assert_no_errors(metrics: &Metrics) {
        for step in BackupStep::ALL {
            assert_eq!(metrics.backup_errors(step), 0, "step {}", step);
        }
    }

    #[test]
    fn test_backup_mode_from_str() {
        assert_eq!("archive".parse::<BackupMode>(), Ok(BackupMode::Archive));
        assert_eq!("In-Place".parse::<BackupMode>(), Ok(BackupMode::InPlace));
        assert_eq!("stage".parse::<BackupMode>(), Ok(BackupMode::InPlace));
        assert!("zip".parse::<BackupMode>().is_err());
    }

    #[test]
    fn test_archive_pipeline_commands() {
        let engine = create_engine(
            Arc::new(ScriptedRunner::succeeding()),
            Arc::new(Metrics::new()),
        );
        let now = Utc::now();

        let steps = engine.pipeline(now);
        let lines: Vec<(BackupStep, String)> = steps
            .iter()
            .map(|(step, spec)| (*step, spec.command_line()))
            .collect();

        assert_eq!(
            lines,
            vec![
                (
                    BackupStep::Archive,
                    "tar --exclude=./server.tar.gz --exclude=./.git -czf server.tar.gz .".to_string()
                ),
                (BackupStep::Stage, "git add server.tar.gz".to_string()),
                (
                    BackupStep::Commit,
                    format!("git commit -m backup {}", now.to_rfc3339())
                ),
                (BackupStep::Push, "git push origin main".to_string()),
            ]
        );
        assert!(steps
            .iter()
            .all(|(_, spec)| spec.cwd() == Some(std::path::Path::new("/srv/world"))));
    }

    #[test]
    fn test_in_place_pipeline_skips_archive() {
        let engine = BackupEngine::new(
            Arc::new(ScriptedRunner::succeeding()),
            Arc::new(Metrics::new()),
            create_test_settings(BackupMode::InPlace),
        );

        let steps: Vec<BackupStep> = engine
            .pipeline(Utc::now())
            .into_iter()
            .map(|(step, _)| step)
            .collect();

        assert_eq!(
            steps,
            vec![BackupStep::Stage, BackupStep::Commit, BackupStep::Push]
        );
        assert_eq!(
            engine.pipeline(Utc::now())[0].1.command_line(),
            "git add --all"
        );
    }

    #[tokio::test]
    async fn test_run_once_success_updates_timestamp() {
        let runner = Arc::new(ScriptedRunner::succeeding());
        let metrics = Arc::new(Metrics::new());
        let engine = create_engine(runner.clone(), metrics.clone());

        let outcome = engine.run_once().await;

        assert!(outcome.is_completed());
        assert_eq!(runner.calls().len(), 4);
        assert!(metrics.last_backup().await.is_some());
        assert_eq!(metrics.backups_completed(), 1);
        assert_no_errors(&metrics);
    }

    #[tokio::test]
    async fn test_run_once_short_circuits_on_commit_failure() {
        let runner = Arc::new(failing_on("commit"));
        let metrics = Arc::new(Metrics::new());
        let engine = create_engine(runner.clone(), metrics.clone());

        let outcome = engine.run_once().await;

        assert!(matches!(
            outcome,
            BackupOutcome::Failed {
                step: BackupStep::Commit,
                ..
            }
        ));
        let names: Vec<String> = runner.calls().into_iter().map(|c| c.name).collect();
        assert_eq!(
            names,
            vec!["archive world data", "stage world data", "commit world data"]
        );
        assert_eq!(metrics.backup_errors(BackupStep::Commit), 1);
        assert_eq!(metrics.backup_errors(BackupStep::Push), 0);
        assert!(metrics.last_backup().await.is_none());
    }

    #[tokio::test]
    async fn test_run_once_archive_failure_runs_nothing_else() {
        let runner = Arc::new(failing_on("tar"));
        let metrics = Arc::new(Metrics::new());
        let engine = create_engine(runner.clone(), metrics.clone());

        engine.run_once().await;

        assert_eq!(runner.calls().len(), 1);
        assert_eq!(metrics.backup_errors(BackupStep::Archive), 1);
        assert_eq!(metrics.backups_completed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_ticks_update_timestamp_each_time() {
        let runner = Arc::new(ScriptedRunner::succeeding());
        let metrics = Arc::new(Metrics::new());
        // Timestamps follow the paused tokio clock
        let origin = Instant::now();
        let base = Utc::now();
        let clock: Clock = Arc::new(move || {
            base + chrono::Duration::from_std(origin.elapsed()).unwrap()
        });
        let engine = create_engine(runner.clone(), metrics.clone()).with_clock(clock);
        let token = CancellationToken::new();

        let handle = tokio::spawn(engine.run(token.clone()));

        // Nothing happens before the first interval elapses
        sleep(Duration::from_secs(5)).await;
        assert!(runner.calls().is_empty());

        let mut previous = None;
        for tick in 1..=3u64 {
            sleep(Duration::from_secs(10)).await;
            assert_eq!(metrics.backups_completed(), tick);
            let current = metrics.last_backup().await;
            assert!(current.is_some());
            assert!(current > previous);
            previous = current;
        }
        assert_no_errors(&metrics);

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_failure_on_one_cycle_only() {
        let pushes = Arc::new(AtomicUsize::new(0));
        let push_counter = pushes.clone();
        let runner = Arc::new(ScriptedRunner::new(move |spec| {
            if spec.name() == "push world data"
                && push_counter.fetch_add(1, Ordering::SeqCst) == 1
            {
                return Err(exit_failure(spec));
            }
            Ok(Default::default())
        }));
        let metrics = Arc::new(Metrics::new());
        let engine = create_engine(runner.clone(), metrics.clone());
        let token = CancellationToken::new();

        let handle = tokio::spawn(engine.run(token.clone()));

        sleep(Duration::from_secs(15)).await;
        let first = metrics.last_backup().await;
        assert!(first.is_some());

        sleep(Duration::from_secs(10)).await;
        assert_eq!(metrics.backup_errors(BackupStep::Push), 1);
        assert_eq!(metrics.last_backup().await, first);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(metrics.backup_errors(BackupStep::Push), 1);
        assert_eq!(metrics.backups_completed(), 2);
        assert!(metrics.last_backup().await >= first);

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_runs_exactly_one_final_backup() {
        let runner = Arc::new(ScriptedRunner::succeeding());
        let metrics = Arc::new(Metrics::new());
        let engine = create_engine(runner.clone(), metrics.clone());
        let token = CancellationToken::new();

        let handle = tokio::spawn(engine.run(token.clone()));
        sleep(Duration::from_secs(25)).await;
        assert_eq!(metrics.backups_completed(), 2);

        token.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(metrics.backups_completed(), 3);
        assert_eq!(runner.calls().len(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_final_backup_still_terminates() {
        let runner = Arc::new(failing_on("tar"));
        let metrics = Arc::new(Metrics::new());
        let engine = create_engine(runner.clone(), metrics.clone());
        let token = CancellationToken::new();
        token.cancel();

        engine.run(token).await.unwrap();

        assert_eq!(runner.calls().len(), 1);
        assert_eq!(metrics.backup_errors(BackupStep::Archive), 1);
        assert!(metrics.last_backup().await.is_none());
    }
}
