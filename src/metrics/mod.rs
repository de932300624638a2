// Metrics module - Shared counters and the last successful backup record

use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, gauge, Counter, Gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Prefix applied to every exported metric name
const NAMESPACE: &str = "worldkeeper";

/// Steps of the backup pipeline, each with its own failure counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackupStep {
    Archive,
    Stage,
    Commit,
    Push,
}

impl BackupStep {
    pub const ALL: [BackupStep; 4] = [
        BackupStep::Archive,
        BackupStep::Stage,
        BackupStep::Commit,
        BackupStep::Push,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStep::Archive => "archive",
            BackupStep::Stage => "stage",
            BackupStep::Commit => "commit",
            BackupStep::Push => "push",
        }
    }

    fn index(&self) -> usize {
        match self {
            BackupStep::Archive => 0,
            BackupStep::Stage => 1,
            BackupStep::Commit => 2,
            BackupStep::Push => 3,
        }
    }
}

impl std::fmt::Display for BackupStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counter exported through the recorder that can also be read back in-process
struct Tally {
    exported: Counter,
    total: AtomicU64,
}

impl Tally {
    fn new(exported: Counter) -> Self {
        Self {
            exported,
            total: AtomicU64::new(0),
        }
    }

    fn increment(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.exported.increment(1);
    }

    fn get(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Counters and backup record shared by every supervised task
///
/// Values are registered on a Prometheus recorder owned by this instance;
/// nothing is installed globally. The last backup time is the only locked
/// value: the backup engine is its sole writer, the HTTP handlers read it.
pub struct Metrics {
    prometheus: PrometheusHandle,
    server_starts: Tally,
    server_errors: Tally,
    backups_completed: Tally,
    backup_errors: [Tally; 4],
    plugin_errors: Tally,
    plugin_updates: Tally,
    last_backup_gauge: Gauge,
    last_backup: RwLock<Option<DateTime<Utc>>>,
}

impl Metrics {
    pub fn new() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        let prometheus = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            describe_counter!(
                metric_name("server_starts_total"),
                "Number of attempts to start the managed server"
            );
            describe_counter!(
                metric_name("server_errors_total"),
                "Number of managed server runs that failed to start or exited with an error"
            );
            describe_counter!(
                metric_name("backups_total"),
                "Number of backup pipeline runs that completed successfully"
            );
            describe_counter!(
                metric_name("backup_errors_total"),
                "Number of failed backup steps"
            );
            describe_counter!(
                metric_name("plugin_check_errors_total"),
                "Number of failed plugin update checks"
            );
            describe_counter!(
                metric_name("plugin_updates_total"),
                "Number of plugin updates pulled"
            );
            describe_gauge!(
                metric_name("last_backup_timestamp_seconds"),
                "Unix time of the last successful backup, 0 if none"
            );

            let step_errors = |step: BackupStep| {
                Tally::new(counter!(metric_name("backup_errors_total"), "step" => step.as_str()))
            };

            Self {
                prometheus,
                server_starts: Tally::new(counter!(metric_name("server_starts_total"))),
                server_errors: Tally::new(counter!(metric_name("server_errors_total"))),
                backups_completed: Tally::new(counter!(metric_name("backups_total"))),
                backup_errors: BackupStep::ALL.map(step_errors),
                plugin_errors: Tally::new(counter!(metric_name("plugin_check_errors_total"))),
                plugin_updates: Tally::new(counter!(metric_name("plugin_updates_total"))),
                last_backup_gauge: gauge!(metric_name("last_backup_timestamp_seconds")),
                last_backup: RwLock::new(None),
            }
        })
    }

    pub fn record_server_start(&self) {
        self.server_starts.increment();
    }

    pub fn record_server_error(&self) {
        self.server_errors.increment();
    }

    pub fn record_backup_error(&self, step: BackupStep) {
        self.backup_errors[step.index()].increment();
    }

    pub fn record_plugin_error(&self) {
        self.plugin_errors.increment();
    }

    pub fn record_plugin_update(&self) {
        self.plugin_updates.increment();
    }

    /// Record a fully successful backup pipeline run.
    ///
    /// The stored time never moves backwards: an `at` older than the current
    /// value keeps the current value. Returns the stored time.
    pub async fn record_backup(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let mut last = self.last_backup.write().await;
        let stored = match *last {
            Some(previous) if previous > at => previous,
            _ => at,
        };
        *last = Some(stored);
        self.last_backup_gauge.set(stored.timestamp() as f64);
        self.backups_completed.increment();
        stored
    }

    pub async fn last_backup(&self) -> Option<DateTime<Utc>> {
        *self.last_backup.read().await
    }

    pub fn server_starts(&self) -> u64 {
        self.server_starts.get()
    }

    pub fn server_errors(&self) -> u64 {
        self.server_errors.get()
    }

    pub fn backups_completed(&self) -> u64 {
        self.backups_completed.get()
    }

    pub fn backup_errors(&self, step: BackupStep) -> u64 {
        self.backup_errors[step.index()].get()
    }

    pub fn plugin_errors(&self) -> u64 {
        self.plugin_errors.get()
    }

    pub fn plugin_updates(&self) -> u64 {
        self.plugin_updates.get()
    }

    /// Render all values in the Prometheus text exposition format
    pub fn render(&self) -> String {
        self.prometheus.render()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn metric_name(suffix: &str) -> String {
    format!("{}_{}", NAMESPACE, suffix)
}
