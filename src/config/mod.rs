use crate::backup::{BackupMode, DEFAULT_ARCHIVE_NAME, DEFAULT_BACKUP_BRANCH};
use crate::error::{KeeperError, Result};
use crate::plugins::{PluginSettings, DEFAULT_PLUGIN_DIR};
use crate::process::{DEFAULT_RESTART_COOLDOWN, DEFAULT_STOP_TIMEOUT};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

// Environment variable names
pub const WORLD_DATA_REPO: &str = "WORLD_DATA_REPO";
pub const SSH_SCRIPT: &str = "SSH_SCRIPT";
pub const START_SCRIPT: &str = "START_SCRIPT";
pub const SERVER_JAR: &str = "SERVER_JAR";
pub const WORK_DIR: &str = "WORK_DIR";
pub const BACKUP_FREQ: &str = "BACKUP_FREQ";
pub const BACKUP_MODE: &str = "BACKUP_MODE";
pub const BACKUP_ARCHIVE: &str = "BACKUP_ARCHIVE";
pub const BACKUP_BRANCH: &str = "BACKUP_BRANCH";
pub const DISABLE_BACKUP: &str = "DISABLE_BACKUP";
pub const PLUGIN_BRANCH: &str = "PLUGIN_BRANCH";
pub const CHECK_NEW_PLUGIN_FREQ: &str = "CHECK_NEW_PLUGIN_FREQ";
pub const PLUGIN_DIR: &str = "PLUGIN_DIR";
pub const METRICS_PORT: &str = "METRICS_PORT";
pub const MINECRAFT_PORT: &str = "MINECRAFT_PORT";
pub const RESTART_COOLDOWN: &str = "RESTART_COOLDOWN";
pub const STOP_TIMEOUT: &str = "STOP_TIMEOUT";

/// Supervisor configuration, loaded once from the environment
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Repository holding the world data
    pub world_data_repo: String,

    /// Script that starts the SSH agent and loads the deploy key
    pub ssh_script: PathBuf,

    /// Script that starts the server
    pub start_script: PathBuf,

    /// Server artifact passed to the start script
    pub server_jar: PathBuf,

    /// Checkout of the world data repository
    pub work_dir: PathBuf,

    #[serde(with = "duration_text")]
    pub backup_interval: Duration,

    pub backup_mode: BackupMode,

    /// Archive file name used in archive mode
    pub backup_archive: String,

    /// Branch backups are pushed to
    pub backup_branch: String,

    pub disable_backup: bool,

    /// Plugin update settings, `None` when plugin updates are off
    pub plugins: Option<PluginSettings>,

    /// Port of the health and metrics listener
    pub metrics_port: u16,

    /// Address probed by the liveness check
    pub server_addr: String,

    #[serde(with = "duration_text")]
    pub restart_cooldown: Duration,

    /// Grace period between SIGTERM and SIGKILL when stopping the server
    #[serde(with = "duration_text")]
    pub stop_timeout: Duration,
}

impl Config {
    /// Load the configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load the configuration from an arbitrary key lookup
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let plugins = match (env.optional(PLUGIN_BRANCH), env.optional(CHECK_NEW_PLUGIN_FREQ)) {
            (Some(branch), Some(freq)) => Some(PluginSettings {
                branch,
                interval: parse_duration(CHECK_NEW_PLUGIN_FREQ, &freq)?,
                dir: env
                    .optional(PLUGIN_DIR)
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_PLUGIN_DIR)),
            }),
            (None, None) => None,
            (Some(_), None) => {
                return Err(KeeperError::MissingConfigField(
                    CHECK_NEW_PLUGIN_FREQ.to_string(),
                ))
            }
            (None, Some(_)) => {
                return Err(KeeperError::MissingConfigField(PLUGIN_BRANCH.to_string()))
            }
        };

        let config = Config {
            world_data_repo: env.required(WORLD_DATA_REPO)?,
            ssh_script: env.required(SSH_SCRIPT)?.into(),
            start_script: env.required(START_SCRIPT)?.into(),
            server_jar: env.required(SERVER_JAR)?.into(),
            work_dir: env.required(WORK_DIR)?.into(),
            backup_interval: parse_duration(BACKUP_FREQ, &env.required(BACKUP_FREQ)?)?,
            backup_mode: match env.optional(BACKUP_MODE) {
                Some(mode) => mode
                    .parse::<BackupMode>()
                    .map_err(|reason| KeeperError::invalid(BACKUP_MODE, reason))?,
                None => BackupMode::default(),
            },
            backup_archive: env
                .optional(BACKUP_ARCHIVE)
                .unwrap_or_else(|| DEFAULT_ARCHIVE_NAME.to_string()),
            backup_branch: env
                .optional(BACKUP_BRANCH)
                .unwrap_or_else(|| DEFAULT_BACKUP_BRANCH.to_string()),
            disable_backup: match env.optional(DISABLE_BACKUP) {
                Some(value) => parse_bool(DISABLE_BACKUP, &value)?,
                None => false,
            },
            plugins,
            metrics_port: parse_port(METRICS_PORT, &env.required(METRICS_PORT)?)?,
            server_addr: parse_server_addr(MINECRAFT_PORT, &env.required(MINECRAFT_PORT)?)?,
            restart_cooldown: match env.optional(RESTART_COOLDOWN) {
                Some(value) => parse_duration(RESTART_COOLDOWN, &value)?,
                None => DEFAULT_RESTART_COOLDOWN,
            },
            stop_timeout: match env.optional(STOP_TIMEOUT) {
                Some(value) => parse_duration(STOP_TIMEOUT, &value)?,
                None => DEFAULT_STOP_TIMEOUT,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate values that parse but cannot work
    pub fn validate(&self) -> Result<()> {
        if self.backup_archive.contains('/') {
            return Err(KeeperError::invalid(
                BACKUP_ARCHIVE,
                "must be a file name inside the working directory",
            ));
        }

        if self.backup_branch.chars().any(char::is_whitespace) {
            return Err(KeeperError::invalid(
                BACKUP_BRANCH,
                "branch names cannot contain whitespace",
            ));
        }

        if let Some(ref plugins) = self.plugins {
            if plugins.dir.is_absolute() {
                return Err(KeeperError::invalid(
                    PLUGIN_DIR,
                    "must be relative to the working directory",
                ));
            }
        }

        Ok(())
    }

    /// Log the effective configuration at startup
    pub fn log_summary(&self) {
        info!("Configuration:");
        info!("  World data repo: {}", self.world_data_repo);
        info!("  Working directory: {}", self.work_dir.display());
        info!(
            "  Server: {} {}",
            self.start_script.display(),
            self.server_jar.display()
        );
        info!(
            "  Restart cooldown: {}",
            humantime::format_duration(self.restart_cooldown)
        );
        if self.disable_backup {
            info!("  Backups: disabled");
        } else {
            info!(
                "  Backups: every {} ({} mode, branch {})",
                humantime::format_duration(self.backup_interval),
                self.backup_mode,
                self.backup_branch
            );
        }
        match self.plugins {
            Some(ref plugins) => info!(
                "  Plugin updates: every {} from branch {}",
                humantime::format_duration(plugins.interval),
                plugins.branch
            ),
            None => info!("  Plugin updates: disabled"),
        }
        info!("  Metrics port: {}", self.metrics_port);
        info!("  Liveness probe: {}", self.server_addr);
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn required(&self, key: &str) -> Result<String> {
        self.optional(key)
            .ok_or_else(|| KeeperError::MissingConfigField(key.to_string()))
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    let duration =
        humantime::parse_duration(value).map_err(|e| KeeperError::invalid(key, e.to_string()))?;
    if duration.is_zero() {
        return Err(KeeperError::invalid(key, "duration must be greater than zero"));
    }
    Ok(duration)
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "on" => Ok(true),
        "0" | "f" | "false" | "no" | "off" => Ok(false),
        other => Err(KeeperError::invalid(
            key,
            format!("'{}' is not a boolean", other),
        )),
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16> {
    match value.trim_start_matches(':').parse::<u16>() {
        Ok(0) => Err(KeeperError::invalid(key, "port must be greater than zero")),
        Ok(port) => Ok(port),
        Err(e) => Err(KeeperError::invalid(key, format!("'{}': {}", value, e))),
    }
}

/// Accept `host:port`, `:port` or a bare port (meaning the local host)
fn parse_server_addr(key: &str, value: &str) -> Result<String> {
    if !value.contains(':') || value.starts_with(':') {
        let port = parse_port(key, value)?;
        return Ok(format!("127.0.0.1:{}", port));
    }

    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| KeeperError::invalid(key, "expected host:port"))?;
    if host.is_empty() {
        return Err(KeeperError::invalid(key, "expected host:port"));
    }
    parse_port(key, port)?;
    Ok(value.to_string())
}

/// Serialize durations in humantime notation (`1h 30m`)
pub mod duration_text {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }
}
