// CLI module - Command-line entry points

use crate::logging::LogFormat;
use clap::{Parser, Subcommand};

/// Worldkeeper - keeps a game server running and its world backed up in git
#[derive(Debug, Parser)]
#[command(name = "worldkeeper")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Bootstrap the working directory and supervise the server (default)
    Run,

    /// Load and validate the configuration, print it as JSON and exit
    CheckConfig,
}

impl Cli {
    /// Selected command, `run` when none was given
    pub fn command(&self) -> Commands {
        self.command.unwrap_or(Commands::Run)
    }
}
