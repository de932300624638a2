use anyhow::Context;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use worldkeeper::app::Keeper;
use worldkeeper::bootstrap::Bootstrap;
use worldkeeper::cli::{Cli, Commands};
use worldkeeper::config::Config;
use worldkeeper::logging;
use worldkeeper::metrics::Metrics;
use worldkeeper::process::ProcessRunner;

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    if let Err(e) = logging::init(cli.log_format) {
        eprintln!("✗ Error: {}", e);
        return ExitCode::FAILURE;
    }

    let result = match cli.command() {
        Commands::Run => run().await,
        Commands::CheckConfig => check_config(),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("Terminating, reason: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let mut config = Config::from_env().context("failed to load configuration")?;
    config.log_summary();

    let runner = Arc::new(ProcessRunner::new(config.stop_timeout));
    let work_dir = Bootstrap::new(runner.as_ref(), &config)
        .run()
        .await
        .context("bootstrap failed")?;
    config.work_dir = work_dir;

    let keeper = Keeper::new(config, runner, Arc::new(Metrics::new()));
    let reason = keeper.run().await.context("failed to start tasks")?;

    info!("Terminating, reason: {}", reason);
    Ok(ExitCode::from(reason.exit_code()))
}

fn check_config() -> anyhow::Result<ExitCode> {
    let config = Config::from_env().context("failed to load configuration")?;
    let rendered =
        serde_json::to_string_pretty(&config).context("failed to render configuration")?;
    println!("{}", rendered);
    Ok(ExitCode::SUCCESS)
}
