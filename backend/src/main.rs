//! Backup Orchestrator - Main Entry Point

use std::process::ExitCode;

use clap::Parser;

use backup_orchestrator::{cli, config::Config, db, error::Result, telemetry};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = cli::BackupCli::parse();

    // Load configuration
    let config = Config::from_env()?;
    telemetry::init_tracing(&config.log_level);
    tracing::info!(storage = %config.storage_path.display(), "Starting backup orchestrator");

    // Connect to database
    let db_pool = db::create_pool(&config.database_url).await?;
    tracing::info!("Connected to database");

    Ok(cli::run(args, config, db_pool).await)
}
