use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use lfc_storage::RunStore;
use lfc_sync::{build_scheduler, connect_store, IngestionPipeline, StoreConfig, SyncConfig};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "lfc-cli")]
#[command(about = "Load forecast ingestion and read API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every configured feed once and print the report.
    Ingest,
    Migrate,
    /// Delete runs older than the retention horizon.
    Prune,
    Serve,
    /// Run `ingest` on SCHEDULE_CRON until interrupted.
    Schedule,
}

fn init_logging() {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        _ => fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let _ = dotenvy::dotenv();
    init_logging();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let report = lfc_sync::run_ingest_once_from_env().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_success() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Migrate => {
            let config = StoreConfig::from_env()?;
            let store = connect_store(&config).await?;
            store.close().await;
            info!("migrations applied");
        }
        Commands::Prune => {
            let config = StoreConfig::from_env()?;
            let store = connect_store(&config).await?;
            let pruned = store
                .prune(config.prune_cutoff(Utc::now()))
                .await
                .context("pruning expired runs")?;
            store.close().await;
            info!(
                pruned_runs = pruned,
                retention_days = config.retention.num_days(),
                "prune complete"
            );
        }
        Commands::Serve => lfc_web::serve_from_env().await?,
        Commands::Schedule => {
            let config = SyncConfig::from_env()?;
            let store = Arc::new(connect_store(&config.store).await?);
            let pipeline = Arc::new(IngestionPipeline::new(&config, store.clone())?);
            let mut sched = build_scheduler(pipeline, &config.schedule_cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.schedule_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            sched.shutdown().await.context("stopping scheduler")?;
            store.close().await;
        }
    }

    Ok(ExitCode::SUCCESS)
}
