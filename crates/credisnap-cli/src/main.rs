use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use credisnap_sync::{PipelineConfig, RunSummary, SyncPipeline};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "credisnap")]
#[command(about = "Credistory snapshot pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create tables if absent, then run offers followed by reviews.
    RunAll,
    /// Capture microloan offers and write a snapshot.
    Offers,
    /// Scrape new reviews and write a snapshot.
    Reviews,
    /// Create the snapshot tables if absent.
    Migrate,
    /// Run `run-all` on the configured cron schedule until interrupted.
    Schedule,
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{} run complete: run_id={} captured={} duplicates={} rows={}",
        summary.pipeline, summary.run_id, summary.captured, summary.duplicates, summary.rows_written
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();
    let pipeline = SyncPipeline::from_config(config).await?;

    match cli.command.unwrap_or(Commands::RunAll) {
        Commands::RunAll => {
            for summary in pipeline.run_all().await? {
                print_summary(&summary);
            }
        }
        Commands::Offers => print_summary(&pipeline.run_offers().await?),
        Commands::Reviews => print_summary(&pipeline.run_reviews().await?),
        Commands::Migrate => {
            pipeline.migrate().await?;
            println!("snapshot tables ready");
        }
        Commands::Schedule => {
            let pipeline = Arc::new(pipeline);
            pipeline.migrate().await?;
            let Some(scheduler) = pipeline.maybe_build_scheduler().await? else {
                anyhow::bail!("scheduler disabled; set CREDISNAP_SCHEDULER_ENABLED=true");
            };
            scheduler.start().await.context("starting scheduler")?;
            tracing::info!(cron = %pipeline.config().sync_cron, "scheduler started");
            tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
            tracing::info!("shutting down scheduler");
        }
    }

    Ok(())
}
