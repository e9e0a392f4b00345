use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bfi_adapters::{FixtureSource, InspectionSource};
use bfi_core::SyncRun;
use bfi_storage::{
    InspectionQueries, InspectionStore, MemoryInspectionStore, PgInspectionStore, FEED_SOURCE,
};
use bfi_sync::{assess_health, SyncConfig, SyncOrchestrator};
use bfi_web::AppState;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bfi-cli")]
#[command(about = "Boston food establishment inspections sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch recent inspections and reconcile them into storage.
    Sync {
        /// Days to look back (defaults to SYNC_DAYS_BACK).
        #[arg(long)]
        days: Option<u32>,
        /// Read a captured API response instead of calling the portal.
        #[arg(long)]
        fixture: Option<PathBuf>,
        /// Reconcile into memory; nothing is written to Postgres.
        #[arg(long)]
        dry_run: bool,
    },
    /// Create tables and indexes.
    Migrate,
    /// Serve the JSON API.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Show recent sync runs and current health.
    Status {
        #[arg(long, default_value_t = 5)]
        limit: u32,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn connect(config: &SyncConfig) -> Result<PgInspectionStore> {
    PgInspectionStore::connect(&config.database_url)
        .await
        .context("connecting to DATABASE_URL")
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        days: None,
        fixture: None,
        dry_run: false,
    }) {
        Commands::Sync { days, fixture, dry_run } => {
            if let Some(days) = days {
                config.days_back = days;
            }
            config.validate()?;

            let source: Arc<dyn InspectionSource> = match fixture {
                Some(path) => Arc::new(FixtureSource::open(&path)?),
                None => Arc::new(config.ckan_source()?),
            };

            if dry_run {
                let store = Arc::new(MemoryInspectionStore::new());
                let run = sync_into(source, store.clone(), &config).await?;
                print_run(&run);
                println!("dry run: {} rows held in memory", store.count().await?);
            } else {
                let store = connect(&config).await?;
                store.migrate().await?;
                let run = sync_into(source, Arc::new(store), &config).await?;
                print_run(&run);
            }
        }
        Commands::Migrate => {
            connect(&config).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve { port } => {
            let port = match port {
                Some(port) => port,
                None => std::env::var("PORT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(8000),
            };
            let store = connect(&config).await?;
            store.migrate().await?;
            bfi_web::serve(AppState::new(Arc::new(store)), port).await?;
        }
        Commands::Status { limit } => {
            let store = connect(&config).await?;
            let runs = store.recent_runs(limit.max(1)).await?;
            let last_feed_run = store.last_run(FEED_SOURCE).await?;
            let report = assess_health(last_feed_run.as_ref(), Utc::now());
            println!(
                "health: {:?}{}",
                report.status,
                report.reason.as_deref().map(|r| format!(" ({r})")).unwrap_or_default()
            );
            for run in &runs {
                print_run(run);
            }
        }
    }

    Ok(())
}

async fn sync_into(
    source: Arc<dyn InspectionSource>,
    store: Arc<dyn InspectionStore>,
    config: &SyncConfig,
) -> Result<SyncRun> {
    info!(source = source.source_id(), days_back = config.days_back, "starting sync");
    let orchestrator = SyncOrchestrator::new(source, store, config.page_size);
    Ok(orchestrator.run(config.days_back).await?)
}

fn print_run(run: &SyncRun) {
    println!(
        "run {} [{}] cutoff={} fetched={} inserted={} updated={} unchanged={} failed={}{}",
        run.run_id,
        run.state,
        run.cutoff,
        run.counts.fetched,
        run.counts.inserted,
        run.counts.updated,
        run.counts.unchanged,
        run.counts.failed,
        run.error_detail
            .as_deref()
            .map(|d| format!(" error={d}"))
            .unwrap_or_default()
    );
}
