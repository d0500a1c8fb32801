use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bidbase_core::DateWindow;
use bidbase_ocds::{ReleaseSource, StaticReleaseSource};
use bidbase_storage::{MemoryTenderStore, TenderStore};
use bidbase_sync::{SyncConfig, SyncPipeline, BACKFILL_MONTHS, BACKFILL_PAGE_SIZE};
use bidbase_web::{AppState, DEFAULT_WEB_PORT};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bidbase")]
#[command(about = "BidBase tender ingestion and query service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull one window of OCDS releases into the store (default: six-month backfill).
    Sync(SyncArgs),
    /// Apply database migrations.
    Migrate,
    /// Run the JSON API, plus the cron scheduler when enabled.
    Serve(ServeArgs),
    /// Delete duplicate document rows, keeping the oldest of each key.
    CleanupDocuments,
    /// Print row counts and the most recent tenders.
    Check {
        #[arg(long, default_value_t = 5)]
        recent: usize,
    },
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// First day of an explicit window (YYYY-MM-DD).
    #[arg(long, requires = "to")]
    from: Option<NaiveDate>,
    /// Last day of an explicit window (YYYY-MM-DD).
    #[arg(long, requires = "from")]
    to: Option<NaiveDate>,
    /// Sync the last N days instead of the backfill window.
    #[arg(long, conflicts_with_all = ["from", "to"])]
    days: Option<u64>,
    #[arg(long)]
    page_size: Option<u32>,
    /// Read releases from a local JSON file instead of the upstream API.
    #[arg(long)]
    fixture: Option<PathBuf>,
    /// Write into a throwaway in-memory store instead of Postgres.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[arg(long, env = "BIDBASE_WEB_PORT", default_value_t = DEFAULT_WEB_PORT)]
    port: u16,
    /// Bearer token required by the cron trigger route.
    #[arg(long, env = "BIDBASE_CRON_SECRET", hide_env_values = true)]
    cron_secret: Option<String>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn sync_window(args: &SyncArgs, today: NaiveDate) -> DateWindow {
    match (args.from, args.to, args.days) {
        (Some(from), Some(to), _) => DateWindow::new(from, to),
        (_, _, Some(days)) => DateWindow::last_days(today, days),
        _ => DateWindow::last_months(today, BACKFILL_MONTHS),
    }
}

async fn run_sync(config: &SyncConfig, args: SyncArgs) -> Result<()> {
    let source: Arc<dyn ReleaseSource> = match &args.fixture {
        Some(path) => Arc::new(StaticReleaseSource::from_fixture(path)?) as Arc<dyn ReleaseSource>,
        None => Arc::new(bidbase_sync::build_ocds_client(config)?) as Arc<dyn ReleaseSource>,
    };
    let store: Arc<dyn TenderStore> = if args.dry_run {
        Arc::new(MemoryTenderStore::new()) as Arc<dyn TenderStore>
    } else {
        bidbase_sync::connect_store(config).await? as Arc<dyn TenderStore>
    };

    let window = sync_window(&args, Utc::now().date_naive());
    let page_size = args.page_size.unwrap_or(BACKFILL_PAGE_SIZE);
    let summary = SyncPipeline::new(store, source)
        .run_window(window, page_size)
        .await
        .with_context(|| format!("syncing window {window}"))?;

    println!(
        "sync complete: run_id={} window={} fetched={} processed={} skipped={} documents={} skipped_documents={}",
        summary.run_id,
        window,
        summary.fetched_releases,
        summary.processed_releases,
        summary.skipped_releases,
        summary.documents_upserted,
        summary.skipped_documents
    );
    Ok(())
}

async fn run_serve(config: &SyncConfig, args: ServeArgs) -> Result<()> {
    let store = bidbase_sync::connect_store(config).await?;
    let client = bidbase_sync::build_ocds_client(config)?;
    let pipeline = Arc::new(SyncPipeline::new(store.clone(), Arc::new(client.clone())));

    let scheduler = bidbase_sync::maybe_build_scheduler(config, pipeline.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.sync_cron, "sync scheduler started");
    }

    let state = AppState::new(store, client)
        .with_pipeline(pipeline, config.cron_page_size)
        .with_cron_secret(args.cron_secret);
    bidbase_web::serve(state, args.port).await
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => run_sync(&config, args).await?,
        Commands::Migrate => {
            let store = bidbase_sync::connect_store(&config).await?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Serve(args) => run_serve(&config, args).await?,
        Commands::CleanupDocuments => {
            let store = bidbase_sync::connect_store(&config).await?;
            let removed = store.cleanup_duplicate_documents().await?;
            println!("removed {removed} duplicate document rows");
        }
        Commands::Check { recent } => {
            let store = bidbase_sync::connect_store(&config).await?;
            let overview = store.overview(recent).await?;
            println!(
                "tenders={} documents={}",
                overview.tender_count, overview.document_count
            );
            for tender in &overview.recent_tenders {
                println!("  {} {}", tender.ocid, tender.title);
            }
            match overview.sample_with_documents {
                Some(sample) => println!("sample with documents: {} {}", sample.ocid, sample.title),
                None => println!("no tender has documents yet"),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, 31).unwrap()
    }

    #[test]
    fn sync_window_prefers_explicit_bounds_then_days() {
        let args = SyncArgs {
            from: NaiveDate::from_ymd_opt(2025, 1, 1),
            to: NaiveDate::from_ymd_opt(2025, 1, 31),
            ..Default::default()
        };
        assert_eq!(sync_window(&args, today()).to_string(), "2025-01-01..=2025-01-31");

        let args = SyncArgs {
            days: Some(1),
            ..Default::default()
        };
        assert_eq!(sync_window(&args, today()).from_param(), "2025-08-30");

        let backfill = sync_window(&SyncArgs::default(), today());
        assert_eq!(backfill.from_param(), "2025-02-28");
    }

    #[test]
    fn cli_parses_sync_flags() {
        let cli = Cli::try_parse_from([
            "bidbase",
            "sync",
            "--days",
            "3",
            "--page-size",
            "100",
            "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Sync(args)) => {
                assert_eq!(args.days, Some(3));
                assert_eq!(args.page_size, Some(100));
                assert!(args.dry_run);
            }
            other => panic!("unexpected command: {other:?}"),
        }

        assert!(Cli::try_parse_from(["bidbase", "sync", "--from", "2025-01-01"]).is_err());
        assert!(Cli::try_parse_from([
            "bidbase",
            "sync",
            "--days",
            "1",
            "--from",
            "2025-01-01",
            "--to",
            "2025-01-02",
        ])
        .is_err());
    }
}
