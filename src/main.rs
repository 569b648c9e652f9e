use clap::{Parser, Subcommand};
use serde::Serialize;
use std::sync::Arc;
use tokio::signal;
use tokio::time::{interval_at, Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pinclaim::claim::{ClaimRecord, ClaimView, Page};
use pinclaim::{config, metrics, storage};

#[derive(Parser)]
#[command(author, version, about = "pinclaim: payment-gated pin admission store tools")]
struct Cli {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Newest claims first, 20 per page
    Claims {
        #[arg(long, default_value_t = 1)]
        page: usize,
    },
    /// Show one claim by object id
    Status { object_id: String },
    /// Claims whose validity is still undecided
    Unprocessed,
    /// Claims not yet pinned
    Unpinned,
    LocalPins,
    /// Reset download tries on every claim
    Amnesty,
    Stats,
    /// Serve the metrics endpoint until Ctrl+C
    Metrics,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn views(records: Vec<ClaimRecord>) -> Vec<ClaimView> {
    records.iter().map(ClaimRecord::view).collect()
}

/// Serve the store gauges, refreshed every report interval, until Ctrl+C.
async fn serve_store_metrics(cfg: &config::Config, db: &storage::Store) -> anyhow::Result<()> {
    let registry = Arc::new(metrics::Metrics::new()?);
    registry.observe_store(&db.get_stats()?);
    metrics::serve(cfg.metrics.clone(), registry.clone())?;
    info!("press Ctrl+C to stop");

    let period = Duration::from_secs(cfg.timers.report_interval_secs.max(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            res = signal::ctrl_c() => {
                res?;
                info!("shutdown signal received");
                return Ok(());
            }
            _ = ticker.tick() => match db.get_stats() {
                Ok(stats) => registry.observe_store(&stats),
                Err(e) => warn!("could not read store stats: {e:#}"),
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = config::load(&cli.config)?;

    let db = storage::open(&cfg.storage)?;

    let result = match cli.cmd {
        Cmd::Claims { page } => {
            let page = db.recent_claims(page)?;
            print_json(&Page {
                items: views(page.items),
                current_page: page.current_page,
                total_pages: page.total_pages,
                page_size: page.page_size,
                total_items: page.total_items,
            })
        }
        Cmd::Status { object_id } => match db.get_claim(&object_id)? {
            Some(record) => print_json(&record.view()),
            None => {
                println!("no claim for {object_id}");
                Ok(())
            }
        },
        Cmd::Unprocessed => print_json(&views(db.unprocessed_claims()?)),
        Cmd::Unpinned => print_json(&views(db.unresolved_claims()?)),
        Cmd::LocalPins => print_json(&db.local_pins()?),
        Cmd::Amnesty => {
            let reset = db.reset_download_tries()?;
            println!("reset download tries on {reset} claims");
            Ok(())
        }
        Cmd::Stats => {
            let stats = db.get_stats()?;
            println!("claims:       {}", stats.claim_count);
            println!("pinned:       {}", stats.pinned_count);
            println!("unprocessed:  {}", stats.unprocessed_count);
            println!("local pins:   {}", stats.local_pin_count);
            Ok(())
        }
        Cmd::Metrics => serve_store_metrics(&cfg, &db).await,
    };

    if let Err(e) = db.close() {
        warn!("database cleanup failed: {e:#}");
    }
    result
}
