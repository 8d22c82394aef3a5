use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing::info;
use vulnwatch_bot::build_notifiers;
use vulnwatch_feeds::{FeedClient, TimeFrame};
use vulnwatch_poll::{run_job, Config};
use vulnwatch_storage::SnapshotStore;

#[derive(Debug, Parser)]
#[command(name = "vulnwatch")]
#[command(about = "Polls CVE feeds and pushes new vulnerabilities to chat webhooks")]
struct Cli {
    /// Time frame to search for trending CVEs
    #[arg(short, long, value_enum, default_value_t = TimeFrameArg::Day)]
    time: TimeFrameArg,

    /// Run the job every X minutes instead of once
    #[arg(short, long, value_name = "MINUTES")]
    cron: Option<u64>,

    /// Keep snapshot files X hours (overrides the config value)
    #[arg(short, long, value_name = "HOURS")]
    db: Option<i64>,

    /// Use the specified config file
    #[arg(short = 'f', long, default_value = "config.json")]
    config: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TimeFrameArg {
    Day,
    Week,
}

impl From<TimeFrameArg> for TimeFrame {
    fn from(arg: TimeFrameArg) -> Self {
        match arg {
            TimeFrameArg::Day => TimeFrame::Day,
            TimeFrameArg::Week => TimeFrame::Week,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    let retention_hours = cli.db.unwrap_or(config.db_hours);
    let frame = TimeFrame::from(cli.time);

    let store = SnapshotStore::new(&config.store_dir);
    let feeds = FeedClient::new(config.proxy.as_deref())?;
    let notifiers = build_notifiers(&config.bot, config.proxy.as_deref())?;
    if notifiers.is_empty() {
        info!("no notifiers enabled; new entries will only be logged");
    }

    match cli.cron {
        Some(minutes) => {
            let mut ticks = tokio::time::interval(Duration::from_secs(minutes * 60));
            // ticks are far apart relative to run time; each run completes
            // before the next tick is examined
            loop {
                ticks.tick().await;
                let summary = run_job(
                    &store,
                    &feeds,
                    &config.keywords,
                    &notifiers,
                    frame,
                    retention_hours,
                )
                .await?;
                info!(
                    run_id = %summary.run_id,
                    trending = ?summary.trending,
                    last = ?summary.last,
                    "poll run complete"
                );
            }
        }
        None => {
            let summary = run_job(
                &store,
                &feeds,
                &config.keywords,
                &notifiers,
                frame,
                retention_hours,
            )
            .await?;
            println!(
                "poll complete: run_id={} trending={:?} last={:?}",
                summary.run_id, summary.trending, summary.last
            );
        }
    }

    Ok(())
}
