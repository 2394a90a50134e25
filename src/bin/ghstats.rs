//! ghstats CLI: run the ingester, replay archives, and query stored events.

use chrono::Utc;
use clap::{Parser, Subcommand};
use ghstats_rs::config::{BackendKind, Config};
use ghstats_rs::feed::FeedClient;
use ghstats_rs::ingest::{PollScheduler, replay};
use ghstats_rs::model::{EventType, TimeWindow};
use ghstats_rs::storage::{EventStore, PgStore, open_store};
use ghstats_rs::telemetry::{SERVICE_NAME, TelemetryConfig, TelemetryGuard, init_telemetry};
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "ghstats", about = "GitHub public events ingester")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll the feed until interrupted
    Serve {
        /// Seconds between storage status reports (0 disables)
        #[arg(long, default_value_t = 300)]
        report_every: u64,
    },
    /// Load archived feed pages into storage
    Replay {
        /// Directory of archived pages (defaults to RAW_EVENTS_DIR)
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Parse and count without storing
        #[arg(long)]
        dry_run: bool,
    },
    /// Query stored events
    Stats {
        #[command(subcommand)]
        query: StatsQuery,
    },
    /// Show storage health
    Health,
    /// Pull request rollup maintenance (postgres only)
    Rollup {
        #[command(subcommand)]
        action: RollupAction,
    },
}

#[derive(Subcommand)]
enum StatsQuery {
    /// Event counts per type over a trailing window
    Counts {
        /// Window length in minutes
        #[arg(long, default_value_t = 10)]
        minutes: u32,
        /// Restrict to one event type
        #[arg(long = "type")]
        event_type: Option<EventType>,
    },
    /// Average seconds between opened pull requests
    PrInterval {
        /// Repository as owner/name
        repo: String,
        /// Skip the rollup and scan raw events
        #[arg(long)]
        raw: bool,
    },
    /// Stored event count for a repository
    RepoEvents {
        /// Repository as owner/name
        repo: String,
    },
}

#[derive(Subcommand)]
enum RollupAction {
    /// Recompute the rollup from stored events
    Rebuild,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;
    let _guard = telemetry(&config)?;

    match cli.command {
        Command::Serve { report_every } => cmd_serve(config, report_every).await,
        Command::Replay { dir, dry_run } => {
            let dir = dir.unwrap_or_else(|| config.feed.raw_events_dir.clone());
            let store = open_store(&config.storage).await?;
            let stats = replay(&dir, store.as_ref(), dry_run).await?;
            println!("Files:    {}", stats.files_processed);
            println!("Found:    {}", stats.events_found);
            println!("Inserted: {}", stats.events_inserted);
            println!("Errors:   {}", stats.errors);
            Ok(())
        }
        Command::Stats { query } => {
            let store = open_store(&config.storage).await?;
            cmd_stats(&config, store, query).await
        }
        Command::Health => {
            let store = open_store(&config.storage).await?;
            let health = store.health().await;
            println!("{}", serde_json::to_string_pretty(&health)?);
            Ok(())
        }
        Command::Rollup {
            action: RollupAction::Rebuild,
        } => {
            let store = connect_pg(&config).await?;
            let buckets = store.rebuild_rollups().await?;
            println!("Rebuilt {buckets} rollup bucket(s)");
            Ok(())
        }
    }
}

fn telemetry(config: &Config) -> anyhow::Result<TelemetryGuard> {
    Ok(init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: SERVICE_NAME.to_string(),
        default_filter: format!("ghstats_rs={0},ghstats={0}", config.log_level),
    })?)
}

async fn connect_pg(config: &Config) -> anyhow::Result<PgStore> {
    if config.storage.backend != BackendKind::Postgres {
        anyhow::bail!("this command needs STORAGE_BACKEND=postgres");
    }
    let url = config
        .storage
        .database_url
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is not set"))?;
    let store = PgStore::connect(
        url.expose_secret(),
        config.storage.ingest_pool_size,
        config.storage.query_pool_size,
    )
    .await?;
    store.migrate().await?;
    Ok(store)
}

async fn cmd_serve(config: Config, report_every: u64) -> anyhow::Result<()> {
    let store = open_store(&config.storage).await?;
    let feed = FeedClient::new(config.feed.clone(), config.schedule.default_interval_secs)?;
    let cancel = CancellationToken::new();

    info!(backend = %store.backend(), feed = %config.feed.url, "starting ingester");

    let mut scheduler =
        PollScheduler::start(feed, Arc::clone(&store), config.schedule.clone(), cancel.clone())
            .await;
    let ingest = tokio::spawn(async move { scheduler.run().await });

    let reporter = (report_every > 0).then(|| {
        tokio::spawn(report_loop(
            Arc::clone(&store),
            Duration::from_secs(report_every),
            cancel.clone(),
        ))
    });

    let signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("interrupt received, shutting down");
        signal.cancel();
    });

    ingest.await?;
    cancel.cancel();
    if let Some(reporter) = reporter {
        reporter.await?;
    }
    Ok(())
}

/// Periodic read-side summary, run alongside ingestion.
async fn report_loop(store: Arc<dyn EventStore>, every: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(every) => {}
        }
        let window = TimeWindow::last_minutes(10, Utc::now());
        match store.query_event_counts(None, window).await {
            Ok(counts) => info!(total = counts.total, "events in the last 10 minutes"),
            Err(e) => warn!("event count query failed: {e}"),
        }
        let health = store.health().await;
        info!(status = ?health.status, stored = health.total_events, "storage status");
    }
}

async fn cmd_stats(
    config: &Config,
    store: Arc<dyn EventStore>,
    query: StatsQuery,
) -> anyhow::Result<()> {
    if store.backend() == BackendKind::Memory {
        warn!("memory backend starts empty; results only cover this process");
    }

    match query {
        StatsQuery::Counts {
            minutes,
            event_type,
        } => {
            let window = TimeWindow::last_minutes(minutes, Utc::now());
            let counts = store.query_event_counts(event_type, window).await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
        StatsQuery::PrInterval { repo, raw } => {
            let metrics = if raw {
                connect_pg(config).await?.query_avg_interval_raw(&repo).await?
            } else {
                store.query_avg_interval(&repo).await?
            };
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }
        StatsQuery::RepoEvents { repo } => {
            let count = store.count_repo_events(&repo).await?;
            println!("{repo}: {count} event(s)");
        }
    }
    Ok(())
}
