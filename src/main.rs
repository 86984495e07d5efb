use anyhow::Result;
use chrono::{Local, Utc};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

mod config;
mod db;
mod error;
mod feed;
mod ingest;
mod poller;
mod results;
mod status;

use config::{Config, RunMode};
use db::Database;
use feed::{FeedClient, HttpFeedClient};
use poller::{Poller, ResultsJob};
use status::{AppState, StatusBoard};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // RUST_LOG wins; otherwise info, with our own target at debug under --verbose
    let default_filter = if config.verbose {
        "info,line_ingest=debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    config.validate()?;
    let mode = config.mode();

    // Schema is created or patched on every start
    let db = Database::open(
        &config.database_path,
        Duration::from_millis(config.busy_timeout_ms),
    )?;
    info!("Database ready: {}", config.database_path);

    if mode == RunMode::CreateTables {
        info!("Schema created/patched, exiting");
        return Ok(());
    }

    let settings = config.store_settings();

    if mode == RunMode::Prune {
        let report = db.prune(Utc::now().timestamp(), &settings)?;
        info!(
            events = report.events,
            odds = report.odds,
            history = report.history,
            results = report.results,
            match_results = report.match_results,
            set_scores = report.set_scores,
            closing_odds = report.closing_odds,
            "Retention pass removed {} row(s)",
            report.total()
        );
        return Ok(());
    }

    let board = StatusBoard::default();
    if let Some(addr) = &config.status_addr {
        let addr: SocketAddr = addr.parse()?;
        let app = status::router(AppState {
            db: db.clone(),
            board: board.clone(),
        });
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Status endpoint listening on http://{}", addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("Status server stopped: {}", e);
            }
        });
    }

    // Ctrl-C flips the watch; the sender stays alive so the loops never see a closed channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => warn!("Cannot listen for interrupt signal: {}", e),
        }
        std::future::pending::<()>().await;
    });

    let client: Arc<dyn FeedClient> = Arc::new(HttpFeedClient::new(
        &config.user_agent,
        Duration::from_secs(config.http_timeout_secs),
    )?);

    match mode {
        RunMode::FetchOnce | RunMode::LivePoll => {
            let poller = Poller::new(
                client,
                db,
                config.live_request()?,
                config.feed_filter()?,
                config.market_rules()?,
                settings,
                config.prune_every,
                config.verbose,
                board,
            );
            if mode == RunMode::FetchOnce {
                let summary = poller.tick().await?;
                info!(
                    tick = summary.tick,
                    events = summary.events,
                    odds = summary.odds,
                    stale = summary.stale,
                    finished = summary.finished,
                    "Single tick committed"
                );
            } else {
                poller
                    .run(Duration::from_secs(config.poll_interval), shutdown_rx)
                    .await;
            }
        }
        RunMode::ResultsOnce(_) | RunMode::ResultsBackfill { .. } | RunMode::ResultsPoll => {
            let job = ResultsJob::new(
                client,
                db,
                config.results_request(),
                config.feed_filter()?,
                settings,
                board,
            );
            match mode {
                RunMode::ResultsOnce(date) => {
                    job.run_date(date.unwrap_or_else(|| Local::now().date_naive()))
                        .await?;
                }
                RunMode::ResultsBackfill { from, to } => {
                    let (ok, failed) = job.backfill(from, to).await;
                    if ok == 0 && failed > 0 {
                        anyhow::bail!("every date in the backfill failed");
                    }
                }
                _ => {
                    job.run(
                        Duration::from_secs(config.results_poll_interval),
                        shutdown_rx,
                    )
                    .await;
                }
            }
        }
        RunMode::CreateTables | RunMode::Prune => {}
    }

    Ok(())
}
