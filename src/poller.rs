//! Tick driver: fetch → extract → parse → persist on a fixed interval.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use chrono::{Local, NaiveDate, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::StoreSettings;
use crate::db::models::{PruneReport, TickSummary};
use crate::db::Database;
use crate::error::{Stage, StageExt, TickError};
use crate::feed::{FeedClient, FeedRequest};
use crate::ingest::{self, FeedFilter, MarketRules};
use crate::results;
use crate::status::StatusBoard;

/// Run `step` every `period` until `shutdown` flips. Ticks never overlap and
/// missed ticks are skipped, not replayed. An in-flight step is abandoned
/// as soon as shutdown is signalled.
pub async fn run_loop<F, Fut>(name: &str, period: Duration, mut shutdown: watch::Receiver<bool>, mut step: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    info!("{} loop started (interval={:?})", name, period);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = step() => {}
            _ = shutdown.changed() => {
                warn!("{} loop: shutdown during tick, abandoning it", name);
                break;
            }
        }
    }
    info!("{} loop stopped", name);
}

fn now_ts() -> i64 {
    Utc::now().timestamp()
}

fn log_tick_error(err: &TickError) {
    error!(tick = err.tick, stage = %err.stage, "{}", err);
}

async fn blocking<T, F>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow!("storage task failed: {}", e))?
}

/// Reject documents that cannot be a feed at all. An error payload without a
/// sports branch must not be mistaken for "every event disappeared".
fn check_shape(doc: &Value) -> anyhow::Result<()> {
    let root = doc.get("reply").unwrap_or(doc);
    if !root.is_object() {
        anyhow::bail!("feed document is not an object");
    }
    if root.get("sports").is_none() {
        anyhow::bail!("feed document has no sports branch");
    }
    Ok(())
}

/// Live odds poller.
pub struct Poller {
    client: Arc<dyn FeedClient>,
    db: Database,
    request: FeedRequest,
    filter: Arc<FeedFilter>,
    rules: Arc<MarketRules>,
    settings: StoreSettings,
    prune_every: u64,
    verbose: bool,
    board: StatusBoard,
    committed: AtomicU64,
}

impl Poller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn FeedClient>,
        db: Database,
        request: FeedRequest,
        filter: FeedFilter,
        rules: MarketRules,
        settings: StoreSettings,
        prune_every: u64,
        verbose: bool,
        board: StatusBoard,
    ) -> Self {
        Poller {
            client,
            db,
            request,
            filter: Arc::new(filter),
            rules: Arc::new(rules),
            settings,
            prune_every,
            verbose,
            board,
            committed: AtomicU64::new(0),
        }
    }

    /// One complete tick stamped with the current time.
    pub async fn tick(&self) -> Result<TickSummary, TickError> {
        self.tick_at(now_ts()).await
    }

    /// One complete tick with an explicit timestamp shared by every row it
    /// writes. The retention pass runs afterwards in its own transaction; its
    /// failure is logged and does not undo the tick.
    pub async fn tick_at(&self, ts: i64) -> Result<TickSummary, TickError> {
        let started = Instant::now();

        let doc = self
            .client
            .fetch(&self.request)
            .await
            .at_stage(Stage::Fetch, ts)?;
        check_shape(&doc).at_stage(Stage::Extract, ts)?;

        let parsed = ingest::build_batch(&doc, &self.filter, &self.rules, ts);
        if parsed.skipped_events > 0 || parsed.skipped_outcomes > 0 {
            debug!(
                tick = ts,
                skipped_events = parsed.skipped_events,
                skipped_outcomes = parsed.skipped_outcomes,
                "skipped malformed feed entries"
            );
        }

        let db = self.db.clone();
        let settings = self.settings.clone();
        let batch = parsed.batch;
        let summary = blocking(move || db.apply_tick(&batch, &settings))
            .await
            .at_stage(Stage::Persist, ts)?;

        self.log_summary(&summary, started.elapsed());
        self.board.record_success(&summary).await;

        let n = self.committed.fetch_add(1, Ordering::Relaxed) + 1;
        if self.prune_every > 0 && n % self.prune_every == 0 {
            if let Err(e) = self.prune(ts).await {
                log_tick_error(&e);
            }
        }
        Ok(summary)
    }

    /// Both retention passes, outside any tick transaction.
    pub async fn prune(&self, now: i64) -> Result<PruneReport, TickError> {
        let db = self.db.clone();
        let settings = self.settings.clone();
        let report = blocking(move || db.prune(now, &settings))
            .await
            .at_stage(Stage::Prune, now)?;
        if report.total() > 0 {
            info!(
                events = report.events,
                odds = report.odds,
                history = report.history,
                results = report.results,
                closing_odds = report.closing_odds,
                "retention pass removed {} row(s)",
                report.total()
            );
        }
        Ok(report)
    }

    fn log_summary(&self, s: &TickSummary, elapsed: Duration) {
        let elapsed_ms = elapsed.as_millis() as u64;
        if self.verbose {
            info!(
                tick = s.tick,
                events = s.events,
                odds = s.odds,
                discovered = s.discovered,
                stale = s.stale,
                finished = s.finished,
                ignored = s.ignored,
                closing_rows = s.closing_rows,
                elapsed_ms,
                "tick committed"
            );
        } else {
            debug!(
                tick = s.tick,
                events = s.events,
                odds = s.odds,
                stale = s.stale,
                finished = s.finished,
                closing_rows = s.closing_rows,
                elapsed_ms,
                "tick committed"
            );
        }
    }

    /// Tick, logging and recording any failure. This is the loop body.
    pub async fn tick_logged(&self) -> Option<TickSummary> {
        match self.tick().await {
            Ok(s) => Some(s),
            Err(e) => {
                log_tick_error(&e);
                self.board.record_failure(&e).await;
                None
            }
        }
    }

    pub async fn run(&self, period: Duration, shutdown: watch::Receiver<bool>) {
        info!("Live poller using feed client '{}'", self.client.name());
        run_loop("live", period, shutdown, move || async move {
            self.tick_logged().await;
        })
        .await;
    }
}

/// Results ingester: one score-feed request per calendar date.
pub struct ResultsJob {
    client: Arc<dyn FeedClient>,
    db: Database,
    request: FeedRequest,
    filter: Arc<FeedFilter>,
    settings: StoreSettings,
    board: StatusBoard,
}

impl ResultsJob {
    pub fn new(
        client: Arc<dyn FeedClient>,
        db: Database,
        request: FeedRequest,
        filter: FeedFilter,
        settings: StoreSettings,
        board: StatusBoard,
    ) -> Self {
        ResultsJob {
            client,
            db,
            request,
            filter: Arc::new(filter),
            settings,
            board,
        }
    }

    /// Fetch, store and derive results for one date. Returns the number of
    /// result rows and derived rows written.
    pub async fn run_date(&self, date: NaiveDate) -> Result<(usize, usize), TickError> {
        let ts = now_ts();
        let request = self
            .request
            .with_param("date", date.format("%Y-%m-%d").to_string());
        let doc = self.client.fetch(&request).await.at_stage(Stage::Fetch, ts)?;
        check_shape(&doc).at_stage(Stage::Extract, ts)?;

        let records = results::extract_results(&doc, &self.filter);
        let derived: Vec<_> = records.iter().filter_map(results::derive).collect();

        let db = self.db.clone();
        let counts = blocking(move || db.store_results(&records, &derived, ts))
            .await
            .at_stage(Stage::Persist, ts)?;
        info!(
            date = %date,
            results = counts.0,
            derived = counts.1,
            "results stored"
        );
        Ok(counts)
    }

    /// Every date in `from..=to`; a failed date is logged and skipped.
    pub async fn backfill(&self, from: NaiveDate, to: NaiveDate) -> (usize, usize) {
        let mut ok = 0;
        let mut failed = 0;
        for date in from.iter_days().take_while(|d| *d <= to) {
            match self.run_date(date).await {
                Ok(_) => ok += 1,
                Err(e) => {
                    log_tick_error(&e);
                    failed += 1;
                }
            }
        }
        info!("Backfill {}..={} done: {} ok, {} failed", from, to, ok, failed);
        (ok, failed)
    }

    async fn poll_once(&self) {
        match self.run_date(Local::now().date_naive()).await {
            Ok((results, _)) => {
                self.board
                    .record_success(&TickSummary {
                        tick: now_ts(),
                        events: results,
                        ..Default::default()
                    })
                    .await;
            }
            Err(e) => {
                log_tick_error(&e);
                self.board.record_failure(&e).await;
                return;
            }
        }

        let now = now_ts();
        let db = self.db.clone();
        let retention = self.settings.results_retention;
        match blocking(move || db.prune_results(now, retention))
            .await
            .at_stage(Stage::Prune, now)
        {
            Ok(r) if r.total() > 0 => info!("results retention removed {} row(s)", r.total()),
            Ok(_) => {}
            Err(e) => log_tick_error(&e),
        }
    }

    pub async fn run(&self, period: Duration, shutdown: watch::Receiver<bool>) {
        run_loop("results", period, shutdown, move || self.poll_once()).await;
    }
}
