use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, ValueEnum};
use regex::Regex;

use crate::feed::FeedRequest;
use crate::ingest::resolver::LineResolver;
use crate::ingest::{FeedFilter, MarketRules};

/// Line / live odds ingester for the Liga Pro table-tennis tables
#[derive(Parser, Debug, Clone)]
#[command(name = "line-ingest", version, about)]
pub struct Config {
    /// Create or patch the schema and exit
    #[arg(long)]
    pub create_tables: bool,

    /// Run exactly one live tick and exit
    #[arg(long)]
    pub fetch_once: bool,

    /// Run the live polling loop until interrupted
    #[arg(long)]
    pub live_poll: bool,

    /// Run both retention passes once and exit
    #[arg(long)]
    pub prune: bool,

    /// Ingest results for one date (today unless --date is given) and exit
    #[arg(long)]
    pub results_once: bool,

    /// Run the results polling loop until interrupted
    #[arg(long)]
    pub results_poll: bool,

    /// Date for --results-once (YYYY-MM-DD)
    #[arg(long)]
    pub date: Option<NaiveDate>,

    /// First date of a results backfill (YYYY-MM-DD)
    #[arg(long, requires = "to_date")]
    pub from_date: Option<NaiveDate>,

    /// Last date of a results backfill (YYYY-MM-DD, inclusive)
    #[arg(long, requires = "from_date")]
    pub to_date: Option<NaiveDate>,

    /// Log a structured summary for every tick
    #[arg(long, short, env = "VERBOSE", default_value = "false")]
    pub verbose: bool,

    /// SQLite database path
    #[arg(long, env = "BETCITY_DB_PATH", default_value = "betcity_results.db")]
    pub database_path: String,

    /// How long a writer waits on a locked database before failing (ms)
    #[arg(long, env = "DB_BUSY_TIMEOUT_MS", default_value = "3000")]
    pub busy_timeout_ms: u64,

    /// Live feed endpoint
    #[arg(
        long,
        env = "LIVE_SOURCE_URL",
        default_value = "https://ad.betcity.ru/d/on_air/bets"
    )]
    pub feed_url: String,

    /// Feed `rev` query parameter
    #[arg(long, env = "LIVE_REV", default_value = "8")]
    pub feed_rev: String,

    /// Feed `ver` query parameter
    #[arg(long, env = "LIVE_VER", default_value = "39")]
    pub feed_ver: String,

    /// Feed `csn` session parameter
    #[arg(long, env = "LIVE_CSN", default_value = "ooca9s")]
    pub feed_csn: String,

    /// Extra query pairs for the live feed (key=value, comma separated)
    #[arg(long, env = "LIVE_EXTRA", value_delimiter = ',', default_value = "add=dep_event")]
    pub feed_extra: Vec<String>,

    /// Results feed endpoint
    #[arg(long, env = "RESULTS_SOURCE_URL", default_value = "https://ad.betcity.ru/d/score")]
    pub results_url: String,

    /// Results feed `rev` query parameter
    #[arg(long, env = "RESULTS_REV", default_value = "5")]
    pub results_rev: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_TIMEOUT_SECS", default_value = "20")]
    pub http_timeout_secs: u64,

    /// User-Agent sent to the feed
    #[arg(long, env = "FEED_USER_AGENT", default_value = "LineIngest/0.3")]
    pub user_agent: String,

    /// Sport identifier kept from the feed
    #[arg(long, env = "SPORT_ID", default_value = "46")]
    pub sport_id: String,

    /// Case-insensitive tournament label pattern
    #[arg(long, env = "TOURNAMENT_PATTERN", default_value = r"Лига\s+Про\.\s*Мужчины")]
    pub tournament_pattern: String,

    /// Word that precedes the table code in a championship label
    #[arg(long, env = "TABLE_MARKER", default_value = "Стол")]
    pub table_marker: String,

    /// Venue tables to keep (comma separated)
    #[arg(long, env = "TABLES", value_delimiter = ',', default_value = "A3,A4,A5,A6,A9")]
    pub tables: Vec<String>,

    /// Market ids to process (comma separated)
    #[arg(
        long,
        env = "MARKETS",
        value_delimiter = ',',
        default_value = "69,71,72,112,882,122,126,84"
    )]
    pub markets: Vec<u32>,

    /// Market ids priced as signed handicaps
    #[arg(long, env = "HANDICAP_MARKETS", value_delimiter = ',', default_value = "71")]
    pub handicap_markets: Vec<u32>,

    /// Market ids priced as over/under totals
    #[arg(
        long,
        env = "TOTAL_MARKETS",
        value_delimiter = ',',
        default_value = "72,112,122,126,84"
    )]
    pub total_markets: Vec<u32>,

    /// Which handicap side goes negative when both moneyline prices are equal
    #[arg(long, env = "HANDICAP_TIE_BREAK", value_enum, default_value = "first-negative")]
    pub handicap_tie_break: TieBreak,

    /// Live polling interval in seconds
    #[arg(long, env = "POLL_SEC", default_value = "2")]
    pub poll_interval: u64,

    /// Results polling interval in seconds
    #[arg(long, env = "RESULTS_POLL_SEC", default_value = "60")]
    pub results_poll_interval: u64,

    /// Seconds an event may be missing from the feed before it is finished
    #[arg(long, env = "GRACE_SECS", default_value = "60")]
    pub grace_secs: u64,

    /// Seconds a finished event's live rows are kept
    #[arg(long, env = "FINISHED_RETENTION_SECS", default_value = "600")]
    pub finished_retention_secs: u64,

    /// Days results and closing odds are kept
    #[arg(long, env = "RESULTS_RETENTION_DAYS", default_value = "360")]
    pub results_retention_days: u64,

    /// Copy the last current odds into closing_odds when an event finishes
    #[arg(long, env = "CAPTURE_CLOSING_ODDS", default_value = "true", action = clap::ArgAction::Set)]
    pub capture_closing_odds: bool,

    /// Run the retention pass after every N successful live ticks (0 disables)
    #[arg(long, env = "PRUNE_EVERY", default_value = "1")]
    pub prune_every: u64,

    /// Optional status endpoint address (e.g. 127.0.0.1:8088)
    #[arg(long, env = "STATUS_ADDR")]
    pub status_addr: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TieBreak {
    /// The first side (F1) takes the negative handicap
    FirstNegative,
    /// The second side (F2) takes the negative handicap
    SecondNegative,
}

/// What the process was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    CreateTables,
    FetchOnce,
    LivePoll,
    Prune,
    ResultsOnce(Option<NaiveDate>),
    ResultsBackfill { from: NaiveDate, to: NaiveDate },
    ResultsPoll,
}

/// Store-side knobs shared by the tick and retention passes.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub grace: Duration,
    pub finished_retention: Duration,
    pub results_retention: Duration,
    pub capture_closing_odds: bool,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        let modes = [
            self.create_tables,
            self.fetch_once,
            self.live_poll,
            self.prune,
            self.results_once,
            self.results_poll,
            self.from_date.is_some(),
        ];
        match modes.iter().filter(|m| **m).count() {
            0 => anyhow::bail!(
                "nothing to do: pass one of --create-tables, --fetch-once, --live-poll, --prune, \
                 --results-once, --results-poll or --from-date/--to-date"
            ),
            1 => {}
            _ => anyhow::bail!("run modes are mutually exclusive; pass exactly one"),
        }
        if let (Some(from), Some(to)) = (self.from_date, self.to_date) {
            if from > to {
                anyhow::bail!("--from-date {} is after --to-date {}", from, to);
            }
        }
        if self.poll_interval == 0 || self.results_poll_interval == 0 {
            anyhow::bail!("poll intervals must be at least one second");
        }
        if self.tables.iter().all(|t| t.trim().is_empty()) {
            anyhow::bail!("at least one table code is required");
        }
        if self.markets.is_empty() {
            anyhow::bail!("at least one market id is required");
        }
        if self.table_marker.trim().is_empty() {
            anyhow::bail!("table_marker must not be empty");
        }
        url::Url::parse(&self.feed_url).context("feed_url is not a valid URL")?;
        url::Url::parse(&self.results_url).context("results_url is not a valid URL")?;
        self.feed_extra_pairs()?;
        self.feed_filter()?;
        self.market_rules()?;
        Ok(())
    }

    pub fn mode(&self) -> RunMode {
        if self.create_tables {
            RunMode::CreateTables
        } else if self.fetch_once {
            RunMode::FetchOnce
        } else if self.live_poll {
            RunMode::LivePoll
        } else if self.prune {
            RunMode::Prune
        } else if self.results_once {
            RunMode::ResultsOnce(self.date)
        } else if let (Some(from), Some(to)) = (self.from_date, self.to_date) {
            RunMode::ResultsBackfill { from, to }
        } else {
            RunMode::ResultsPoll
        }
    }

    /// Compile the championship filter; an invalid pattern is a startup error.
    pub fn feed_filter(&self) -> anyhow::Result<FeedFilter> {
        let tournament = Regex::new(&format!("(?i){}", self.tournament_pattern))
            .with_context(|| format!("invalid tournament pattern {:?}", self.tournament_pattern))?;
        FeedFilter::new(
            self.sport_id.trim(),
            tournament,
            self.table_marker.trim(),
            self.tables.iter().map(|t| t.trim().to_uppercase()).filter(|t| !t.is_empty()),
        )
    }

    pub fn market_rules(&self) -> anyhow::Result<MarketRules> {
        Ok(MarketRules {
            allowed: self.markets.iter().copied().collect::<HashSet<_>>(),
            resolver: LineResolver::new(
                self.handicap_markets.iter().copied().collect(),
                self.total_markets.iter().copied().collect(),
                self.handicap_tie_break,
            )?,
        })
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            grace: Duration::from_secs(self.grace_secs),
            finished_retention: Duration::from_secs(self.finished_retention_secs),
            results_retention: Duration::from_secs(self.results_retention_days * 24 * 60 * 60),
            capture_closing_odds: self.capture_closing_odds,
        }
    }

    pub fn live_request(&self) -> anyhow::Result<FeedRequest> {
        let mut params = vec![
            ("rev".to_string(), self.feed_rev.clone()),
            ("ver".to_string(), self.feed_ver.clone()),
            ("csn".to_string(), self.feed_csn.clone()),
        ];
        params.extend(self.feed_extra_pairs()?);
        Ok(FeedRequest::new(&self.feed_url, params))
    }

    /// Score feed request without its `date` pair; the results job adds one per day.
    pub fn results_request(&self) -> FeedRequest {
        FeedRequest::new(
            &self.results_url,
            vec![
                ("rev".to_string(), self.results_rev.clone()),
                ("ver".to_string(), self.feed_ver.clone()),
                ("csn".to_string(), self.feed_csn.clone()),
            ],
        )
    }

    fn feed_extra_pairs(&self) -> anyhow::Result<Vec<(String, String)>> {
        self.feed_extra
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|pair| {
                pair.split_once('=')
                    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                    .with_context(|| format!("feed_extra entry {:?} is not key=value", pair))
            })
            .collect()
    }
}
