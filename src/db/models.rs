use serde::{Deserialize, Serialize};

use super::lifecycle::LifecycleState;

/// Prices lifted from the main markets onto the event row so downstream
/// jobs can read a match's headline line without touching the odds tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketSummary {
    pub kf_p1: Option<f64>,
    pub kf_p2: Option<f64>,
    pub handicap_line: Option<f64>,
    pub kf_f1: Option<f64>,
    pub kf_f2: Option<f64>,
    pub total_line: Option<f64>,
    pub kf_tm: Option<f64>,
    pub kf_tb: Option<f64>,
    pub next_kf_p1: Option<f64>,
    pub next_kf_p2: Option<f64>,
}

/// One tracked match as extracted from a single feed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub match_id: i64,
    pub tournament: Option<String>,
    /// Normalised venue table code, e.g. "A3"
    pub table_id: Option<String>,
    /// Scheduled start (unix seconds)
    pub start_ts: Option<i64>,
    pub name_p1: Option<String>,
    pub name_p2: Option<String>,
    pub current_score: Option<String>,
    pub set_score: Option<String>,
    pub summary: MarketSummary,
}

impl EventRecord {
    pub fn new(match_id: i64) -> Self {
        EventRecord {
            match_id,
            tournament: None,
            table_id: None,
            start_ts: None,
            name_p1: None,
            name_p2: None,
            current_score: None,
            set_score: None,
            summary: MarketSummary::default(),
        }
    }
}

/// Current-state event row as persisted, with lifecycle bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    #[serde(flatten)]
    pub record: EventRecord,
    pub state: LifecycleState,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
    pub updated_at: i64,
    pub missed_ticks: i64,
    pub finished_at: Option<i64>,
}

/// One priced outcome of one market block at one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineObservation {
    pub match_id: i64,
    pub market_id: i64,
    /// Signed handicap or unsigned total; 0.0 for markets without a line
    pub line_value: f64,
    /// Outcome label as the feed names it ("Tb", "KF_F1", "P1", ...)
    pub side: String,
    /// Decimal odds
    pub kf: f64,
    pub marg: Option<f64>,
    /// Maximum stake accepted
    pub maximum: Option<f64>,
}

/// Everything one tick produced; all rows share `observed_at`.
#[derive(Debug, Clone, Default)]
pub struct TickBatch {
    pub observed_at: i64,
    pub events: Vec<EventRecord>,
    pub observations: Vec<LineObservation>,
}

/// Counts reported for a committed tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub tick: i64,
    pub events: usize,
    pub odds: usize,
    pub discovered: usize,
    pub stale: usize,
    pub finished: usize,
    /// Present in the feed but already finished; left untouched
    pub ignored: usize,
    pub closing_rows: usize,
}

/// Closing price captured when an event finished.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClosingOdds {
    pub match_id: i64,
    pub market_id: i64,
    pub line_value: f64,
    pub side: String,
    pub kf: f64,
    pub marg: Option<f64>,
    pub maximum: Option<f64>,
    pub captured_at: i64,
}

/// Rows deleted by one retention pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub events: usize,
    pub odds: usize,
    pub history: usize,
    pub results: usize,
    pub match_results: usize,
    pub set_scores: usize,
    pub closing_odds: usize,
}

impl PruneReport {
    pub fn total(&self) -> usize {
        self.events
            + self.odds
            + self.history
            + self.results
            + self.match_results
            + self.set_scores
            + self.closing_odds
    }
}

/// A finished match from the results feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub match_id: i64,
    pub table_label: String,
    pub player1: Option<String>,
    pub player2: Option<String>,
    /// Set score, e.g. "3:1"
    pub sc_ev: String,
    /// Per-set points, e.g. "11:7, 9:11, 11:5, 11:8"
    pub sc_ext_ev: Option<String>,
    /// Finish (or scheduled) time, unix seconds
    pub finished: Option<i64>,
}

/// Normalised outcome derived from a [`ResultRecord`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub match_id: i64,
    pub finished_ts: Option<i64>,
    pub p1_sets: u32,
    pub p2_sets: u32,
    /// 1 or 2
    pub winner_id: u8,
    pub loser_id: u8,
    pub duration_sec: i64,
    pub match_intensity: f64,
    /// "0:0 -> 1:0 -> 1:1 -> ..."
    pub progress: String,
    pub comeback: bool,
    /// (p1_pts, p2_pts) per set, in order
    pub sets: Vec<(u32, u32)>,
}
