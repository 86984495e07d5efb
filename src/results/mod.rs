//! Finished-match results: extraction from the score feed and the derived
//! per-match statistics (set progression, comeback flag, estimated duration).

use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;
use serde_json::Value;

use crate::db::models::{MatchResult, ResultRecord};
use crate::feed::nested;
use crate::ingest::extractor::{event_id, FeedFilter};

/// At most this many sets are kept per match.
pub const MAX_SETS: usize = 5;

// Average seconds per rally, between rallies and between sets.
const RALLY_SECS: f64 = 3.8;
const BREAK_SECS: f64 = 7.8;
const SET_PAUSE_SECS: f64 = 32.5;
/// Duration at which a match counts as fully intense.
const FULL_INTENSITY_SECS: f64 = 900.0;

static SET_POINTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+):(\d+)").expect("valid set points pattern"));

/// Finished events on allowed tables. Only the table filter applies here;
/// the score feed does not repeat the live tournament label.
pub fn extract_results(doc: &Value, filter: &FeedFilter) -> Vec<ResultRecord> {
    let mut out = Vec::new();
    for ch in filter.championships(doc, false) {
        let Some(evts) = ch.value.get("evts") else {
            continue;
        };
        for entry in nested::entries(evts) {
            let Some(match_id) = event_id(&entry) else {
                continue;
            };
            let ev = entry.value;
            let Some(sc_ev) = nested::text_field(ev, &["sc_ev"]).filter(|s| s.contains(':')) else {
                continue;
            };
            out.push(ResultRecord {
                match_id,
                table_label: ch.table.clone(),
                player1: nested::text_field(ev, &["name_ht"]),
                player2: nested::text_field(ev, &["name_at"]),
                sc_ev,
                sc_ext_ev: nested::text_field(ev, &["sc_ext_ev"]),
                finished: ["finished", "date_ev"]
                    .iter()
                    .find_map(|f| ev.get(*f).and_then(timestamp)),
            });
        }
    }
    out
}

/// Unix seconds from a number, a numeric string or a `YYYY-MM-DD HH:MM:SS` string.
fn timestamp(v: &Value) -> Option<i64> {
    nested::integer(v).or_else(|| {
        let s = v.as_str()?.trim();
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .ok()
            .map(|dt| dt.and_utc().timestamp())
    })
}

/// Set count pair from a final score such as "3:1".
pub fn parse_sets(sc_ev: &str) -> Option<(u32, u32)> {
    let (a, b) = sc_ev.trim().split_once(':')?;
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|c| c.is_ascii_digit());
    if !digits(a) || !digits(b) {
        return None;
    }
    Some((a.parse().ok()?, b.parse().ok()?))
}

/// Per-set points, in order, capped at [`MAX_SETS`].
pub fn parse_set_points(sc_ext_ev: &str) -> Vec<(u32, u32)> {
    SET_POINTS
        .captures_iter(sc_ext_ev)
        .filter_map(|c| Some((c[1].parse().ok()?, c[2].parse().ok()?)))
        .take(MAX_SETS)
        .collect()
}

/// Running set score ("0:0 -> 1:0 -> ...") and whether the eventual winner
/// trailed at some set boundary.
pub fn progress_and_comeback(sets: &[(u32, u32)]) -> (String, bool) {
    let (mut p1, mut p2) = (0u32, 0u32);
    let mut steps = vec!["0:0".to_string()];
    let mut running = Vec::with_capacity(sets.len());
    for (a, b) in sets {
        if a > b {
            p1 += 1;
        } else {
            p2 += 1;
        }
        steps.push(format!("{}:{}", p1, p2));
        running.push((p1, p2));
    }
    let first_won = p1 > p2;
    let comeback = running
        .iter()
        .any(|(a, b)| if first_won { a < b } else { b < a });
    (steps.join(" -> "), comeback)
}

/// Estimated duration in seconds and intensity in [0, 1].
pub fn duration_and_intensity(sets: &[(u32, u32)]) -> (i64, f64) {
    let points: f64 = sets.iter().map(|(a, b)| f64::from(*a) + f64::from(*b)).sum();
    let played = sets.len() as f64;
    let secs = points * RALLY_SECS + (points - played) * BREAK_SECS + (played - 1.0) * SET_PAUSE_SECS;
    let duration = secs as i64;
    let intensity = if duration == 0 {
        0.0
    } else {
        (duration as f64 / FULL_INTENSITY_SECS).min(1.0)
    };
    (duration, intensity)
}

/// Derived outcome, or `None` when the final score or per-set points are missing.
pub fn derive(record: &ResultRecord) -> Option<MatchResult> {
    let (p1_sets, p2_sets) = parse_sets(&record.sc_ev)?;
    let sets = parse_set_points(record.sc_ext_ev.as_deref()?);
    if sets.is_empty() {
        return None;
    }
    let winner_id = if p1_sets > p2_sets { 1 } else { 2 };
    let (progress, comeback) = progress_and_comeback(&sets);
    let (duration_sec, match_intensity) = duration_and_intensity(&sets);
    Some(MatchResult {
        match_id: record.match_id,
        finished_ts: record.finished,
        p1_sets,
        p2_sets,
        winner_id,
        loser_id: 3 - winner_id,
        duration_sec,
        match_intensity,
        progress,
        comeback,
        sets,
    })
}
