use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

use super::lifecycle::LifecycleState;
use super::models::{EventRecord, LineObservation, TickBatch, TickSummary};
use super::Database;
use crate::config::StoreSettings;

impl Database {
    /// Apply one tick as a single IMMEDIATE transaction: upsert events and
    /// current odds, append history, advance lifecycle for absent events and
    /// capture closing odds for the ones that finish. Any failure rolls the
    /// whole tick back.
    pub fn apply_tick(&self, batch: &TickBatch, settings: &StoreSettings) -> Result<TickSummary> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin tick transaction")?;
        let summary = apply_tick_tx(&tx, batch, settings)?;
        tx.commit().context("failed to commit tick")?;
        Ok(summary)
    }
}

fn apply_tick_tx(
    tx: &Transaction<'_>,
    batch: &TickBatch,
    settings: &StoreSettings,
) -> Result<TickSummary> {
    let ts = batch.observed_at;
    let mut summary = TickSummary {
        tick: ts,
        ..Default::default()
    };
    let mut present: HashSet<i64> = HashSet::new();
    let mut ignored: HashSet<i64> = HashSet::new();

    for event in &batch.events {
        let previous: Option<LifecycleState> = tx
            .query_row(
                "SELECT state FROM matches WHERE match_id = ?1",
                params![event.match_id],
                |r| r.get(0),
            )
            .optional()?;

        let Some(next) = previous
            .unwrap_or(LifecycleState::Discovered)
            .on_present()
        else {
            if ignored.insert(event.match_id) {
                debug!("match {} is finished; ignoring reappearance", event.match_id);
            }
            continue;
        };

        upsert_event(tx, event, next, ts)
            .with_context(|| format!("failed to upsert match {}", event.match_id))?;
        if present.insert(event.match_id) && previous.is_none() {
            summary.discovered += 1;
        }
    }
    summary.events = present.len();
    summary.ignored = ignored.len();

    {
        let mut upsert = tx.prepare_cached(
            "INSERT INTO market_odds (match_id, market_id, line_value, side, kf, marg, maximum, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
             ON CONFLICT(match_id, market_id, line_value, side) DO UPDATE SET
                kf=excluded.kf,
                marg=excluded.marg,
                maximum=excluded.maximum,
                updated_at=excluded.updated_at",
        )?;
        let mut append = tx.prepare_cached(
            "INSERT INTO market_odds_history (match_id, market_id, line_value, side, kf, marg, maximum, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
        )?;
        for obs in &batch.observations {
            if ignored.contains(&obs.match_id) {
                continue;
            }
            let row = observation_params(obs, ts);
            upsert.execute(row).with_context(|| {
                format!("failed to upsert odds {}/{}/{}", obs.match_id, obs.market_id, obs.side)
            })?;
            append.execute(row)?;
            summary.odds += 1;
        }
    }

    let finished = advance_absent(tx, &present, ts, settings.grace, &mut summary)?;

    if settings.capture_closing_odds {
        for match_id in &finished {
            summary.closing_rows += tx.execute(
                "INSERT OR IGNORE INTO closing_odds
                    (match_id, market_id, line_value, side, kf, marg, maximum, captured_at)
                 SELECT match_id, market_id, line_value, side, kf, marg, maximum, ?2
                 FROM market_odds WHERE match_id = ?1",
                params![match_id, ts],
            )?;
        }
    }

    Ok(summary)
}

fn upsert_event(
    tx: &Transaction<'_>,
    ev: &EventRecord,
    state: LifecycleState,
    ts: i64,
) -> rusqlite::Result<usize> {
    let s = &ev.summary;
    tx.prepare_cached(
        "INSERT INTO matches (
            match_id, tournament, table_id, start_ts, name_p1, name_p2,
            current_score, set_score, kf_p1, kf_p2, handicap_line, kf_f1, kf_f2,
            total_line, kf_tm, kf_tb, next_kf_p1, next_kf_p2,
            state, first_seen_at, last_seen_at, updated_at, missed_ticks, finished_at
         ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?20,?20,0,NULL)
         ON CONFLICT(match_id) DO UPDATE SET
            tournament=excluded.tournament,
            table_id=excluded.table_id,
            start_ts=excluded.start_ts,
            name_p1=excluded.name_p1,
            name_p2=excluded.name_p2,
            current_score=excluded.current_score,
            set_score=excluded.set_score,
            kf_p1=excluded.kf_p1,
            kf_p2=excluded.kf_p2,
            handicap_line=excluded.handicap_line,
            kf_f1=excluded.kf_f1,
            kf_f2=excluded.kf_f2,
            total_line=excluded.total_line,
            kf_tm=excluded.kf_tm,
            kf_tb=excluded.kf_tb,
            next_kf_p1=excluded.next_kf_p1,
            next_kf_p2=excluded.next_kf_p2,
            state=excluded.state,
            last_seen_at=excluded.last_seen_at,
            updated_at=excluded.updated_at,
            missed_ticks=0",
    )?
    .execute(params![
        ev.match_id,
        ev.tournament,
        ev.table_id,
        ev.start_ts,
        ev.name_p1,
        ev.name_p2,
        ev.current_score,
        ev.set_score,
        s.kf_p1,
        s.kf_p2,
        s.handicap_line,
        s.kf_f1,
        s.kf_f2,
        s.total_line,
        s.kf_tm,
        s.kf_tb,
        s.next_kf_p1,
        s.next_kf_p2,
        state,
        ts,
    ])
}

type ObservationRow<'a> = (i64, i64, f64, &'a str, f64, Option<f64>, Option<f64>, i64);

fn observation_params(obs: &LineObservation, ts: i64) -> ObservationRow<'_> {
    (
        obs.match_id,
        obs.market_id,
        obs.line_value,
        obs.side.as_str(),
        obs.kf,
        obs.marg,
        obs.maximum,
        ts,
    )
}

/// Move every live event missing from this tick along the state machine.
/// Rows already touched at `ts` are skipped so re-applying a tick is a no-op
/// for current state. Returns the ids that became finished.
fn advance_absent(
    tx: &Transaction<'_>,
    present: &HashSet<i64>,
    ts: i64,
    grace: Duration,
    summary: &mut TickSummary,
) -> Result<Vec<i64>> {
    let candidates: Vec<(i64, LifecycleState, i64)> = {
        let mut stmt = tx.prepare_cached(
            "SELECT match_id, state, last_seen_at FROM matches
             WHERE state != 'finished' AND updated_at < ?1",
        )?;
        let rows = stmt
            .query_map(params![ts], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };

    let mut finished = Vec::new();
    for (match_id, state, last_seen_at) in candidates {
        if present.contains(&match_id) {
            continue;
        }
        let absent_for = Duration::from_secs(ts.saturating_sub(last_seen_at).max(0) as u64);
        let next = state.on_absent(absent_for, grace);
        match next {
            s if s.is_terminal() => {
                tx.execute(
                    "UPDATE matches SET state=?2, finished_at=?3, updated_at=?3,
                        missed_ticks=missed_ticks+1
                     WHERE match_id=?1",
                    params![match_id, next, ts],
                )?;
                finished.push(match_id);
                summary.finished += 1;
            }
            _ => {
                tx.execute(
                    "UPDATE matches SET state=?2, updated_at=?3, missed_ticks=missed_ticks+1
                     WHERE match_id=?1",
                    params![match_id, next, ts],
                )?;
                if state != LifecycleState::Stale {
                    summary.stale += 1;
                }
            }
        }
    }
    Ok(finished)
}
