use anyhow::{Context, Result};
use rusqlite::{params, Transaction, TransactionBehavior};
use std::time::Duration;

use super::models::PruneReport;
use super::Database;
use crate::config::StoreSettings;

impl Database {
    /// Run both retention passes, each in its own transaction.
    pub fn prune(&self, now: i64, settings: &StoreSettings) -> Result<PruneReport> {
        let live = self.prune_finished(now, settings.finished_retention)?;
        let results = self.prune_results(now, settings.results_retention)?;
        Ok(PruneReport {
            events: live.events,
            odds: live.odds,
            history: live.history,
            results: results.results,
            match_results: results.match_results,
            set_scores: results.set_scores,
            closing_odds: results.closing_odds,
        })
    }

    /// Delete finished events whose `finished_at` is older than the window,
    /// together with their current odds and history. Live events are never
    /// touched regardless of age.
    pub fn prune_finished(&self, now: i64, retention: Duration) -> Result<PruneReport> {
        let cutoff = cutoff(now, retention);
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let report = prune_finished_tx(&tx, cutoff)?;
        tx.commit().context("failed to commit finished-event prune")?;
        Ok(report)
    }

    /// Delete results (and their derived rows and closing odds) that finished
    /// before the window.
    pub fn prune_results(&self, now: i64, retention: Duration) -> Result<PruneReport> {
        let cutoff = cutoff(now, retention);
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let report = prune_results_tx(&tx, cutoff)?;
        tx.commit().context("failed to commit results prune")?;
        Ok(report)
    }
}

fn cutoff(now: i64, retention: Duration) -> i64 {
    now.saturating_sub(i64::try_from(retention.as_secs()).unwrap_or(i64::MAX))
}

const EXPIRED_EVENTS: &str =
    "SELECT match_id FROM matches WHERE state = 'finished' AND finished_at IS NOT NULL AND finished_at < ?1";

fn prune_finished_tx(tx: &Transaction<'_>, cutoff: i64) -> Result<PruneReport> {
    // Children first; the foreign keys would reject the parent delete otherwise.
    let history = tx.execute(
        &format!("DELETE FROM market_odds_history WHERE match_id IN ({})", EXPIRED_EVENTS),
        params![cutoff],
    )?;
    let odds = tx.execute(
        &format!("DELETE FROM market_odds WHERE match_id IN ({})", EXPIRED_EVENTS),
        params![cutoff],
    )?;
    let events = tx.execute(
        "DELETE FROM matches WHERE state = 'finished' AND finished_at IS NOT NULL AND finished_at < ?1",
        params![cutoff],
    )?;
    Ok(PruneReport {
        events,
        odds,
        history,
        ..Default::default()
    })
}

const EXPIRED_RESULTS: &str =
    "SELECT match_id FROM results WHERE finished IS NOT NULL AND finished < ?1";

fn prune_results_tx(tx: &Transaction<'_>, cutoff: i64) -> Result<PruneReport> {
    let set_scores = tx.execute(
        &format!("DELETE FROM set_scores WHERE match_id IN ({})", EXPIRED_RESULTS),
        params![cutoff],
    )?;
    let match_results = tx.execute(
        &format!("DELETE FROM match_results WHERE match_id IN ({})", EXPIRED_RESULTS),
        params![cutoff],
    )?;
    // Closing odds go with their result; rows that never got a result age out on their own.
    let closing_odds = tx.execute(
        &format!(
            "DELETE FROM closing_odds
             WHERE match_id IN ({})
                OR (captured_at < ?1 AND match_id NOT IN (SELECT match_id FROM results))",
            EXPIRED_RESULTS
        ),
        params![cutoff],
    )?;
    let results = tx.execute(
        "DELETE FROM results WHERE finished IS NOT NULL AND finished < ?1",
        params![cutoff],
    )?;
    Ok(PruneReport {
        results,
        match_results,
        set_scores,
        closing_odds,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::lifecycle::LifecycleState;
    use crate::db::models::{EventRecord, LineObservation, ResultRecord, TickBatch};

    fn settings() -> StoreSettings {
        StoreSettings {
            grace: Duration::ZERO,
            finished_retention: Duration::from_secs(600),
            results_retention: Duration::from_secs(86_400),
            capture_closing_odds: true,
        }
    }

    fn tick(db: &Database, ts: i64, ids: &[i64]) {
        let batch = TickBatch {
            observed_at: ts,
            events: ids.iter().map(|id| EventRecord::new(*id)).collect(),
            observations: ids
                .iter()
                .map(|id| LineObservation {
                    match_id: *id,
                    market_id: 72,
                    line_value: 74.5,
                    side: "Tb".into(),
                    kf: 1.85,
                    marg: None,
                    maximum: None,
                })
                .collect(),
        };
        db.apply_tick(&batch, &settings()).unwrap();
    }

    #[test]
    fn test_live_events_survive_any_age() {
        let db = Database::open_in_memory().unwrap();
        tick(&db, 100, &[1, 2]);
        tick(&db, 101, &[1]);
        tick(&db, 102, &[1]);
        assert_eq!(db.get_event(2).unwrap().unwrap().state, LifecycleState::Finished);

        let report = db.prune_finished(1_000_000, Duration::from_secs(600)).unwrap();
        assert_eq!(report.events, 1);
        assert_eq!(report.odds, 1);
        assert_eq!(report.history, 1);

        assert!(db.get_event(2).unwrap().is_none());
        assert_eq!(db.get_event(1).unwrap().unwrap().state, LifecycleState::Active);
        assert_eq!(db.current_odds(1).unwrap().len(), 1);
        assert_eq!(db.history_len(Some(1)).unwrap(), 3);
    }

    #[test]
    fn test_recently_finished_are_kept() {
        let db = Database::open_in_memory().unwrap();
        tick(&db, 100, &[1]);
        tick(&db, 101, &[]);
        tick(&db, 102, &[]);
        let report = db.prune_finished(300, Duration::from_secs(600)).unwrap();
        assert_eq!(report.total(), 0);
        assert!(db.get_event(1).unwrap().is_some());
    }

    #[test]
    fn test_closing_odds_outlive_live_prune() {
        let db = Database::open_in_memory().unwrap();
        tick(&db, 100, &[1]);
        tick(&db, 101, &[]);
        tick(&db, 102, &[]);
        db.prune_finished(10_000, Duration::from_secs(600)).unwrap();
        assert!(db.get_event(1).unwrap().is_none());
        assert_eq!(db.closing_odds(1).unwrap().len(), 1);

        let report = db.prune_results(10_000 + 86_400, Duration::from_secs(86_400)).unwrap();
        assert_eq!(report.closing_odds, 1);
        assert!(db.closing_odds(1).unwrap().is_empty());
    }

    #[test]
    fn test_results_prune_in_dependency_order() {
        let db = Database::open_in_memory().unwrap();
        let old = ResultRecord {
            match_id: 5,
            table_label: "A3".into(),
            player1: Some("A".into()),
            player2: Some("B".into()),
            sc_ev: "3:1".into(),
            sc_ext_ev: Some("11:7, 9:11, 11:5, 11:8".into()),
            finished: Some(1_000),
        };
        let fresh = ResultRecord {
            match_id: 6,
            finished: Some(200_000),
            ..old.clone()
        };
        let records = vec![old, fresh];
        let derived: Vec<_> = records
            .iter()
            .filter_map(crate::results::derive)
            .collect();
        db.store_results(&records, &derived, 200_000).unwrap();

        let report = db.prune(200_000, &settings()).unwrap();
        assert_eq!(report.results, 1);
        assert_eq!(report.match_results, 1);
        assert_eq!(report.set_scores, 4);
        assert_eq!(db.result_count().unwrap(), 1);
    }
}
