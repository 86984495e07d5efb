use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, TransactionBehavior};

use super::models::{MatchResult, ResultRecord};
use super::Database;

impl Database {
    /// Upsert raw results and their derived rows in one transaction.
    /// Set scores are insert-if-absent; everything else is overwritten.
    /// Returns (results written, derived rows written).
    pub fn store_results(
        &self,
        records: &[ResultRecord],
        derived: &[MatchResult],
        now: i64,
    ) -> Result<(usize, usize)> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut upsert = tx.prepare_cached(
                "INSERT INTO results (match_id, table_label, player1, player2, sc_ev, sc_ext_ev, finished)
                 VALUES (?1,?2,?3,?4,?5,?6,?7)
                 ON CONFLICT(match_id) DO UPDATE SET
                    table_label=excluded.table_label,
                    player1=excluded.player1,
                    player2=excluded.player2,
                    sc_ev=excluded.sc_ev,
                    sc_ext_ev=excluded.sc_ext_ev,
                    finished=excluded.finished",
            )?;
            for r in records {
                upsert
                    .execute(params![
                        r.match_id,
                        r.table_label,
                        r.player1,
                        r.player2,
                        r.sc_ev,
                        r.sc_ext_ev,
                        r.finished
                    ])
                    .with_context(|| format!("failed to upsert result {}", r.match_id))?;
            }

            let mut upsert_derived = tx.prepare_cached(
                "INSERT INTO match_results
                    (match_id, finished_ts, p1_sets, p2_sets, winner_id, loser_id,
                     duration_sec, match_intensity, progress, comeback, created_at, updated_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?11)
                 ON CONFLICT(match_id) DO UPDATE SET
                    finished_ts=excluded.finished_ts,
                    p1_sets=excluded.p1_sets,
                    p2_sets=excluded.p2_sets,
                    winner_id=excluded.winner_id,
                    loser_id=excluded.loser_id,
                    duration_sec=excluded.duration_sec,
                    match_intensity=excluded.match_intensity,
                    progress=excluded.progress,
                    comeback=excluded.comeback,
                    updated_at=excluded.updated_at",
            )?;
            let mut insert_set = tx.prepare_cached(
                "INSERT OR IGNORE INTO set_scores (match_id, set_no, p1_pts, p2_pts)
                 VALUES (?1,?2,?3,?4)",
            )?;
            for m in derived {
                upsert_derived
                    .execute(params![
                        m.match_id,
                        m.finished_ts,
                        m.p1_sets,
                        m.p2_sets,
                        m.winner_id,
                        m.loser_id,
                        m.duration_sec,
                        m.match_intensity,
                        m.progress,
                        m.comeback,
                        now
                    ])
                    .with_context(|| format!("failed to upsert match result {}", m.match_id))?;
                for (i, (p1, p2)) in m.sets.iter().enumerate() {
                    insert_set.execute(params![m.match_id, i as i64 + 1, p1, p2])?;
                }
            }
        }
        tx.commit().context("failed to commit results")?;
        Ok((records.len(), derived.len()))
    }

    #[cfg(test)]
    pub fn result_count(&self) -> Result<i64> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM results", [], |r| r.get(0))?)
    }

    /// Derived outcome for one match, with its set scores.
    pub fn match_result(&self, match_id: i64) -> Result<Option<MatchResult>> {
        let conn = self.lock()?;
        let head = conn
            .query_row(
                "SELECT match_id, finished_ts, p1_sets, p2_sets, winner_id, loser_id,
                        duration_sec, match_intensity, progress, comeback
                 FROM match_results WHERE match_id = ?1",
                params![match_id],
                |row| {
                    Ok(MatchResult {
                        match_id: row.get(0)?,
                        finished_ts: row.get(1)?,
                        p1_sets: row.get(2)?,
                        p2_sets: row.get(3)?,
                        winner_id: row.get(4)?,
                        loser_id: row.get(5)?,
                        duration_sec: row.get(6)?,
                        match_intensity: row.get(7)?,
                        progress: row.get(8)?,
                        comeback: row.get(9)?,
                        sets: Vec::new(),
                    })
                },
            )
            .optional()?;
        let Some(mut result) = head else {
            return Ok(None);
        };
        let mut stmt =
            conn.prepare("SELECT p1_pts, p2_pts FROM set_scores WHERE match_id = ?1 ORDER BY set_no")?;
        result.sets = stmt
            .query_map(params![match_id], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Some(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn record(id: i64, sc_ev: &str, ext: &str) -> ResultRecord {
        ResultRecord {
            match_id: id,
            table_label: "A4".into(),
            player1: Some("Sidorov".into()),
            player2: Some("Kuznetsov".into()),
            sc_ev: sc_ev.into(),
            sc_ext_ev: Some(ext.into()),
            finished: Some(1_700_000_000),
        }
    }

    #[test]
    fn test_store_and_read_back() {
        let db = Database::open_in_memory().unwrap();
        let records = vec![record(11, "1:3", "11:9, 5:11, 8:11, 7:11")];
        let derived: Vec<_> = records.iter().filter_map(crate::results::derive).collect();
        assert_eq!(db.store_results(&records, &derived, 1).unwrap(), (1, 1));

        let m = db.match_result(11).unwrap().unwrap();
        assert_eq!((m.p1_sets, m.p2_sets), (1, 3));
        assert_eq!(m.winner_id, 2);
        assert!(m.comeback);
        assert_eq!(m.sets, vec![(11, 9), (5, 11), (8, 11), (7, 11)]);
        assert_relative_eq!(m.match_intensity, derived[0].match_intensity);
    }

    #[test]
    fn test_restore_updates_result_but_keeps_first_set_scores() {
        let db = Database::open_in_memory().unwrap();
        let first = vec![record(12, "3:0", "11:1, 11:2, 11:3")];
        let d1: Vec<_> = first.iter().filter_map(crate::results::derive).collect();
        db.store_results(&first, &d1, 1).unwrap();

        let second = vec![record(12, "3:0", "11:9, 11:9, 11:9")];
        let d2: Vec<_> = second.iter().filter_map(crate::results::derive).collect();
        db.store_results(&second, &d2, 2).unwrap();

        let m = db.match_result(12).unwrap().unwrap();
        assert_eq!(m.duration_sec, d2[0].duration_sec);
        assert_eq!(m.sets, vec![(11, 1), (11, 2), (11, 3)]);
        assert_eq!(db.result_count().unwrap(), 1);
    }

    #[test]
    fn test_unknown_match_has_no_result() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.match_result(404).unwrap().is_none());
    }
}
