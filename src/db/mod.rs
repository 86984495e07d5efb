use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::info;

pub mod lifecycle;
pub mod models;
mod results;
mod retention;
mod tick;

use lifecycle::LifecycleState;
use models::*;

/// Shared SQLite handle (single connection behind a mutex).
///
/// The database runs in WAL mode so the analytics jobs can read a consistent
/// snapshot while a tick is being written; writers wait up to the configured
/// busy timeout for a competing lock instead of failing at once.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to configure sqlite pragmas")?;
        conn.busy_timeout(busy_timeout)?;
        Self::from_connection(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection mutex poisoned"))
    }

    /// Create missing tables and patch missing columns (idempotent)
    pub fn run_migrations(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema")?;
        let added = ensure_columns(&conn, "matches", MATCH_COLUMNS)?;
        if added > 0 {
            info!("Patched {} missing column(s) on matches", added);
        }
        conn.execute_batch(INDEX_SQL)
            .context("failed to create indexes")?;
        Ok(())
    }

    // ── Current-state events ──────────────────────────────────────────────────

    pub fn get_event(&self, match_id: i64) -> Result<Option<StoredEvent>> {
        let conn = self.lock()?;
        let event = conn
            .query_row(
                &format!("SELECT {} FROM matches WHERE match_id = ?1", EVENT_SELECT),
                params![match_id],
                map_event,
            )
            .optional()?;
        Ok(event)
    }

    /// List events, newest activity first, optionally filtered by state
    pub fn list_events(&self, state: Option<LifecycleState>, limit: i64) -> Result<Vec<StoredEvent>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM matches
             WHERE (?1 IS NULL OR state = ?1)
             ORDER BY last_seen_at DESC, match_id LIMIT ?2",
            EVENT_SELECT
        );
        let mut stmt = conn.prepare(&sql)?;
        let events = stmt
            .query_map(params![state, limit], map_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    // ── Odds ──────────────────────────────────────────────────────────────────

    /// Current odds for one event, ordered by market, line and side
    pub fn current_odds(&self, match_id: i64) -> Result<Vec<LineObservation>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT match_id, market_id, line_value, side, kf, marg, maximum
             FROM market_odds WHERE match_id = ?1
             ORDER BY market_id, line_value, side",
        )?;
        let rows = stmt
            .query_map(params![match_id], map_observation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Number of history rows, for one event or overall
    pub fn history_len(&self, match_id: Option<i64>) -> Result<i64> {
        let conn = self.lock()?;
        let n = conn.query_row(
            "SELECT COUNT(*) FROM market_odds_history WHERE (?1 IS NULL OR match_id = ?1)",
            params![match_id],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    pub fn closing_odds(&self, match_id: i64) -> Result<Vec<ClosingOdds>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT match_id, market_id, line_value, side, kf, marg, maximum, captured_at
             FROM closing_odds WHERE match_id = ?1
             ORDER BY market_id, line_value, side",
        )?;
        let rows = stmt
            .query_map(params![match_id], |row| {
                Ok(ClosingOdds {
                    match_id: row.get(0)?,
                    market_id: row.get(1)?,
                    line_value: row.get(2)?,
                    side: row.get(3)?,
                    kf: row.get(4)?,
                    marg: row.get(5)?,
                    maximum: row.get(6)?,
                    captured_at: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

const EVENT_SELECT: &str = "match_id, tournament, table_id, start_ts, name_p1, name_p2,
    current_score, set_score, kf_p1, kf_p2, handicap_line, kf_f1, kf_f2,
    total_line, kf_tm, kf_tb, next_kf_p1, next_kf_p2,
    state, first_seen_at, last_seen_at, updated_at, missed_ticks, finished_at";

fn map_event(row: &rusqlite::Row) -> rusqlite::Result<StoredEvent> {
    Ok(StoredEvent {
        record: EventRecord {
            match_id: row.get(0)?,
            tournament: row.get(1)?,
            table_id: row.get(2)?,
            start_ts: row.get(3)?,
            name_p1: row.get(4)?,
            name_p2: row.get(5)?,
            current_score: row.get(6)?,
            set_score: row.get(7)?,
            summary: MarketSummary {
                kf_p1: row.get(8)?,
                kf_p2: row.get(9)?,
                handicap_line: row.get(10)?,
                kf_f1: row.get(11)?,
                kf_f2: row.get(12)?,
                total_line: row.get(13)?,
                kf_tm: row.get(14)?,
                kf_tb: row.get(15)?,
                next_kf_p1: row.get(16)?,
                next_kf_p2: row.get(17)?,
            },
        },
        state: row.get(18)?,
        first_seen_at: row.get(19)?,
        last_seen_at: row.get(20)?,
        updated_at: row.get(21)?,
        missed_ticks: row.get(22)?,
        finished_at: row.get(23)?,
    })
}

fn map_observation(row: &rusqlite::Row) -> rusqlite::Result<LineObservation> {
    Ok(LineObservation {
        match_id: row.get(0)?,
        market_id: row.get(1)?,
        line_value: row.get(2)?,
        side: row.get(3)?,
        kf: row.get(4)?,
        marg: row.get(5)?,
        maximum: row.get(6)?,
    })
}

/// Add any column in `expected` that an older database is missing.
fn ensure_columns(conn: &Connection, table: &str, expected: &[(&str, &str)]) -> Result<usize> {
    let existing = {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<std::collections::HashSet<_>>>()?;
        names
    };
    let mut added = 0;
    for (column, decl) in expected {
        if !existing.contains(*column) {
            conn.execute_batch(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl))
                .with_context(|| format!("failed to add {}.{}", table, column))?;
            added += 1;
        }
    }
    Ok(added)
}

/// Columns a matches table must carry; older files are patched on startup.
const MATCH_COLUMNS: &[(&str, &str)] = &[
    ("tournament", "TEXT"),
    ("table_id", "TEXT"),
    ("start_ts", "INTEGER"),
    ("name_p1", "TEXT"),
    ("name_p2", "TEXT"),
    ("current_score", "TEXT"),
    ("set_score", "TEXT"),
    ("kf_p1", "REAL"),
    ("kf_p2", "REAL"),
    ("handicap_line", "REAL"),
    ("kf_f1", "REAL"),
    ("kf_f2", "REAL"),
    ("total_line", "REAL"),
    ("kf_tm", "REAL"),
    ("kf_tb", "REAL"),
    ("next_kf_p1", "REAL"),
    ("next_kf_p2", "REAL"),
    ("state", "TEXT NOT NULL DEFAULT 'discovered'"),
    ("first_seen_at", "INTEGER NOT NULL DEFAULT 0"),
    ("last_seen_at", "INTEGER NOT NULL DEFAULT 0"),
    ("updated_at", "INTEGER NOT NULL DEFAULT 0"),
    ("missed_ticks", "INTEGER NOT NULL DEFAULT 0"),
    ("finished_at", "INTEGER"),
];

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS matches (
    match_id      INTEGER PRIMARY KEY,
    tournament    TEXT,
    table_id      TEXT,
    start_ts      INTEGER,
    name_p1       TEXT,
    name_p2       TEXT,
    current_score TEXT,
    set_score     TEXT,
    kf_p1         REAL,
    kf_p2         REAL,
    handicap_line REAL,
    kf_f1         REAL,
    kf_f2         REAL,
    total_line    REAL,
    kf_tm         REAL,
    kf_tb         REAL,
    next_kf_p1    REAL,
    next_kf_p2    REAL,
    state         TEXT    NOT NULL DEFAULT 'discovered',
    first_seen_at INTEGER NOT NULL,
    last_seen_at  INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL,
    missed_ticks  INTEGER NOT NULL DEFAULT 0,
    finished_at   INTEGER
);

CREATE TABLE IF NOT EXISTS market_odds (
    match_id   INTEGER NOT NULL,
    market_id  INTEGER NOT NULL,
    line_value REAL    NOT NULL,
    side       TEXT    NOT NULL,
    kf         REAL    NOT NULL,
    marg       REAL,
    maximum    REAL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (match_id, market_id, line_value, side),
    FOREIGN KEY (match_id) REFERENCES matches(match_id)
);

CREATE TABLE IF NOT EXISTS market_odds_history (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    match_id   INTEGER NOT NULL,
    market_id  INTEGER NOT NULL,
    line_value REAL    NOT NULL,
    side       TEXT    NOT NULL,
    kf         REAL    NOT NULL,
    marg       REAL,
    maximum    REAL,
    updated_at INTEGER NOT NULL,
    FOREIGN KEY (match_id) REFERENCES matches(match_id)
);

CREATE TABLE IF NOT EXISTS closing_odds (
    match_id    INTEGER NOT NULL,
    market_id   INTEGER NOT NULL,
    line_value  REAL    NOT NULL,
    side        TEXT    NOT NULL,
    kf          REAL    NOT NULL,
    marg        REAL,
    maximum     REAL,
    captured_at INTEGER NOT NULL,
    PRIMARY KEY (match_id, market_id, line_value, side)
);

CREATE TABLE IF NOT EXISTS results (
    match_id    INTEGER PRIMARY KEY,
    table_label TEXT,
    player1     TEXT,
    player2     TEXT,
    sc_ev       TEXT,
    sc_ext_ev   TEXT,
    finished    INTEGER
);

CREATE TABLE IF NOT EXISTS match_results (
    match_id        INTEGER PRIMARY KEY,
    finished_ts     INTEGER,
    p1_sets         INTEGER,
    p2_sets         INTEGER,
    winner_id       INTEGER,
    loser_id        INTEGER,
    duration_sec    INTEGER,
    match_intensity REAL,
    progress        TEXT,
    comeback        INTEGER,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL,
    FOREIGN KEY (match_id) REFERENCES results(match_id)
);

CREATE TABLE IF NOT EXISTS set_scores (
    match_id INTEGER NOT NULL,
    set_no   INTEGER NOT NULL,
    p1_pts   INTEGER NOT NULL,
    p2_pts   INTEGER NOT NULL,
    PRIMARY KEY (match_id, set_no),
    FOREIGN KEY (match_id) REFERENCES results(match_id)
);
"#;

/// Indexes are created after the column patch so they can name patched columns.
const INDEX_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_matches_state ON matches(state);
CREATE INDEX IF NOT EXISTS idx_history_match_tick ON market_odds_history(match_id, updated_at);
CREATE INDEX IF NOT EXISTS idx_results_finished ON results(finished);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().unwrap();
        db.run_migrations().unwrap();
        assert!(db.list_events(None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_old_matches_table_is_patched() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE matches (match_id INTEGER PRIMARY KEY, table_id TEXT);
             INSERT INTO matches (match_id, table_id) VALUES (7, 'A3');",
        )
        .unwrap();
        let db = Database::from_connection(conn).unwrap();
        let ev = db.get_event(7).unwrap().unwrap();
        assert_eq!(ev.record.table_id.as_deref(), Some("A3"));
        assert_eq!(ev.state, LifecycleState::Discovered);
        assert_eq!(ev.missed_ticks, 0);
    }

    #[test]
    fn test_file_database_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.db");
        let db = Database::open(path.to_str().unwrap(), Duration::from_millis(500)).unwrap();
        let mode: String = db
            .lock()
            .unwrap()
            .query_row("PRAGMA journal_mode", [], |r| r.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
