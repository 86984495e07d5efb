//! Event lifecycle, derived only from presence in the feed across ticks.
//!
//! ```text
//!  DISCOVERED ──persist──▶ ACTIVE ◀──reappears── STALE
//!                            │ absent              │ absent longer than grace
//!                            └────────▶ STALE ─────┴──────▶ FINISHED (terminal)
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Discovered,
    Active,
    Stale,
    Finished,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Discovered => "discovered",
            LifecycleState::Active => "active",
            LifecycleState::Stale => "stale",
            LifecycleState::Finished => "finished",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Finished)
    }

    /// State after the event shows up in a tick. `None` means the event is
    /// finished and the live pipeline must leave it alone.
    pub fn on_present(self) -> Option<LifecycleState> {
        match self {
            LifecycleState::Finished => None,
            LifecycleState::Discovered | LifecycleState::Active | LifecycleState::Stale => {
                Some(LifecycleState::Active)
            }
        }
    }

    /// State after the event is missing from a tick, given how long it has
    /// been since it was last seen.
    pub fn on_absent(self, absent_for: Duration, grace: Duration) -> LifecycleState {
        match self {
            LifecycleState::Active | LifecycleState::Discovered => LifecycleState::Stale,
            LifecycleState::Stale if absent_for > grace => LifecycleState::Finished,
            LifecycleState::Stale => LifecycleState::Stale,
            LifecycleState::Finished => LifecycleState::Finished,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovered" => Ok(LifecycleState::Discovered),
            "active" => Ok(LifecycleState::Active),
            "stale" => Ok(LifecycleState::Stale),
            "finished" => Ok(LifecycleState::Finished),
            other => Err(format!("unknown lifecycle state {:?}", other)),
        }
    }
}

impl ToSql for LifecycleState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for LifecycleState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        s.parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRACE: Duration = Duration::from_secs(60);

    #[test]
    fn test_discovered_becomes_active() {
        assert_eq!(
            LifecycleState::Discovered.on_present(),
            Some(LifecycleState::Active)
        );
    }

    #[test]
    fn test_stale_reappearing_is_active() {
        assert_eq!(LifecycleState::Stale.on_present(), Some(LifecycleState::Active));
    }

    #[test]
    fn test_finished_never_revisited() {
        assert_eq!(LifecycleState::Finished.on_present(), None);
        assert_eq!(
            LifecycleState::Finished.on_absent(Duration::ZERO, GRACE),
            LifecycleState::Finished
        );
    }

    #[test]
    fn test_active_goes_stale_first_even_after_long_absence() {
        assert_eq!(
            LifecycleState::Active.on_absent(Duration::from_secs(3600), GRACE),
            LifecycleState::Stale
        );
    }

    #[test]
    fn test_stale_finishes_only_past_grace() {
        assert_eq!(
            LifecycleState::Stale.on_absent(Duration::from_secs(60), GRACE),
            LifecycleState::Stale
        );
        assert_eq!(
            LifecycleState::Stale.on_absent(Duration::from_secs(61), GRACE),
            LifecycleState::Finished
        );
    }

    #[test]
    fn test_repeated_absence_always_ends_finished() {
        for grace_secs in [0u64, 1, 30, 600] {
            let grace = Duration::from_secs(grace_secs);
            let mut state = LifecycleState::Active;
            let mut absent = 0u64;
            let mut seen_terminal = false;
            for _ in 0..(grace_secs + 5) {
                absent += 1;
                state = state.on_absent(Duration::from_secs(absent), grace);
                if seen_terminal {
                    assert_eq!(state, LifecycleState::Finished);
                }
                seen_terminal |= state.is_terminal();
            }
            assert_eq!(state, LifecycleState::Finished, "grace={}", grace_secs);
        }
    }

    #[test]
    fn test_round_trips_through_text() {
        for s in [
            LifecycleState::Discovered,
            LifecycleState::Active,
            LifecycleState::Stale,
            LifecycleState::Finished,
        ] {
            assert_eq!(s.as_str().parse::<LifecycleState>().unwrap(), s);
        }
    }
}
