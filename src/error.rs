use std::fmt;

use thiserror::Error;

/// Pipeline stage a tick was abandoned in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Network or response decoding failure
    Fetch,
    /// Document did not have a usable top-level shape
    Extract,
    /// The tick transaction was rolled back
    Persist,
    /// Retention pass failed (the tick itself is committed)
    Prune,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Fetch => "fetch",
            Stage::Extract => "extract",
            Stage::Persist => "persist",
            Stage::Prune => "prune",
        };
        f.write_str(name)
    }
}

/// A tick that did not complete. Carries enough context to diagnose it from
/// the log without stopping the loop.
#[derive(Debug, Error)]
#[error("tick {tick} abandoned at {stage}: {source:#}")]
pub struct TickError {
    pub stage: Stage,
    pub tick: i64,
    #[source]
    pub source: anyhow::Error,
}

impl TickError {
    pub fn new(stage: Stage, tick: i64, source: impl Into<anyhow::Error>) -> Self {
        TickError {
            stage,
            tick,
            source: source.into(),
        }
    }
}

/// Helper for tagging a fallible step with its stage.
pub trait StageExt<T> {
    fn at_stage(self, stage: Stage, tick: i64) -> Result<T, TickError>;
}

impl<T, E: Into<anyhow::Error>> StageExt<T> for Result<T, E> {
    fn at_stage(self, stage: Stage, tick: i64) -> Result<T, TickError> {
        self.map_err(|e| TickError::new(stage, tick, e))
    }
}
