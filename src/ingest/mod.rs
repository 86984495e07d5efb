pub mod extractor;
pub mod markets;
pub mod resolver;

pub use extractor::FeedFilter;
pub use markets::MarketRules;

use serde_json::Value;

use crate::db::models::TickBatch;

/// One feed document turned into a storable batch.
#[derive(Debug, Default)]
pub struct ParsedTick {
    pub batch: TickBatch,
    /// Event entries without an identity
    pub skipped_events: usize,
    /// Outcomes with the wrong shape or no price
    pub skipped_outcomes: usize,
}

/// Extract tracked events and their line observations. Pure: nothing here
/// touches storage.
pub fn build_batch(doc: &Value, filter: &FeedFilter, rules: &MarketRules, observed_at: i64) -> ParsedTick {
    let (events, skipped_events) = extractor::extract_events(doc, filter);
    let mut parsed = ParsedTick {
        batch: TickBatch {
            observed_at,
            ..Default::default()
        },
        skipped_events,
        skipped_outcomes: 0,
    };

    for ev in events {
        let mut record = ev.record;
        record.summary = markets::summarize(record.match_id, ev.main, &rules.resolver);
        let m = markets::parse_markets(record.match_id, ev.main, rules);
        parsed.skipped_outcomes += m.skipped;
        parsed.batch.observations.extend(m.observations);
        parsed.batch.events.push(record);
    }
    parsed
}
