use std::collections::HashSet;

use serde_json::Value;

use super::resolver::{LineResolver, Moneyline};
use crate::db::models::{LineObservation, MarketSummary};
use crate::feed::nested::{self, Entry};

const MARKET_ID_FIELDS: &[&str] = &["id", "id_mkt"];
const EVENT_ID_FIELDS: &[&str] = &["id_ev", "id"];
const BLOCK_NAME_FIELDS: &[&str] = &["name", "name_bl", "id"];
const SIDE_FIELDS: &[&str] = &["name", "side"];
const LINE_FIELDS: &[&str] = &["lv", "lvt", "lvl"];
const MAX_STAKE_FIELDS: &[&str] = &["mx", "maximum"];

const MONEYLINE_MARKET: &str = "69";
const MONEYLINE_BLOCK: &str = "Wm";
const HANDICAP_MARKET: &str = "71";
const TOTAL_MARKETS: &[&str] = &["72", "112"];
const NEXT_POINT_MARKET: &str = "882";

/// Which markets are processed and how their lines are resolved.
#[derive(Debug, Clone)]
pub struct MarketRules {
    pub allowed: HashSet<u32>,
    pub resolver: LineResolver,
}

/// Observations for one event plus the count of outcomes that were dropped
/// for having the wrong shape.
#[derive(Debug, Default)]
pub struct ParsedMarkets {
    pub observations: Vec<LineObservation>,
    pub skipped: usize,
}

/// Walk an event's `main` branch into one observation per priced outcome.
pub fn parse_markets(match_id: i64, main: &Value, rules: &MarketRules) -> ParsedMarkets {
    let mut out = ParsedMarkets::default();
    let id = match_id.to_string();
    let moneyline = moneyline(main, &id);

    for market in nested::entries(main) {
        let Some(market_id) = market
            .label(MARKET_ID_FIELDS)
            .and_then(|l| l.trim().parse::<u32>().ok())
        else {
            continue;
        };
        if !rules.allowed.contains(&market_id) {
            continue;
        }
        let Some(blocks) = event_blocks(market.value, &id) else {
            continue;
        };

        for block in nested::entries(blocks) {
            if !matches!(block.value, Value::Object(_) | Value::Array(_)) {
                out.skipped += 1;
                continue;
            }
            let name = block.label(BLOCK_NAME_FIELDS).unwrap_or_default();
            let explicit = nested::entries(block.value)
                .find_map(|o| nested::number_field(o.value, LINE_FIELDS));
            let block_value = rules.resolver.block_value(market_id, explicit, &name);

            for outcome in nested::entries(block.value) {
                match observation(match_id, market_id, block_value, outcome, moneyline, rules) {
                    Some(obs) => out.observations.push(obs),
                    // Scalar siblings (block ids, names) are not outcomes.
                    None if !outcome.value.is_object() && outcome.key.is_some() => {}
                    None => out.skipped += 1,
                }
            }
        }
    }
    out
}

fn observation(
    match_id: i64,
    market_id: u32,
    block_value: f64,
    outcome: Entry<'_>,
    moneyline: Option<Moneyline>,
    rules: &MarketRules,
) -> Option<LineObservation> {
    if !outcome.value.is_object() {
        return None;
    }
    let side = outcome.label(SIDE_FIELDS)?;
    let kf = outcome.value.get("kf").and_then(nested::number)?;
    let line_value = match nested::number_field(outcome.value, LINE_FIELDS) {
        Some(v) if v == 0.0 => 0.0,
        Some(v) => v,
        None => rules
            .resolver
            .side_value(market_id, block_value, &side, moneyline),
    };
    Some(LineObservation {
        match_id,
        market_id: i64::from(market_id),
        line_value,
        side: side.into_owned(),
        kf,
        marg: nested::number_field(outcome.value, &["marg"]),
        maximum: nested::number_field(outcome.value, MAX_STAKE_FIELDS),
    })
}

/// `main[market].data[match_id].blocks`
fn event_blocks<'a>(market: &'a Value, match_id: &str) -> Option<&'a Value> {
    let data = market.get("data")?;
    nested::child(data, match_id, EVENT_ID_FIELDS)?.get("blocks")
}

fn market_blocks<'a>(main: &'a Value, market_id: &str, match_id: &str) -> Option<&'a Value> {
    event_blocks(nested::child(main, market_id, MARKET_ID_FIELDS)?, match_id)
}

fn first_block<'a>(main: &'a Value, market_id: &str, match_id: &str) -> Option<Entry<'a>> {
    nested::entries(market_blocks(main, market_id, match_id)?).next()
}

fn kf(block: &Value, side: &str) -> Option<f64> {
    nested::child(block, side, SIDE_FIELDS)?
        .get("kf")
        .and_then(nested::number)
}

/// Moneyline prices for the event, when both are present.
pub fn moneyline(main: &Value, match_id: &str) -> Option<Moneyline> {
    let blocks = market_blocks(main, MONEYLINE_MARKET, match_id)?;
    let wm = nested::child(blocks, MONEYLINE_BLOCK, BLOCK_NAME_FIELDS)?;
    Some(Moneyline {
        p1: kf(wm, "P1")?,
        p2: kf(wm, "P2")?,
    })
}

/// Headline prices carried on the event row: moneyline, the first handicap
/// block, the first total block (market 72, else 112) and next-point winner.
pub fn summarize(match_id: i64, main: &Value, resolver: &LineResolver) -> MarketSummary {
    let id = match_id.to_string();
    let mut s = MarketSummary::default();

    if let Some(wm) = market_blocks(main, MONEYLINE_MARKET, &id)
        .and_then(|b| nested::child(b, MONEYLINE_BLOCK, BLOCK_NAME_FIELDS))
    {
        s.kf_p1 = kf(wm, "P1");
        s.kf_p2 = kf(wm, "P2");
    }

    if let Some(block) = first_block(main, HANDICAP_MARKET, &id) {
        s.handicap_line = Some(headline_value(block, 71, resolver));
        s.kf_f1 = kf(block.value, "KF_F1");
        s.kf_f2 = kf(block.value, "KF_F2");
    }

    if let Some((market, block)) = TOTAL_MARKETS
        .iter()
        .find_map(|m| first_block(main, m, &id).map(|b| (*m, b)))
    {
        let market_id = market.parse().unwrap_or(72);
        s.total_line = Some(headline_value(block, market_id, resolver).abs());
        s.kf_tm = kf(block.value, "Tm");
        s.kf_tb = kf(block.value, "Tb");
    }

    if let Some(block) = first_block(main, NEXT_POINT_MARKET, &id) {
        s.next_kf_p1 = kf(block.value, "P1");
        s.next_kf_p2 = kf(block.value, "P2");
    }
    s
}

fn headline_value(block: Entry<'_>, market_id: u32, resolver: &LineResolver) -> f64 {
    let name = block.label(BLOCK_NAME_FIELDS).unwrap_or_default();
    let explicit =
        nested::entries(block.value).find_map(|o| nested::number_field(o.value, LINE_FIELDS));
    resolver.block_value(market_id, explicit, &name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TieBreak;
    use approx::assert_relative_eq;
    use serde_json::json;

    fn rules() -> MarketRules {
        MarketRules {
            allowed: [69, 71, 72, 112, 882, 122, 126, 84].into_iter().collect(),
            resolver: LineResolver::new(
                [71].into_iter().collect(),
                [72, 112, 122, 126, 84].into_iter().collect(),
                TieBreak::FirstNegative,
            )
            .unwrap(),
        }
    }

    fn find<'a>(obs: &'a [LineObservation], market: i64, side: &str) -> &'a LineObservation {
        obs.iter()
            .find(|o| o.market_id == market && o.side == side)
            .unwrap()
    }

    #[test]
    fn test_total_line_from_block_name() {
        let main = json!({
            "72": {"data": {"1001": {"blocks": {
                "Тотал (74.5)": {"Tb": {"kf": 1.85, "marg": 0.05, "mx": 500}, "Tm": {"kf": 1.95}}
            }}}}
        });
        let parsed = parse_markets(1001, &main, &rules());
        assert_eq!(parsed.observations.len(), 2);
        assert_eq!(parsed.skipped, 0);
        for o in &parsed.observations {
            assert_relative_eq!(o.line_value, 74.5);
        }
        let tb = find(&parsed.observations, 72, "Tb");
        assert_relative_eq!(tb.kf, 1.85);
        assert_eq!(tb.maximum, Some(500.0));
    }

    #[test]
    fn test_non_finite_price_skips_only_that_outcome() {
        let main = json!({
            "72": {"data": {"1001": {"blocks": {
                "Тотал (74.5)": {"Tb": {"kf": 1.85}, "Tm": {"kf": "NaN"}, "Tx": {"kf": "inf"}}
            }}}}
        });
        let parsed = parse_markets(1001, &main, &rules());
        assert_eq!(parsed.observations.len(), 1);
        assert_eq!(parsed.skipped, 2);
        assert_relative_eq!(find(&parsed.observations, 72, "Tb").kf, 1.85);
    }

    #[test]
    fn test_non_finite_explicit_line_falls_back_to_block_name() {
        let main = json!({
            "72": {"data": {"1001": {"blocks": {
                "Тотал (74.5)": {"Tb": {"kf": 1.85, "lv": "nan"}, "Tm": {"kf": 1.95}}
            }}}}
        });
        let parsed = parse_markets(1001, &main, &rules());
        assert_eq!(parsed.observations.len(), 2);
        for o in &parsed.observations {
            assert_relative_eq!(o.line_value, 74.5);
        }
    }

    #[test]
    fn test_handicap_signs_follow_moneyline() {
        let main = json!({
            "69": {"data": {"7": {"blocks": {"Wm": {"P1": {"kf": 2.6}, "P2": {"kf": 1.45}}}}}},
            "71": {"data": {"7": {"blocks": {"Фора (1.5)": {"KF_F1": {"kf": 1.8}, "KF_F2": {"kf": 1.9}}}}}}
        });
        let parsed = parse_markets(7, &main, &rules());
        assert_relative_eq!(find(&parsed.observations, 71, "KF_F1").line_value, 1.5);
        assert_relative_eq!(find(&parsed.observations, 71, "KF_F2").line_value, -1.5);
        assert_relative_eq!(find(&parsed.observations, 69, "P1").line_value, 0.0);
    }

    #[test]
    fn test_explicit_outcome_line_wins() {
        let main = json!({
            "71": {"data": {"7": {"blocks": {"b": {
                "KF_F1": {"kf": 1.8, "lv": "-2,5"},
                "KF_F2": {"kf": 1.9, "lv": 2.5}
            }}}}}
        });
        let parsed = parse_markets(7, &main, &rules());
        assert_relative_eq!(find(&parsed.observations, 71, "KF_F1").line_value, -2.5);
        assert_relative_eq!(find(&parsed.observations, 71, "KF_F2").line_value, 2.5);
    }

    #[test]
    fn test_malformed_outcome_is_skipped_alone() {
        let main = json!({
            "72": {"data": {"1": {"blocks": {
                "Тотал 70.5": {"Tb": {"kf": "n/a"}, "Tm": {"kf": 1.9}, "Tx": "oops"}
            }}}},
            "112": {"data": {"1": {"blocks": {"18.5": {"Tb": {"kf": 1.7}}}}}}
        });
        let parsed = parse_markets(1, &main, &rules());
        assert_eq!(parsed.observations.len(), 2);
        assert_eq!(parsed.skipped, 1);
        assert_relative_eq!(find(&parsed.observations, 112, "Tb").line_value, 18.5);
    }

    #[test]
    fn test_unknown_markets_are_ignored() {
        let main = json!({
            "999": {"data": {"1": {"blocks": {"x": {"A": {"kf": 1.1}}}}}},
            "name": "not a market"
        });
        assert!(parse_markets(1, &main, &rules()).observations.is_empty());
    }

    #[test]
    fn test_list_shapes_match_map_shapes() {
        let as_map = json!({
            "72": {"data": {"5": {"blocks": {"74.5": {"Tb": {"kf": 1.85}, "Tm": {"kf": 1.95}}}}}}
        });
        let as_list = json!([
            {"id": 72, "data": [{"id_ev": 5, "blocks": [
                {"name": "74.5", "Tb": {"kf": 1.85}, "Tm": {"kf": 1.95}}
            ]}]}
        ]);
        let mut a = parse_markets(5, &as_map, &rules()).observations;
        let mut b = parse_markets(5, &as_list, &rules()).observations;
        a.sort_by(|x, y| x.side.cmp(&y.side));
        b.sort_by(|x, y| x.side.cmp(&y.side));
        assert_eq!(a, b);
    }

    #[test]
    fn test_outcome_list_inside_block() {
        let main = json!({
            "72": {"data": {"5": {"blocks": {"74.5": [
                {"side": "Tb", "kf": 1.85},
                {"side": "Tm", "kf": 1.95},
                {"kf": 2.0}
            ]}}}}
        });
        let parsed = parse_markets(5, &main, &rules());
        assert_eq!(parsed.observations.len(), 2);
        assert_eq!(parsed.skipped, 1);
    }

    #[test]
    fn test_summary_columns() {
        let main = json!({
            "69": {"data": {"9": {"blocks": {"Wm": {"P1": {"kf": 1.5}, "P2": {"kf": 2.5}}}}}},
            "71": {"data": {"9": {"blocks": {"(2.5)": {"KF_F1": {"kf": 1.8}, "KF_F2": {"kf": 1.9}}}}}},
            "112": {"data": {"9": {"blocks": {"76,5": {"Tm": {"kf": 1.7}, "Tb": {"kf": 2.05}}}}}},
            "882": {"data": {"9": {"blocks": {"next": {"P1": {"kf": 1.6}, "P2": {"kf": 2.2}}}}}}
        });
        let s = summarize(9, &main, &rules().resolver);
        assert_eq!(s.kf_p1, Some(1.5));
        assert_eq!(s.kf_p2, Some(2.5));
        assert_relative_eq!(s.handicap_line.unwrap(), 2.5);
        assert_eq!(s.kf_f2, Some(1.9));
        assert_relative_eq!(s.total_line.unwrap(), 76.5);
        assert_eq!(s.kf_tb, Some(2.05));
        assert_eq!(s.next_kf_p2, Some(2.2));
    }

    #[test]
    fn test_summary_of_empty_main_is_all_null() {
        assert_eq!(summarize(1, &json!({}), &rules().resolver), MarketSummary::default());
    }
}
