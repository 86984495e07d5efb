//! Line value and handicap sign resolution.
//!
//! The feed often omits the numeric line on outcomes and carries it only in
//! the block's display name ("Тотал (74.5)", "Фора 1 (-1,5)"). Handicap
//! outcomes additionally need a sign that the feed never states; it comes from
//! comparing the two moneyline prices of the same event.

use std::collections::HashSet;

use anyhow::Context;
use regex::Regex;

use crate::config::TieBreak;

/// How a market's line is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketKind {
    /// Signed per side, sign from the moneyline
    Handicap,
    /// One unsigned magnitude for over and under
    Total,
    /// No line; whatever the block carries is stored as-is
    Plain,
}

/// Which handicap leg an outcome label belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    First,
    Second,
    Other,
}

impl Slot {
    pub fn of(side: &str) -> Slot {
        if side.starts_with("KF_F1") || side.starts_with("F1") {
            Slot::First
        } else if side.starts_with("KF_F2") || side.starts_with("F2") {
            Slot::Second
        } else {
            Slot::Other
        }
    }
}

/// Moneyline pair for one event (decimal odds of side one and side two).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Moneyline {
    pub p1: f64,
    pub p2: f64,
}

/// Stateless once built: the same inputs always give the same line.
#[derive(Debug, Clone)]
pub struct LineResolver {
    handicap: HashSet<u32>,
    total: HashSet<u32>,
    tie_break: TieBreak,
    number: Regex,
    bracketed: Regex,
}

impl LineResolver {
    pub fn new(
        handicap: HashSet<u32>,
        total: HashSet<u32>,
        tie_break: TieBreak,
    ) -> anyhow::Result<Self> {
        let number = Regex::new(r"([-+]?[0-9]+(?:[.,][0-9]+)?)")
            .context("failed to compile line number pattern")?;
        let bracketed = Regex::new(r"\(\s*([-+]?[0-9]+(?:[.,][0-9]+)?)\s*\)")
            .context("failed to compile bracketed line pattern")?;
        Ok(LineResolver {
            handicap,
            total,
            tie_break,
            number,
            bracketed,
        })
    }

    pub fn kind(&self, market_id: u32) -> MarketKind {
        if self.handicap.contains(&market_id) {
            MarketKind::Handicap
        } else if self.total.contains(&market_id) {
            MarketKind::Total
        } else {
            MarketKind::Plain
        }
    }

    #[cfg(test)]
    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    /// Line for a whole block: an explicit value found on any outcome, else a
    /// number in the block name (handicap and total markets only), else zero.
    pub fn block_value(&self, market_id: u32, explicit: Option<f64>, block_name: &str) -> f64 {
        if let Some(v) = explicit {
            return v;
        }
        match self.kind(market_id) {
            MarketKind::Plain => 0.0,
            MarketKind::Handicap | MarketKind::Total => self.parse_name(block_name).unwrap_or(0.0),
        }
    }

    /// Number in a display name: the parenthesised one if present, else the
    /// first one. A decimal comma is accepted.
    pub fn parse_name(&self, name: &str) -> Option<f64> {
        let caps = self
            .bracketed
            .captures(name)
            .or_else(|| self.number.captures(name))?;
        caps.get(1)?.as_str().replace(',', ".").parse().ok()
    }

    /// Final line stored for one outcome of a block whose line is `block_value`.
    pub fn side_value(
        &self,
        market_id: u32,
        block_value: f64,
        side: &str,
        moneyline: Option<Moneyline>,
    ) -> f64 {
        let v = match self.kind(market_id) {
            MarketKind::Total => block_value.abs(),
            MarketKind::Plain => block_value,
            MarketKind::Handicap => match moneyline {
                Some(ml) => signed_handicap(block_value, Slot::of(side), ml, self.tie_break),
                None => block_value,
            },
        };
        normalize_zero(v)
    }
}

/// Sign a handicap magnitude for one leg: the leg backing the favourite (the
/// lower moneyline price) is negative, the other positive.
pub fn signed_handicap(magnitude: f64, slot: Slot, ml: Moneyline, tie: TieBreak) -> f64 {
    let m = magnitude.abs();
    let first_negative = if ml.p1 < ml.p2 {
        true
    } else if ml.p1 > ml.p2 {
        false
    } else {
        tie == TieBreak::FirstNegative
    };
    match (slot, first_negative) {
        (Slot::First, true) | (Slot::Second, false) => -m,
        (Slot::First, false) | (Slot::Second, true) => m,
        (Slot::Other, _) => magnitude,
    }
}

fn normalize_zero(v: f64) -> f64 {
    if v == 0.0 {
        0.0
    } else {
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn resolver(tie: TieBreak) -> LineResolver {
        LineResolver::new(
            [71].into_iter().collect(),
            [72, 112, 122, 126, 84].into_iter().collect(),
            tie,
        )
        .unwrap()
    }

    #[test]
    fn test_total_from_block_name() {
        let r = resolver(TieBreak::FirstNegative);
        let v = r.block_value(72, None, "Тотал (74.5)");
        assert_relative_eq!(v, 74.5);
        assert_relative_eq!(r.side_value(72, v, "Tb", None), 74.5);
        assert_relative_eq!(r.side_value(72, v, "Tm", None), 74.5);
    }

    #[test]
    fn test_name_prefers_parenthesised_number() {
        let r = resolver(TieBreak::FirstNegative);
        assert_eq!(r.parse_name("Фора 1 (-1,5)"), Some(-1.5));
        assert_eq!(r.parse_name("Тотал 2 ( 18.5 )"), Some(18.5));
        assert_eq!(r.parse_name("Тотал 74.5"), Some(74.5));
        assert_eq!(r.parse_name("Победа"), None);
        assert_relative_eq!(r.block_value(71, None, "Фора 1 (-1,5)"), -1.5);
    }

    #[test]
    fn test_total_is_unsigned() {
        let r = resolver(TieBreak::FirstNegative);
        let v = r.block_value(112, None, "-18,5");
        assert_relative_eq!(v, -18.5);
        assert_relative_eq!(r.side_value(112, v, "Tb", None), 18.5);
    }

    #[test]
    fn test_explicit_value_wins_over_name() {
        let r = resolver(TieBreak::FirstNegative);
        assert_relative_eq!(r.block_value(72, Some(70.5), "Тотал (74.5)"), 70.5);
    }

    #[test]
    fn test_missing_line_defaults_to_zero() {
        let r = resolver(TieBreak::FirstNegative);
        assert_relative_eq!(r.block_value(72, None, "Тотал"), 0.0);
        // Plain markets never read the name.
        assert_relative_eq!(r.block_value(69, None, "Wm 2"), 0.0);
    }

    #[test]
    fn test_favourite_side_is_negative_for_all_magnitudes() {
        let r = resolver(TieBreak::FirstNegative);
        let p1_fav = Moneyline { p1: 1.4, p2: 2.9 };
        let p2_fav = Moneyline { p1: 2.9, p2: 1.4 };
        for m in [0.0, 0.5, 1.5, 3.5, 10.0, -2.5] {
            let f1 = r.side_value(71, m, "KF_F1", Some(p1_fav));
            let f2 = r.side_value(71, m, "KF_F2", Some(p1_fav));
            assert!(f1 <= 0.0 && f2 >= 0.0, "m={}", m);
            assert_relative_eq!(f1, -f2);

            let f1 = r.side_value(71, m, "F1", Some(p2_fav));
            let f2 = r.side_value(71, m, "F2", Some(p2_fav));
            assert!(f1 >= 0.0 && f2 <= 0.0, "m={}", m);
        }
    }

    #[test]
    fn test_zero_handicap_has_no_negative_zero() {
        let r = resolver(TieBreak::FirstNegative);
        let v = r.side_value(71, 0.0, "KF_F1", Some(Moneyline { p1: 1.5, p2: 2.5 }));
        assert!(v.is_sign_positive());
    }

    #[test]
    fn test_tie_break_is_configurable() {
        let even = Moneyline { p1: 1.9, p2: 1.9 };
        let first = resolver(TieBreak::FirstNegative);
        assert_relative_eq!(first.side_value(71, 2.5, "KF_F1", Some(even)), -2.5);
        assert_relative_eq!(first.side_value(71, 2.5, "KF_F2", Some(even)), 2.5);

        let second = resolver(TieBreak::SecondNegative);
        assert_relative_eq!(second.side_value(71, 2.5, "KF_F1", Some(even)), 2.5);
        assert_relative_eq!(second.side_value(71, 2.5, "KF_F2", Some(even)), -2.5);
    }

    #[test]
    fn test_handicap_without_moneyline_keeps_block_value() {
        let r = resolver(TieBreak::FirstNegative);
        assert_relative_eq!(r.side_value(71, -1.5, "KF_F1", None), -1.5);
        assert_relative_eq!(r.side_value(71, -1.5, "KF_F2", None), -1.5);
    }

    #[test]
    fn test_unknown_handicap_label_keeps_value() {
        let r = resolver(TieBreak::FirstNegative);
        let ml = Some(Moneyline { p1: 1.2, p2: 4.0 });
        assert_relative_eq!(r.side_value(71, 1.5, "X", ml), 1.5);
    }

    #[test]
    fn test_deterministic() {
        let r = resolver(TieBreak::FirstNegative);
        let ml = Some(Moneyline { p1: 1.7, p2: 2.1 });
        let a: Vec<f64> = (0..5).map(|_| r.side_value(71, 4.5, "KF_F2", ml)).collect();
        assert!(a.windows(2).all(|w| w[0] == w[1]));
    }
}
