use std::collections::HashSet;

use anyhow::Context;
use regex::Regex;
use serde_json::Value;

use crate::db::models::EventRecord;
use crate::feed::nested;

const SPORT_ID_FIELDS: &[&str] = &["id_sp", "id"];
const EVENT_ID_FIELDS: &[&str] = &["id_ev", "id"];

static NO_MARKETS: Value = Value::Null;

/// Which part of the feed is tracked: one sport, championships whose label
/// matches the tournament pattern, and an allow-set of venue tables.
#[derive(Debug, Clone)]
pub struct FeedFilter {
    sport_id: String,
    tournament: Regex,
    table: Regex,
    tables: HashSet<String>,
}

/// A championship that passed the sport and table filters.
#[derive(Debug, Clone)]
pub struct Championship<'a> {
    pub name: String,
    pub table: String,
    pub value: &'a Value,
}

/// An event pulled from the feed, still holding its raw market branch.
#[derive(Debug, Clone)]
pub struct ExtractedEvent<'a> {
    pub record: EventRecord,
    pub main: &'a Value,
}

impl FeedFilter {
    pub fn new(
        sport_id: &str,
        tournament: Regex,
        marker: &str,
        tables: impl Iterator<Item = String>,
    ) -> anyhow::Result<Self> {
        let table = Regex::new(&format!(r"{}\s+([A-ZА-Я]\d+)", regex::escape(marker)))
            .with_context(|| format!("invalid table marker {:?}", marker))?;
        let tables: HashSet<String> = tables.map(|t| normalize_table(&t)).collect();
        if tables.is_empty() {
            anyhow::bail!("table allow-set is empty");
        }
        Ok(FeedFilter {
            sport_id: sport_id.to_string(),
            tournament,
            table,
            tables,
        })
    }

    /// Normalised table code from a championship label, if any.
    pub fn table_code(&self, label: &str) -> Option<String> {
        let caps = self.table.captures(label)?;
        Some(normalize_table(caps.get(1)?.as_str()))
    }

    pub fn allows_table(&self, code: &str) -> bool {
        self.tables.contains(code)
    }

    /// Championships of the tracked sport on an allowed table. The tournament
    /// pattern is applied only when `require_tournament` is set; the results
    /// feed labels its championships differently.
    pub fn championships<'a>(&self, doc: &'a Value, require_tournament: bool) -> Vec<Championship<'a>> {
        let root = doc.get("reply").unwrap_or(doc);
        let Some(sports) = root.get("sports") else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for sport in nested::entries(sports) {
            if sport_id(&sport).as_deref().map(str::trim) != Some(self.sport_id.as_str()) {
                continue;
            }
            let Some(chmps) = sport.value.get("chmps") else {
                continue;
            };
            for ch in nested::entries(chmps) {
                let Some(name) = nested::text_field(ch.value, &["name_ch"]) else {
                    continue;
                };
                if require_tournament && !self.tournament.is_match(&name) {
                    continue;
                }
                let Some(table) = self.table_code(&name) else {
                    continue;
                };
                if !self.allows_table(&table) {
                    continue;
                }
                out.push(Championship {
                    name,
                    table,
                    value: ch.value,
                });
            }
        }
        out
    }
}

/// Map Cyrillic capitals that share a glyph with a Latin letter onto Latin.
pub fn normalize_table(code: &str) -> String {
    code.trim()
        .chars()
        .map(|c| match c {
            'А' => 'A',
            'В' => 'B',
            'Е' => 'E',
            'К' => 'K',
            'М' => 'M',
            'Н' => 'H',
            'О' => 'O',
            'Р' => 'P',
            'С' => 'C',
            'Т' => 'T',
            'Х' => 'X',
            other => other,
        })
        .collect()
}

/// Identity of a sport entry: its `id_sp` field, else its key.
pub fn sport_id(entry: &nested::Entry<'_>) -> Option<String> {
    entry
        .value
        .get("id_sp")
        .and_then(nested::text)
        .or_else(|| entry.label(SPORT_ID_FIELDS).map(|l| l.into_owned()))
}

/// Identity of an event entry: its `id_ev` field, else its key.
pub fn event_id(entry: &nested::Entry<'_>) -> Option<i64> {
    entry
        .value
        .get("id_ev")
        .and_then(nested::integer)
        .or_else(|| entry.label(EVENT_ID_FIELDS)?.trim().parse().ok())
}

/// Events of the tracked tournament on allowed tables. Events without an
/// identity are dropped and counted in the second element.
pub fn extract_events<'a>(doc: &'a Value, filter: &FeedFilter) -> (Vec<ExtractedEvent<'a>>, usize) {
    let mut events = Vec::new();
    let mut skipped = 0;
    for ch in filter.championships(doc, true) {
        let Some(evts) = ch.value.get("evts") else {
            continue;
        };
        for entry in nested::entries(evts) {
            let Some(match_id) = event_id(&entry) else {
                skipped += 1;
                continue;
            };
            let ev = entry.value;
            let record = EventRecord {
                tournament: Some(ch.name.clone()),
                table_id: Some(ch.table.clone()),
                start_ts: ev.get("date_ev").and_then(nested::integer),
                name_p1: nested::text_field(ev, &["name_ht"]),
                name_p2: nested::text_field(ev, &["name_at"]),
                current_score: nested::text_field(ev, &["sc_ev", "cur_score"]),
                set_score: nested::text_field(ev, &["sc_ext_ev"]),
                ..EventRecord::new(match_id)
            };
            events.push(ExtractedEvent {
                record,
                main: ev.get("main").unwrap_or(&NO_MARKETS),
            });
        }
    }
    (events, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filter() -> FeedFilter {
        FeedFilter::new(
            "46",
            Regex::new(r"(?i)Лига\s+Про\.\s*Мужчины").unwrap(),
            "Стол",
            ["A3", "A4", "A5", "A6", "A9"].iter().map(|s| s.to_string()),
        )
        .unwrap()
    }

    fn doc() -> Value {
        json!({"reply": {"sports": {
            "46": {"id_sp": 46, "chmps": {
                "1": {"name_ch": "Лига Про. Мужчины. Стол А3", "evts": {
                    "1001": {"id_ev": 1001, "date_ev": 1700000000, "name_ht": "Ivanov", "name_at": "Petrov",
                             "sc_ev": "1:0", "main": {}},
                    "1002": {"id_ev": 1002}
                }},
                "2": {"name_ch": "Лига Про. Мужчины. Стол A7", "evts": {"2001": {"id_ev": 2001}}},
                "3": {"name_ch": "Кубок ТТ. Стол A3", "evts": {"3001": {"id_ev": 3001}}}
            }},
            "3": {"id_sp": 3, "chmps": {"9": {"name_ch": "Лига Про. Мужчины. Стол A3",
                                              "evts": {"9001": {"id_ev": 9001}}}}}
        }}})
    }

    #[test]
    fn test_filters_sport_tournament_and_table() {
        let d = doc();
        let (events, skipped) = extract_events(&d, &filter());
        let mut ids: Vec<i64> = events.iter().map(|e| e.record.match_id).collect();
        ids.sort();
        assert_eq!(ids, vec![1001, 1002]);
        assert_eq!(skipped, 0);
    }

    #[test]
    fn test_sport_field_wins_over_map_key() {
        let d = json!({"sports": {
            "s0": {"id_sp": 46, "chmps": {"1": {"name_ch": "Лига Про. Мужчины. Стол A3",
                                                "evts": {"1001": {"id_ev": 1001}}}}},
            "46": {"id_sp": 3, "chmps": {"2": {"name_ch": "Лига Про. Мужчины. Стол A4",
                                               "evts": {"9001": {"id_ev": 9001}}}}},
            "0": {"id_sp": "46", "chmps": [{"name_ch": "Лига Про. Мужчины. Стол A5",
                                            "evts": [{"id_ev": 1002}]}]}
        }});
        let (events, _) = extract_events(&d, &filter());
        let mut ids: Vec<i64> = events.iter().map(|e| e.record.match_id).collect();
        ids.sort();
        assert_eq!(ids, vec![1001, 1002]);
    }

    #[test]
    fn test_cyrillic_table_letter_is_normalised() {
        let d = doc();
        let (events, _) = extract_events(&d, &filter());
        assert!(events.iter().all(|e| e.record.table_id.as_deref() == Some("A3")));
    }

    #[test]
    fn test_optional_fields_are_null() {
        let d = doc();
        let (events, _) = extract_events(&d, &filter());
        let bare = events.iter().find(|e| e.record.match_id == 1002).unwrap();
        assert!(bare.record.name_p1.is_none());
        assert!(bare.record.start_ts.is_none());
        assert!(bare.main.is_null());

        let full = events.iter().find(|e| e.record.match_id == 1001).unwrap();
        assert_eq!(full.record.name_p2.as_deref(), Some("Petrov"));
        assert_eq!(full.record.current_score.as_deref(), Some("1:0"));
        assert_eq!(full.record.start_ts, Some(1_700_000_000));
    }

    #[test]
    fn test_list_shaped_document() {
        let d = json!({"sports": [
            {"id_sp": "46", "chmps": [
                {"name_ch": "лига про. мужчины. Стол A9", "evts": [
                    {"id_ev": "501", "name_ht": "A"},
                    {"name_ht": "no id"}
                ]}
            ]}
        ]});
        let (events, skipped) = extract_events(&d, &filter());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].record.match_id, 501);
        assert_eq!(skipped, 1);
    }

    #[test]
    fn test_missing_branches_are_not_errors() {
        assert!(extract_events(&json!({}), &filter()).0.is_empty());
        assert!(extract_events(&json!({"sports": null}), &filter()).0.is_empty());
        assert!(extract_events(&json!({"sports": {"46": {"id_sp": 46}}}), &filter()).0.is_empty());
    }

    #[test]
    fn test_homoglyphs() {
        assert_eq!(normalize_table("А3"), "A3");
        assert_eq!(normalize_table("С10"), "C10");
        assert_eq!(normalize_table("A4"), "A4");
    }
}
