//! Uniform access to the feed's keyed-or-indexed collections.
//!
//! The bookmaker emits every collection level (sports, championships, events,
//! markets, blocks, outcomes) either as a JSON object keyed by id or as an
//! array whose elements carry the id in a field. Everything downstream walks
//! the document through [`entries`] and [`child`] so that the difference
//! never leaks past this module.

use std::borrow::Cow;

use serde_json::Value;

/// One element of a keyed-or-indexed collection.
#[derive(Debug, Clone, Copy)]
pub struct Entry<'a> {
    /// Object key, or `None` when the collection was an array.
    pub key: Option<&'a str>,
    pub value: &'a Value,
}

impl<'a> Entry<'a> {
    /// The element's identity: its object key, else the first of `fields`
    /// present on the element as a string or number.
    pub fn label(&self, fields: &[&str]) -> Option<Cow<'a, str>> {
        if let Some(key) = self.key {
            return Some(Cow::Borrowed(key));
        }
        fields.iter().find_map(|f| match self.value.get(*f)? {
            Value::String(s) => Some(Cow::Borrowed(s.as_str())),
            Value::Number(n) => Some(Cow::Owned(n.to_string())),
            _ => None,
        })
    }
}

/// Iterate an object's values (with keys) or an array's elements. Anything
/// else, including `null`, is an empty collection.
pub fn entries(v: &Value) -> Box<dyn Iterator<Item = Entry<'_>> + '_> {
    match v {
        Value::Object(map) => Box::new(map.iter().map(|(k, v)| Entry {
            key: Some(k.as_str()),
            value: v,
        })),
        Value::Array(items) => Box::new(items.iter().map(|v| Entry { key: None, value: v })),
        _ => Box::new(std::iter::empty()),
    }
}

/// Look up a child by key in either representation.
pub fn child<'a>(v: &'a Value, key: &str, id_fields: &[&str]) -> Option<&'a Value> {
    match v {
        Value::Object(map) => map.get(key),
        Value::Array(_) => entries(v)
            .find(|e| e.label(id_fields).as_deref() == Some(key))
            .map(|e| e.value),
        _ => None,
    }
}

/// Finite numeric value from a JSON number or a numeric string (`"74,5"`
/// allowed). `"NaN"` and `"inf"` are rejected.
pub fn number(v: &Value) -> Option<f64> {
    let n = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', ".").parse().ok(),
        _ => None,
    };
    n.filter(|x| x.is_finite())
}

/// First numeric field among `fields`.
pub fn number_field(v: &Value, fields: &[&str]) -> Option<f64> {
    fields.iter().find_map(|f| v.get(*f).and_then(number))
}

/// Integer identity from a number or a numeric string.
pub fn integer(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Non-empty text; numbers are rendered as text.
pub fn text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// First non-empty text field among `fields`.
pub fn text_field(v: &Value, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|f| v.get(*f).and_then(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entries_object_and_array_agree() {
        let keyed = json!({"46": {"id_sp": 46}, "3": {"id_sp": 3}});
        let listed = json!([{"id_sp": 46}, {"id_sp": 3}]);

        let mut a: Vec<String> = entries(&keyed)
            .filter_map(|e| e.label(&["id_sp"]).map(|l| l.into_owned()))
            .collect();
        let mut b: Vec<String> = entries(&listed)
            .filter_map(|e| e.label(&["id_sp"]).map(|l| l.into_owned()))
            .collect();
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }

    #[test]
    fn test_entries_of_scalar_is_empty() {
        assert_eq!(entries(&Value::Null).count(), 0);
        assert_eq!(entries(&json!("x")).count(), 0);
    }

    #[test]
    fn test_child_in_array() {
        let listed = json!([{"id": 71, "x": 1}, {"id": 72, "x": 2}]);
        assert_eq!(child(&listed, "72", &["id"]).unwrap()["x"], 2);
        assert!(child(&listed, "69", &["id"]).is_none());
    }

    #[test]
    fn test_number_accepts_strings() {
        assert_eq!(number(&json!(1.85)), Some(1.85));
        assert_eq!(number(&json!("74,5")), Some(74.5));
        assert_eq!(number(&json!("n/a")), None);
        assert_eq!(number(&Value::Null), None);
    }

    #[test]
    fn test_number_rejects_non_finite_strings() {
        for s in ["NaN", "nan", "inf", "-infinity", "Infinity"] {
            assert_eq!(number(&json!(s)), None, "{}", s);
        }
        assert_eq!(number_field(&json!({"lv": "nan", "lvt": "2,5"}), &["lv", "lvt"]), Some(2.5));
    }
}
