//! Row values and identifier rewriting inside them.

use serde_json::Value;

use super::id::CompositeKey;

/// A single row of the local store: a flat JSON object.
pub type Row = serde_json::Map<String, Value>;

/// Field holding a row's own identifier, when the row stores one.
pub const ID_FIELD: &str = "id";

/// Read a string field from a row.
#[must_use]
pub fn str_field<'a>(row: &'a Row, field: &str) -> Option<&'a str> {
    row.get(field).and_then(Value::as_str)
}

/// Replace every occurrence of identifier `from` with `to` inside `value`.
///
/// Strings equal to `from` are replaced outright; strings that parse as a
/// composite key have the matching half rebuilt. Arrays and objects are
/// walked recursively. Returns the number of replacements.
pub fn rewrite_value(value: &mut Value, from: &str, to: &str) -> usize {
    match value {
        Value::String(s) => {
            if s == from {
                *s = to.to_string();
                return 1;
            }
            if let Some(mut key) = CompositeKey::parse(s) {
                if key.rewrite(from, to) {
                    *s = key.to_string();
                    return 1;
                }
            }
            0
        }
        Value::Array(items) => items
            .iter_mut()
            .map(|item| rewrite_value(item, from, to))
            .sum(),
        Value::Object(map) => rewrite_row(map, from, to),
        Value::Null | Value::Bool(_) | Value::Number(_) => 0,
    }
}

/// [`rewrite_value`] applied to every field of a row.
pub fn rewrite_row(row: &mut Row, from: &str, to: &str) -> usize {
    row.values_mut()
        .map(|value| rewrite_value(value, from, to))
        .sum()
}

/// Whether `value` mentions identifier `id` anywhere.
#[must_use]
pub fn value_references(value: &Value, id: &str) -> bool {
    match value {
        Value::String(s) => {
            s == id || CompositeKey::parse(s).is_some_and(|key| key.references(id))
        }
        Value::Array(items) => items.iter().any(|item| value_references(item, id)),
        Value::Object(map) => row_references(map, id),
        Value::Null | Value::Bool(_) | Value::Number(_) => false,
    }
}

#[must_use]
pub fn row_references(row: &Row, id: &str) -> bool {
    row.values().any(|value| value_references(value, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn rewrite_touches_exact_matches_only() {
        let mut r = row(json!({
            "id": "tmp-1",
            "name": "tmp-1 draft",
            "project_id": "tmp-1",
            "count": 3,
        }));
        assert_eq!(rewrite_row(&mut r, "tmp-1", "srv-1"), 2);
        assert_eq!(r["id"], "srv-1");
        assert_eq!(r["project_id"], "srv-1");
        assert_eq!(r["name"], "tmp-1 draft");
    }

    #[test]
    fn rewrite_rebuilds_composite_strings() {
        let mut r = row(json!({ "member": "tmp-1::u7", "other": "tmp-10::u7" }));
        assert_eq!(rewrite_row(&mut r, "tmp-1", "srv-1"), 1);
        assert_eq!(r["member"], "srv-1::u7");
        assert_eq!(r["other"], "tmp-10::u7");
    }

    #[test]
    fn rewrite_walks_nested_values() {
        let mut v = json!({ "answers": [["tmp-2"], { "ref": "tmp-2" }] });
        assert_eq!(rewrite_value(&mut v, "tmp-2", "srv-2"), 2);
        assert!(!value_references(&v, "tmp-2"));
        assert!(value_references(&v, "srv-2"));
    }

    #[test]
    fn str_field_ignores_non_strings() {
        let r = row(json!({ "a": "x", "b": 1 }));
        assert_eq!(str_field(&r, "a"), Some("x"));
        assert_eq!(str_field(&r, "b"), None);
        assert_eq!(str_field(&r, "c"), None);
    }
}
