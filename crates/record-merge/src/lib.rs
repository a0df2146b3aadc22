//! Field-level conflict detection for queued local edits.
//!
//! The server and the local queue represent the same field in different
//! shapes: booleans arrive as `1`/`"Yes"`/`true`, timestamps in several
//! string formats, numbers sometimes as strings. Before deciding whether a
//! queued edit actually conflicts with the server's current value, both
//! sides are normalized into a single domain.
//!
//! Everything in this crate is a pure function of its inputs: no clocks,
//! no I/O, no state. The resolution policy (ask-user, server-wins, ...)
//! lives outside; this crate only renders the equal/conflicting verdict.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

/// A single field where the queued local value and the server value differ
/// after normalization. Computed at merge time, never stored.
#[derive(Clone, Debug, PartialEq)]
pub struct ConflictCandidate {
    pub model: String,
    pub record_id: i64,
    pub field: String,
    pub local: Value,
    pub server: Value,
}

/// Decides whether two field values are equal after normalization.
///
/// Rules, in order:
/// - `null` on both sides is equal; `null` on exactly one side conflicts
///   (an edit-to-empty is meaningfully different from never-set).
/// - Arrays compare by ordered element equality.
/// - Objects compare keywise over the union of keys, missing keys as `null`.
/// - If both sides are boolean-like (`true`/`false`, `1`/`0`, `"1"`/`"0"`,
///   `"true"`/`"false"`, `"yes"`/`"no"`, case-insensitive) they compare in
///   the boolean domain.
/// - If both sides are numeric (numbers or numeric strings) they compare
///   as numbers.
/// - If both sides parse as timestamps they compare by canonical ISO-8601.
/// - Otherwise, plain equality.
pub fn values_equal(local: &Value, server: &Value) -> bool {
    match (local, server) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            let null = Value::Null;
            a.keys()
                .chain(b.keys())
                .all(|k| values_equal(a.get(k).unwrap_or(&null), b.get(k).unwrap_or(&null)))
        }
        _ => scalars_equal(local, server),
    }
}

/// Compares a queued edit against the server's current record state.
///
/// Only fields present in the local edit are considered: a field the user
/// never touched cannot conflict. A field absent on the server side
/// compares as `null`.
pub fn diff_records(
    model: &str,
    record_id: i64,
    local: &serde_json::Map<String, Value>,
    server: &serde_json::Map<String, Value>,
) -> Vec<ConflictCandidate> {
    let null = Value::Null;
    local
        .iter()
        .filter(|(field, local_value)| {
            let server_value = server.get(*field).unwrap_or(&null);
            !values_equal(local_value, server_value)
        })
        .map(|(field, local_value)| ConflictCandidate {
            model: model.to_string(),
            record_id,
            field: field.clone(),
            local: local_value.clone(),
            server: server.get(field).cloned().unwrap_or(Value::Null),
        })
        .collect()
}

fn scalars_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (as_boolean(a), as_boolean(b)) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (as_timestamp(a), as_timestamp(b)) {
        return x == y;
    }
    a == b
}

/// Normalizes boolean-like values into the boolean domain.
fn as_boolean(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Normalizes numbers and numeric strings into f64.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Normalizes parseable timestamp strings into a canonical ISO-8601 string.
///
/// Numeric strings never reach this point: `as_number` claims them first.
fn as_timestamp(value: &Value) -> Option<String> {
    let s = value.as_str()?.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc).to_rfc3339());
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc().to_rfc3339());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0)?;
        return Some(midnight.and_utc().to_rfc3339());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn boolean_domain_spans_representations() {
        assert!(values_equal(&json!(1), &json!("Yes")));
        assert!(values_equal(&json!(true), &json!(1)));
        assert!(values_equal(&json!("TRUE"), &json!("yes")));
        assert!(values_equal(&json!("0"), &json!(false)));
        assert!(values_equal(&json!("No"), &json!(0)));
        assert!(!values_equal(&json!(true), &json!("no")));
    }

    #[test]
    fn null_semantics() {
        assert!(values_equal(&Value::Null, &Value::Null));
        assert!(!values_equal(&Value::Null, &json!(0)));
        assert!(!values_equal(&json!(1751472364), &Value::Null));
        assert!(!values_equal(&Value::Null, &json!("")));
    }

    #[test]
    fn numeric_strings_normalize() {
        assert!(values_equal(&json!("3.5"), &json!(3.5)));
        assert!(values_equal(&json!(" 42 "), &json!(42)));
        assert!(!values_equal(&json!("42"), &json!(43)));
    }

    #[test]
    fn timestamps_normalize_to_iso8601() {
        assert!(values_equal(
            &json!("2025-07-01 05:56:52"),
            &json!("2025-07-01T05:56:52+00:00"),
        ));
        assert!(values_equal(
            &json!("2025-07-01 05:56:52"),
            &json!("2025-07-01T05:56:52"),
        ));
        assert!(values_equal(&json!("2025-07-01"), &json!("2025-07-01T00:00:00+00:00")));
        assert!(!values_equal(
            &json!("2025-07-01 05:56:52"),
            &json!("2025-07-01 05:56:53"),
        ));
    }

    #[test]
    fn arrays_compare_ordered() {
        assert!(values_equal(
            &json!(["2025-07-01 05:56:52"]),
            &json!(["2025-07-01 05:56:52"]),
        ));
        // Order reflects explicit selection order in this domain.
        assert!(!values_equal(&json!([1, 2]), &json!([2, 1])));
        assert!(!values_equal(&json!([1, 2]), &json!([1, 2, 3])));
        assert!(values_equal(&json!([1, "1"]), &json!([1, 1])));
    }

    #[test]
    fn objects_compare_keywise() {
        assert!(values_equal(
            &json!({"a": "1", "b": null}),
            &json!({"a": 1}),
        ));
        assert!(!values_equal(&json!({"a": 1}), &json!({"a": 2})));
    }

    #[test]
    fn plain_strings_compare_directly() {
        assert!(values_equal(&json!("hello"), &json!("hello")));
        assert!(!values_equal(&json!("hello"), &json!("Hello")));
    }

    #[test]
    fn diff_records_only_considers_local_fields() {
        let local = json!({"active": "1", "note": "edited"});
        let server = json!({"active": true, "note": "original", "other": 9});

        let conflicts = diff_records(
            "res.partner",
            7,
            local.as_object().unwrap(),
            server.as_object().unwrap(),
        );

        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].field, "note");
        assert_eq!(conflicts[0].model, "res.partner");
        assert_eq!(conflicts[0].record_id, 7);
        assert_eq!(conflicts[0].local, json!("edited"));
        assert_eq!(conflicts[0].server, json!("original"));
    }

    #[test]
    fn diff_records_missing_server_field_conflicts() {
        let local = json!({"note": "set locally"});
        let server = json!({});

        let conflicts = diff_records(
            "res.partner",
            1,
            local.as_object().unwrap(),
            server.as_object().unwrap(),
        );

        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].server, Value::Null);
    }

    #[test]
    fn diff_records_equal_after_normalization_is_clean() {
        let local = json!({"active": "Yes", "date": "2025-07-01 05:56:52"});
        let server = json!({"active": true, "date": "2025-07-01T05:56:52+00:00"});

        let conflicts = diff_records(
            "helpdesk.ticket",
            3,
            local.as_object().unwrap(),
            server.as_object().unwrap(),
        );
        assert!(conflicts.is_empty());
    }
}
