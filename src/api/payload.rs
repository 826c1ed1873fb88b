//! Page body extraction and repair
//!
//! Observed payloads from the remote API are not always valid JSON: the
//! top-level wrapper arrives truncated or garbled, field names carry
//! `_x0020_` whitespace markers, and some tenants emit single-quoted
//! strings. Extraction first tries the well-formed cases (a bare array, or
//! an OData envelope with a `value` array) and only then falls back to
//! locating the inner array between the first `[` and its matching
//! top-level `]`. Payloads that survive none of this are quarantined by
//! the caller, never passed downstream.

use anyhow::{bail, Context, Result};
use serde_json::Value;

/// Encoded-whitespace marker stripped from all payloads before parsing, so
/// field names line up with the mapping dictionary's JSON paths.
const SPACE_MARKER: &str = "_x0020_";

/// Reduce a page body to its record array. An empty vec means the page was
/// empty and pagination should stop.
pub fn extract_records(body: &str) -> Result<Vec<Value>> {
    let cleaned = body.trim().replace(SPACE_MARKER, "");

    if let Ok(value) = serde_json::from_str::<Value>(&cleaned) {
        if let Some(records) = as_records(value) {
            return Ok(records);
        }
    }

    repair(&cleaned)
}

fn as_records(value: Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(records) => Some(records),
        Value::Object(mut envelope) => match envelope.remove("value") {
            Some(Value::Array(records)) => Some(records),
            _ => None,
        },
        _ => None,
    }
}

fn repair(body: &str) -> Result<Vec<Value>> {
    let slice = bracketed_slice(body)?;

    if let Ok(Value::Array(records)) = serde_json::from_str(slice) {
        return Ok(records);
    }

    // Some tenants emit single-quoted strings. Requoting breaks payloads
    // containing apostrophes, in which case the parse failure below
    // quarantines the page.
    let requoted = slice.replace('\'', "\"");
    match serde_json::from_str(&requoted) {
        Ok(Value::Array(records)) => Ok(records),
        Ok(_) => bail!("repaired payload is not an array"),
        Err(e) => bail!("payload not parseable after repair: {e}"),
    }
}

/// Slice from the first `[` to its matching top-level `]`, skipping
/// delimiters inside double-quoted strings.
fn bracketed_slice(body: &str) -> Result<&str> {
    let start = body
        .find('[')
        .context("no array delimiter in payload")?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, byte) in body.bytes().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(&body[start..=i]);
                }
            }
            _ => {}
        }
    }

    bail!("unbalanced array delimiters in payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn well_formed_array_round_trips_unchanged() {
        let body = r#"[{"No":"10000","Name":"Widget"},{"No":"10001","Name":"Gadget"}]"#;
        let records = extract_records(body).unwrap();
        assert_eq!(
            records,
            vec![
                json!({"No": "10000", "Name": "Widget"}),
                json!({"No": "10001", "Name": "Gadget"})
            ]
        );
    }

    #[test]
    fn odata_envelope_yields_its_value_array() {
        let body = r#"{"@odata.context":"https://api.example/$metadata","value":[{"No":"1"}]}"#;
        let records = extract_records(body).unwrap();
        assert_eq!(records, vec![json!({"No": "1"})]);
    }

    #[test]
    fn empty_value_array_means_no_more_records() {
        assert!(extract_records(r#"{"value":[]}"#).unwrap().is_empty());
        assert!(extract_records("[]").unwrap().is_empty());
    }

    #[test]
    fn garbled_wrapper_is_reduced_to_the_inner_array() {
        // Truncated envelope with trailing garbage after the array.
        let body = r#"xt":"meta","value":[{"No":"1"},{"No":"2"}]}{"#;
        let records = extract_records(body).unwrap();
        assert_eq!(records, vec![json!({"No": "1"}), json!({"No": "2"})]);
    }

    #[test]
    fn brackets_inside_string_values_are_skipped() {
        let body = r#"garbage,"value":[{"City":"P[LAIN CITY","No":"1"}]trailer"#;
        let records = extract_records(body).unwrap();
        assert_eq!(records, vec![json!({"City": "P[LAIN CITY", "No": "1"})]);
    }

    #[test]
    fn space_markers_are_stripped_from_field_names() {
        let body = r#"[{"Ship_x0020_Date":"2024-06-10"}]"#;
        let records = extract_records(body).unwrap();
        assert_eq!(records, vec![json!({"ShipDate": "2024-06-10"})]);
    }

    #[test]
    fn single_quoted_payloads_are_requoted() {
        let body = "{'value':[{'No':'1'}]}";
        let records = extract_records(body).unwrap();
        assert_eq!(records, vec![json!({"No": "1"})]);
    }

    #[test]
    fn hopeless_payloads_are_rejected() {
        assert!(extract_records("no array here at all").is_err());
        assert!(extract_records(r#"[{"No": }"#).is_err());
        assert!(extract_records(r#"{"value": 7}"#).is_err());
    }
}
