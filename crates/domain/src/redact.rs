//! Secret redaction and JSON payload normalization.
//!
//! Every value that reaches a persisted store (event stream, evidence
//! ledger) passes through here first. Redaction happens *before* hashing
//! so a leaked ledger never contains key material and chain verification
//! stays reproducible.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

const REDACTED: &str = "[REDACTED]";

/// API-key-shaped secrets: provider prefixes followed by a long token body,
/// plus long bearer values.
fn secret_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"sk-[A-Za-z0-9_-]{16,}",
            r"(?:api|token|key|secret)[-_]?[A-Za-z0-9]{24,}",
            r"Bearer\s+[A-Za-z0-9._~+/=-]{16,}",
            r"gh[pousr]_[A-Za-z0-9]{20,}",
            r"AKIA[0-9A-Z]{16}",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Replace API-key-shaped substrings with `[REDACTED]`.
pub fn redact_str(input: &str) -> String {
    let mut out = input.to_string();
    for re in secret_patterns() {
        out = re.replace_all(&out, REDACTED).into_owned();
    }
    out
}

/// Recursively redact every string value in a JSON tree.
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(redact_str(s)),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), redact_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Normalize a payload to JSON-safe values: absent (`null`) object fields
/// are dropped, and unrepresentable numbers coerce to 0.
pub fn normalize_payload(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), normalize_payload(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(normalize_payload).collect()),
        Value::Number(n) => {
            // serde_json already refuses NaN/inf; a number that lost its
            // representation deserializes as null upstream, so anything
            // left here is representable. Guard anyway for f64 edge coercions.
            match n.as_f64() {
                Some(f) if !f.is_finite() => Value::from(0),
                _ => Value::Number(n.clone()),
            }
        }
        other => other.clone(),
    }
}

/// Convert an `f64` into a JSON-safe number, coercing NaN/inf to 0.
pub fn json_safe_f64(value: f64) -> Value {
    if value.is_finite() {
        serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or_else(|| Value::from(0))
    } else {
        Value::from(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redacts_api_key_shapes() {
        let s = "calling with sk-abc123def456ghi789jkl and ghp_0123456789abcdefghij1234";
        let out = redact_str(s);
        assert!(!out.contains("sk-abc123"));
        assert!(!out.contains("ghp_"));
        assert!(out.contains(REDACTED));
    }

    #[test]
    fn leaves_plain_text_alone() {
        let s = "build finished in 3.2s, 0 warnings";
        assert_eq!(redact_str(s), s);
    }

    #[test]
    fn redacts_nested_values() {
        let v = json!({"args": {"auth": "Bearer abcdefghijklmnop1234"}, "n": 3});
        let out = redact_value(&v);
        assert_eq!(out["args"]["auth"], REDACTED);
        assert_eq!(out["n"], 3);
    }

    #[test]
    fn normalize_drops_null_fields() {
        let v = json!({"a": 1, "b": null, "c": {"d": null, "e": "x"}});
        let out = normalize_payload(&v);
        assert_eq!(out, json!({"a": 1, "c": {"e": "x"}}));
    }

    #[test]
    fn non_finite_coerces_to_zero() {
        assert_eq!(json_safe_f64(f64::NAN), json!(0));
        assert_eq!(json_safe_f64(f64::INFINITY), json!(0));
        assert_eq!(json_safe_f64(1.5), json!(1.5));
    }
}
