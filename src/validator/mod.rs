//! Validator.
//!
//! Evaluates a step's `validate` rules against a normalized response
//! envelope and produces a [`ValidationOutcome`] per rule. A step passes
//! only if every rule passes *and* the transport call itself didn't error.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;
use std::time::Duration;

use crate::document::{JsonSubKind, ValidateKind, ValidateRule};
use crate::jsonpath;
use crate::vars::Scope;

/// The normalized shape every transport adapter produces, regardless of
/// protocol — non-HTTP adapters synthesize this envelope.
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    pub status_code: u16,
    pub body: Value,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub kind: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub passed: bool,
    pub error: Option<String>,
}

/// Runs every rule in `rules` against `response`, substituting templates in
/// paths/expected values first.
pub fn validate(
    rules: &[ValidateRule],
    response: &ResponseEnvelope,
    scope: &Scope,
) -> Vec<ValidationOutcome> {
    rules.iter().map(|rule| validate_one(rule, response, scope)).collect()
}

pub fn all_passed(outcomes: &[ValidationOutcome]) -> bool {
    outcomes.iter().all(|o| o.passed)
}

fn validate_one(rule: &ValidateRule, response: &ResponseEnvelope, scope: &Scope) -> ValidationOutcome {
    match rule.kind {
        ValidateKind::Status => validate_status(rule, response),
        ValidateKind::Time => validate_time(rule, response),
        ValidateKind::Json => validate_json(rule, response, scope),
        ValidateKind::Xml => ValidationOutcome {
            kind: "xml".into(),
            expected: rule.path.clone(),
            actual: None,
            passed: false,
            error: Some("xml validation is not implemented".into()),
        },
    }
}

fn validate_status(rule: &ValidateRule, response: &ResponseEnvelope) -> ValidationOutcome {
    let expected = rule.expected.as_ref().and_then(|v| v.as_u64()).unwrap_or(0) as u16;
    let passed = response.status_code == expected;
    ValidationOutcome {
        kind: "status".into(),
        expected: Some(expected.to_string()),
        actual: Some(response.status_code.to_string()),
        passed,
        error: (!passed).then(|| format!("expected status {expected}, got {}", response.status_code)),
    }
}

/// Parses `< 200ms`, `> 1s`, or `100-300ms` style time expressions.
fn validate_time(rule: &ValidateRule, response: &ResponseEnvelope) -> ValidationOutcome {
    let actual_ms = response.duration.as_millis() as f64;
    let expr = rule.expr.clone().unwrap_or_default();
    let passed = match parse_time_expr(&expr) {
        Some(TimeExpr::LessThan(ms)) => actual_ms < ms,
        Some(TimeExpr::GreaterThan(ms)) => actual_ms > ms,
        Some(TimeExpr::Range(lo, hi)) => actual_ms >= lo && actual_ms <= hi,
        None => false,
    };
    ValidationOutcome {
        kind: "time".into(),
        expected: Some(expr.clone()),
        actual: Some(format!("{actual_ms}ms")),
        passed,
        error: (!passed).then(|| format!("expected time {expr}, got {actual_ms}ms")),
    }
}

enum TimeExpr {
    LessThan(f64),
    GreaterThan(f64),
    Range(f64, f64),
}

fn parse_time_expr(expr: &str) -> Option<TimeExpr> {
    let expr = expr.trim();
    if let Some(rest) = expr.strip_prefix('<') {
        return parse_duration_str(rest.trim()).map(TimeExpr::LessThan);
    }
    if let Some(rest) = expr.strip_prefix('>') {
        return parse_duration_str(rest.trim()).map(TimeExpr::GreaterThan);
    }
    if let Some((lo, hi)) = expr.split_once('-') {
        let lo = parse_duration_str(lo.trim())?;
        let hi = parse_duration_str(hi.trim())?;
        return Some(TimeExpr::Range(lo, hi));
    }
    None
}

/// Parses `{number}{unit}` durations where unit is one of
/// `ns|us|µs|ms|s|m|h`, returning milliseconds.
pub fn parse_duration_str(s: &str) -> Option<f64> {
    let s = s.trim();
    let split_at = s.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    let (num, unit) = s.split_at(split_at);
    let num: f64 = num.parse().ok()?;
    let ms = match unit.trim() {
        "ns" => num / 1_000_000.0,
        "us" | "µs" => num / 1_000.0,
        "ms" => num,
        "s" => num * 1_000.0,
        "m" => num * 60_000.0,
        "h" => num * 3_600_000.0,
        _ => return None,
    };
    Some(ms)
}

fn validate_json(rule: &ValidateRule, response: &ResponseEnvelope, scope: &Scope) -> ValidationOutcome {
    let path = rule.path.clone().unwrap_or_default();
    let actual = match jsonpath::select(&response.body, &path, scope) {
        Ok(v) => v,
        Err(e) => {
            return ValidationOutcome {
                kind: "json".into(),
                expected: rule.expected.as_ref().map(|v| v.to_string()),
                actual: None,
                passed: false,
                error: Some(e.to_string()),
            }
        }
    };

    let decoded = match decode_chain(&actual, rule) {
        Ok(v) => v,
        Err(e) => {
            return ValidationOutcome {
                kind: "json".into(),
                expected: rule.expected.as_ref().map(|v| v.to_string()),
                actual: Some(actual.to_string()),
                passed: false,
                error: Some(e),
            }
        }
    };

    let sub_kind = rule.sub_kind.unwrap_or(JsonSubKind::Equals);
    let (passed, error) = match sub_kind {
        JsonSubKind::Equals => {
            let expected = substituted_expected(rule, scope);
            let ok = values_equal(&decoded, &expected);
            (ok, (!ok).then(|| format!("expected {expected}, got {decoded}")))
        }
        JsonSubKind::Contains => {
            let expected = rule.expected.as_ref().and_then(|v| v.as_str()).unwrap_or_default();
            let ok = decoded.as_str().map(|s| s.contains(expected)).unwrap_or(false);
            (ok, (!ok).then(|| format!("expected to contain '{expected}', got {decoded}")))
        }
        JsonSubKind::Type => {
            let expected = rule.expected.as_ref().and_then(|v| v.as_str()).unwrap_or_default();
            let actual_type = type_name(&decoded);
            let ok = actual_type == expected;
            (ok, (!ok).then(|| format!("expected type {expected}, got {actual_type}")))
        }
        JsonSubKind::Greater => numeric_cmp(&decoded, rule, |a, b| a > b),
        JsonSubKind::Less => numeric_cmp(&decoded, rule, |a, b| a < b),
        JsonSubKind::Pattern => {
            let pattern = rule.expected.as_ref().and_then(|v| v.as_str()).unwrap_or_default();
            match regex::Regex::new(pattern) {
                Ok(re) => {
                    let ok = decoded.as_str().map(|s| re.is_match(s)).unwrap_or(false);
                    (ok, (!ok).then(|| format!("'{decoded}' does not match /{pattern}/")))
                }
                Err(e) => (false, Some(format!("invalid pattern: {e}"))),
            }
        }
        JsonSubKind::Nil => {
            let ok = decoded.is_null();
            (ok, (!ok).then(|| format!("expected null, got {decoded}")))
        }
        JsonSubKind::Empty => {
            let ok = is_empty(&decoded);
            (ok, (!ok).then(|| format!("expected empty, got {decoded}")))
        }
        JsonSubKind::Len => numeric_cmp(&Value::from(json_len(&decoded)), rule, |a, b| a == b),
    };

    ValidationOutcome {
        kind: "json".into(),
        expected: rule.expected.as_ref().map(|v| v.to_string()),
        actual: Some(decoded.to_string()),
        passed,
        error,
    }
}

fn decode_chain(value: &Value, rule: &ValidateRule) -> Result<Value, String> {
    let Some(decode) = &rule.decode else {
        return Ok(value.clone());
    };
    match decode.as_str() {
        "base64json" => {
            let raw = value.as_str().ok_or("decode: base64json requires a string value")?;
            let bytes = BASE64.decode(raw).map_err(|e| format!("base64 decode failed: {e}"))?;
            let decoded: Value = serde_json::from_slice(&bytes).map_err(|e| format!("invalid JSON after decode: {e}"))?;
            if let Some(then_path) = &rule.then_path {
                jsonpath::select_literal(&decoded, then_path).map_err(|e| e.to_string())
            } else {
                Ok(decoded)
            }
        }
        other => Err(format!("unknown decode kind '{other}'")),
    }
}

/// Substitutes templates into `rule.expected` before an `equals` comparison,
/// so `expected: "{{token}}"` compares against the resolved value rather than
/// the literal template string.
fn substituted_expected(rule: &ValidateRule, scope: &Scope) -> Value {
    let expected = rule.expected.clone().unwrap_or(Value::Null);
    scope.substitute_value(&expected).unwrap_or(expected)
}

/// Numeric-aware equality: `2` and `2.0` compare equal even though
/// `serde_json` represents them as distinct `Number` variants. Falls back to
/// structural equality for non-numeric values.
fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(e)) => a == e,
        _ => actual == expected,
    }
}

fn numeric_cmp(actual: &Value, rule: &ValidateRule, cmp: impl Fn(f64, f64) -> bool) -> (bool, Option<String>) {
    let expected = rule.expected.as_ref().and_then(|v| v.as_f64());
    let actual_n = actual.as_f64();
    match (actual_n, expected) {
        (Some(a), Some(e)) => {
            let ok = cmp(a, e);
            (ok, (!ok).then(|| format!("comparison failed: actual={a}, expected={e}")))
        }
        _ => (false, Some("non-numeric comparison".into())),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(m) => m.is_empty(),
        _ => false,
    }
}

fn json_len(value: &Value) -> f64 {
    match value {
        Value::String(s) => s.chars().count() as f64,
        Value::Array(a) => a.len() as f64,
        Value::Object(m) => m.len() as f64,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(status: u16, body: Value, ms: u64) -> ResponseEnvelope {
        ResponseEnvelope { status_code: status, body, duration: Duration::from_millis(ms) }
    }

    #[test]
    fn status_rule_passes_on_match() {
        let rule = ValidateRule {
            kind: ValidateKind::Status,
            path: None,
            expr: None,
            expected: Some(json!(200)),
            sub_kind: None,
            decode: None,
            then_path: None,
        };
        let outcome = validate_one(&rule, &envelope(200, Value::Null, 10), &Scope::new());
        assert!(outcome.passed);
    }

    #[test]
    fn time_rule_parses_less_than() {
        let rule = ValidateRule {
            kind: ValidateKind::Time,
            path: None,
            expr: Some("< 200ms".into()),
            expected: None,
            sub_kind: None,
            decode: None,
            then_path: None,
        };
        let outcome = validate_one(&rule, &envelope(200, Value::Null, 50), &Scope::new());
        assert!(outcome.passed);
    }

    #[test]
    fn json_equals_rule() {
        let rule = ValidateRule {
            kind: ValidateKind::Json,
            path: Some("$.data.id".into()),
            expr: None,
            expected: Some(json!(42)),
            sub_kind: Some(JsonSubKind::Equals),
            decode: None,
            then_path: None,
        };
        let body = json!({"data": {"id": 42}});
        let outcome = validate_one(&rule, &envelope(200, body, 10), &Scope::new());
        assert!(outcome.passed);
    }

    #[test]
    fn json_equals_rule_is_numeric_aware() {
        let rule = ValidateRule {
            kind: ValidateKind::Json,
            path: Some("$.data.id".into()),
            expr: None,
            expected: Some(json!(2.0)),
            sub_kind: Some(JsonSubKind::Equals),
            decode: None,
            then_path: None,
        };
        let body = json!({"data": {"id": 2}});
        let outcome = validate_one(&rule, &envelope(200, body, 10), &Scope::new());
        assert!(outcome.passed, "{:?}", outcome.error);
    }

    #[test]
    fn json_equals_rule_substitutes_expected_template() {
        let mut scope = Scope::new();
        scope.set("token", Value::String("abc123".into()));
        let rule = ValidateRule {
            kind: ValidateKind::Json,
            path: Some("$.data.token".into()),
            expr: None,
            expected: Some(json!("{{token}}")),
            sub_kind: Some(JsonSubKind::Equals),
            decode: None,
            then_path: None,
        };
        let body = json!({"data": {"token": "abc123"}});
        let outcome = validate_one(&rule, &envelope(200, body, 10), &scope);
        assert!(outcome.passed, "{:?}", outcome.error);
    }

    #[test]
    fn json_decode_base64json_chain() {
        let inner = json!({"status": "ok"});
        let encoded = BASE64.encode(inner.to_string());
        let body = json!({"payload": encoded});
        let rule = ValidateRule {
            kind: ValidateKind::Json,
            path: Some("$.payload".into()),
            expr: None,
            expected: Some(json!("ok")),
            sub_kind: Some(JsonSubKind::Equals),
            decode: Some("base64json".into()),
            then_path: Some("$.status".into()),
        };
        let outcome = validate_one(&rule, &envelope(200, body, 10), &Scope::new());
        assert!(outcome.passed, "{:?}", outcome.error);
    }

    #[test]
    fn xml_rule_is_not_implemented() {
        let rule = ValidateRule {
            kind: ValidateKind::Xml,
            path: Some("/a/b".into()),
            expr: None,
            expected: None,
            sub_kind: None,
            decode: None,
            then_path: None,
        };
        let outcome = validate_one(&rule, &envelope(200, Value::Null, 1), &Scope::new());
        assert!(!outcome.passed);
        assert!(outcome.error.unwrap().contains("not implemented"));
    }
}
