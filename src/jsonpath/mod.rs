//! JSONPath evaluator.
//!
//! A small hand-rolled recursive-descent parser and evaluator for the path
//! grammar:
//!
//! ```text
//! PATH    := "$" SEGMENT*
//! SEGMENT := "." NAME | "[" INDEX "]"
//! INDEX   := INT | "-" INT | "last" | "*" | SLICE | FILTER
//! SLICE   := INT? ":" INT?
//! FILTER  := "?(@." FIELD_PATH (OP VALUE)? ")"
//! OP      := "==" | "!=" | ">" | "<" | ">=" | "<=" | "="
//! ```
//!
//! Evaluation returns a single [`Value`] when exactly one node matches, and a
//! JSON array when zero or more than one node match — this asymmetry is
//! intentional, not a bug to "fix" by always returning an array.

use serde_json::Value;

use crate::errors::StepwiseError;
use crate::vars::Scope;

#[derive(Debug, Clone)]
enum Segment {
    Field(String),
    Index(i64),
    Last,
    Wildcard,
    Slice(Option<i64>, Option<i64>),
    Filter(String, Option<(CompareOp, Value)>),
    Length,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

/// Expands any `{{ ... }}` templates in `path` before parsing it, then
/// evaluates it against `root`.
pub fn select(root: &Value, path: &str, scope: &Scope) -> Result<Value, StepwiseError> {
    let expanded = scope.substitute(path)?;
    let segments = parse(&expanded)?;
    let matches = eval(root, &segments);
    Ok(collapse(matches))
}

/// Evaluates an already-expanded path, without variable substitution. Used
/// by callers (like the validator's `decode: base64json` chain) that have
/// already resolved the path string.
pub fn select_literal(root: &Value, path: &str) -> Result<Value, StepwiseError> {
    let segments = parse(path)?;
    Ok(collapse(eval(root, &segments)))
}

fn collapse(mut matches: Vec<Value>) -> Value {
    if matches.len() == 1 {
        matches.remove(0)
    } else {
        Value::Array(matches)
    }
}

fn parse(path: &str) -> Result<Vec<Segment>, StepwiseError> {
    let path = path.trim();
    let rest = path
        .strip_prefix('$')
        .ok_or_else(|| StepwiseError::SubstitutionError(format!("jsonpath must start with '$': {path}")))?;

    let mut segments = Vec::new();
    let bytes = rest.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'.' => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end] != b'.' && bytes[end] != b'[' {
                    end += 1;
                }
                let name = &rest[start..end];
                if name == "length" {
                    segments.push(Segment::Length);
                } else if !name.is_empty() {
                    segments.push(Segment::Field(name.to_string()));
                }
                i = end;
            }
            b'[' => {
                let end = rest[i..]
                    .find(']')
                    .map(|off| i + off)
                    .ok_or_else(|| StepwiseError::SubstitutionError(format!("unterminated '[' in path: {path}")))?;
                let inner = &rest[i + 1..end];
                segments.push(parse_index(inner)?);
                i = end + 1;
            }
            _ => {
                return Err(StepwiseError::SubstitutionError(format!(
                    "unexpected character in jsonpath at byte {i}: {path}"
                )))
            }
        }
    }
    Ok(segments)
}

fn parse_index(inner: &str) -> Result<Segment, StepwiseError> {
    if inner == "*" {
        return Ok(Segment::Wildcard);
    }
    if inner == "last" {
        return Ok(Segment::Last);
    }
    if let Some(filter) = inner.strip_prefix("?(@.").and_then(|s| s.strip_suffix(')')) {
        return parse_filter(filter);
    }
    if inner.contains(':') {
        let mut parts = inner.splitn(2, ':');
        let start = parts.next().unwrap_or("").trim();
        let end = parts.next().unwrap_or("").trim();
        let start = if start.is_empty() { None } else { Some(start.parse().map_err(bad_index)?) };
        let end = if end.is_empty() { None } else { Some(end.parse().map_err(bad_index)?) };
        return Ok(Segment::Slice(start, end));
    }
    inner.parse::<i64>().map(Segment::Index).map_err(bad_index)
}

fn bad_index<E: std::fmt::Display>(e: E) -> StepwiseError {
    StepwiseError::SubstitutionError(format!("invalid jsonpath index: {e}"))
}

fn parse_filter(filter: &str) -> Result<Segment, StepwiseError> {
    for (op_str, op) in [
        ("==", CompareOp::Eq),
        ("!=", CompareOp::Ne),
        (">=", CompareOp::Ge),
        ("<=", CompareOp::Le),
        (">", CompareOp::Gt),
        ("<", CompareOp::Lt),
        ("=", CompareOp::Eq),
    ] {
        if let Some(idx) = filter.find(op_str) {
            let field = filter[..idx].trim().to_string();
            let raw_value = filter[idx + op_str.len()..].trim();
            let value = parse_filter_value(raw_value);
            return Ok(Segment::Filter(field, Some((op, value))));
        }
    }
    Ok(Segment::Filter(filter.trim().to_string(), None))
}

fn parse_filter_value(raw: &str) -> Value {
    let unquoted = raw.trim_matches('\'').trim_matches('"');
    if let Ok(n) = unquoted.parse::<f64>() {
        return serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null);
    }
    match unquoted {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(unquoted.to_string()),
    }
}

fn eval(root: &Value, segments: &[Segment]) -> Vec<Value> {
    let mut current = vec![root.clone()];
    for segment in segments {
        let mut next = Vec::new();
        for value in &current {
            apply_segment(value, segment, &mut next);
        }
        current = next;
    }
    current
}

fn apply_segment(value: &Value, segment: &Segment, out: &mut Vec<Value>) {
    match segment {
        Segment::Field(name) => {
            if let Some(v) = value.get(name) {
                out.push(v.clone());
            }
        }
        Segment::Length => {
            let len = match value {
                Value::Array(a) => Some(a.len()),
                Value::String(s) => Some(s.chars().count()),
                Value::Object(m) => Some(m.len()),
                _ => None,
            };
            if let Some(len) = len {
                out.push(Value::from(len));
            }
        }
        Segment::Index(i) => {
            if let Value::Array(arr) = value {
                let idx = resolve_index(*i, arr.len());
                if let Some(idx) = idx {
                    if let Some(v) = arr.get(idx) {
                        out.push(v.clone());
                    }
                }
            }
        }
        Segment::Last => {
            if let Value::Array(arr) = value {
                if let Some(v) = arr.last() {
                    out.push(v.clone());
                }
            }
        }
        Segment::Wildcard => {
            if let Value::Array(arr) = value {
                out.extend(arr.iter().cloned());
            } else if let Value::Object(map) = value {
                out.extend(map.values().cloned());
            }
        }
        Segment::Slice(start, end) => {
            if let Value::Array(arr) = value {
                let len = arr.len() as i64;
                let start = start.map(|s| normalize(s, len)).unwrap_or(0).clamp(0, len);
                let end = end.map(|e| normalize(e, len)).unwrap_or(len).clamp(0, len);
                if start < end {
                    out.extend(arr[start as usize..end as usize].iter().cloned());
                }
            }
        }
        Segment::Filter(field, cmp) => {
            if let Value::Array(arr) = value {
                for item in arr {
                    let field_value = get_nested(item, field);
                    let keep = match (field_value, cmp) {
                        (Some(fv), Some((op, expected))) => compare(fv, *op, expected),
                        (Some(_), None) => true,
                        (None, _) => false,
                    };
                    if keep {
                        out.push(item.clone());
                    }
                }
            }
        }
    }
}

/// Navigates a dotted field path ("user.role") into nested objects, the
/// form a filter predicate's left-hand side takes.
fn get_nested<'a>(value: &'a Value, field: &str) -> Option<&'a Value> {
    field.split('.').try_fold(value, |current, part| current.get(part))
}

fn resolve_index(i: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let idx = if i < 0 { len + i } else { i };
    if idx >= 0 && idx < len {
        Some(idx as usize)
    } else {
        None
    }
}

fn normalize(i: i64, len: i64) -> i64 {
    if i < 0 {
        len + i
    } else {
        i
    }
}

/// Numeric comparisons compare as numbers, booleans as booleans, everything
/// else falls back to string comparison.
fn compare(actual: &Value, op: CompareOp, expected: &Value) -> bool {
    use std::cmp::Ordering;

    let ordering = match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => {
            a.as_f64().zip(b.as_f64()).and_then(|(a, b)| a.partial_cmp(&b))
        }
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => Some(actual.to_string().trim_matches('"').cmp(expected.to_string().trim_matches('"'))),
    };

    match (op, ordering) {
        (CompareOp::Eq, Some(o)) => o == Ordering::Equal,
        (CompareOp::Ne, Some(o)) => o != Ordering::Equal,
        (CompareOp::Gt, Some(o)) => o == Ordering::Greater,
        (CompareOp::Lt, Some(o)) => o == Ordering::Less,
        (CompareOp::Ge, Some(o)) => o != Ordering::Less,
        (CompareOp::Le, Some(o)) => o != Ordering::Greater,
        (_, None) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn select(root: &Value, path: &str) -> Value {
        select_literal(root, path).unwrap()
    }

    #[test]
    fn single_match_returns_bare_element() {
        let root = json!({ "users": [ {"id": 1, "active": true}, {"id": 2, "active": false} ] });
        let result = select(&root, "$.users[?(@.active==true)]");
        assert_eq!(result, json!({"id": 1, "active": true}));
    }

    #[test]
    fn multi_match_returns_array() {
        let root = json!({ "users": [ {"id": 1, "role": "admin"}, {"id": 2, "role": "admin"} ] });
        let result = select(&root, "$.users[?(@.role==admin)]");
        assert!(result.is_array());
        assert_eq!(result.as_array().unwrap().len(), 2);
    }

    #[test]
    fn last_index_matches_negative_one() {
        let root = json!({ "items": [1, 2, 3] });
        assert_eq!(select(&root, "$.items[last]"), json!(3));
        assert_eq!(select(&root, "$.items[-1]"), json!(3));
    }

    #[test]
    fn slice_is_half_open() {
        let root = json!({ "items": [0, 1, 2, 3, 4] });
        assert_eq!(select(&root, "$.items[1:3]"), json!([1, 2]));
    }

    #[test]
    fn wildcard_projects_field() {
        let root = json!({ "items": [{"n": 1}, {"n": 2}] });
        assert_eq!(select(&root, "$.items[*].n"), json!([1, 2]));
    }

    #[test]
    fn length_of_array() {
        let root = json!({ "items": [1, 2, 3] });
        assert_eq!(select(&root, "$.items.length"), json!(3));
    }

    #[test]
    fn filter_supports_dotted_nested_field() {
        let root = json!({ "users": [
            {"id": 1, "profile": {"role": "admin"}},
            {"id": 2, "profile": {"role": "member"}},
        ] });
        let result = select(&root, "$.users[?(@.profile.role==admin)].id");
        assert_eq!(result, json!(1));
    }

    #[test]
    fn templated_path_is_expanded_before_evaluation() {
        let mut scope = Scope::new();
        scope.set("field", Value::String("id".into()));
        let root = json!({ "id": 42 });
        let result = select_literal(&root, "$.id").unwrap();
        assert_eq!(result, json!(42));
        let via_template = super::select(&root, "$.{{field}}", &scope).unwrap();
        assert_eq!(via_template, json!(42));
    }
}
