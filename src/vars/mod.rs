//! Variable Manager.
//!
//! A [`Scope`] is a flat `name -> Value` map. `Substitute` walks `{{ ... }}`
//! templates in a string and resolves each one against three namespaces —
//! `utils.*`, `faker.*`, and plain/`env.*` variable lookups — repeating to a
//! fixpoint so that a captured value which itself contains a template gets
//! fully expanded (bounded at [`MAX_SUBSTITUTION_ROUNDS`]).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use fake::faker::address::en::{CityName, StreetName};
use fake::faker::company::en::CompanyName;
use fake::faker::internet::en::SafeEmail;
use fake::faker::lorem::en::{Paragraph, Sentence};
use fake::faker::name::en::Name;
use fake::faker::phone_number::en::PhoneNumber;
use fake::Fake;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::errors::StepwiseError;

/// Caps fixpoint expansion so a variable that (incorrectly) references
/// itself can't loop forever.
pub const MAX_SUBSTITUTION_ROUNDS: u32 = 10;

static TEMPLATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([a-zA-Z0-9_.:\-]+(?:\([^)]*\))?)\s*\}\}").expect("template regex"));

/// The Variable Manager: a single flat mapping, read and written by every
/// step in a workflow execution.
#[derive(Debug, Default, Clone)]
pub struct Scope {
    values: HashMap<String, Value>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_all(&self) -> &HashMap<String, Value> {
        &self.values
    }

    pub fn delete(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn extend(&mut self, entries: &HashMap<String, Value>) {
        for (k, v) in entries {
            self.values.insert(k.clone(), v.clone());
        }
    }

    /// Derives a child scope for one `repeat` iteration, seeded with `index`
    /// and `iteration`.
    pub fn derive_for_iteration(&self, index: u32) -> Self {
        let mut child = self.clone();
        child.set("index", Value::from(index));
        child.set("iteration", Value::from(index + 1));
        child
    }

    /// Expands every `{{ ... }}` template in `input`, re-scanning the result
    /// until it stops changing or [`MAX_SUBSTITUTION_ROUNDS`] is hit.
    pub fn substitute(&self, input: &str) -> Result<String, StepwiseError> {
        let mut current = input.to_string();
        for _ in 0..MAX_SUBSTITUTION_ROUNDS {
            let next = self.substitute_once(&current)?;
            if next == current {
                return Ok(next);
            }
            current = next;
        }
        Ok(current)
    }

    fn substitute_once(&self, input: &str) -> Result<String, StepwiseError> {
        let mut out = String::new();
        let mut last = 0;
        for cap in TEMPLATE_RE.captures_iter(input) {
            let whole = cap.get(0).unwrap();
            out.push_str(&input[last..whole.start()]);
            let token = cap.get(1).unwrap().as_str();
            out.push_str(&self.resolve_token(token)?);
            last = whole.end();
        }
        out.push_str(&input[last..]);
        Ok(out)
    }

    fn resolve_token(&self, token: &str) -> Result<String, StepwiseError> {
        if let Some(rest) = token.strip_prefix("utils.") {
            let rest = self.substitute(rest)?;
            return resolve_utils(&rest);
        }
        if let Some(rest) = token.strip_prefix("faker.") {
            let rest = self.substitute(rest)?;
            return Ok(resolve_faker(&rest));
        }
        if let Some(name) = token.strip_prefix("env.") {
            return match std::env::var(name) {
                Ok(v) => Ok(v),
                Err(_) => {
                    tracing::warn!(variable = name, "substitution: env var not set, using literal");
                    Ok(format!("{{{{{token}}}}}"))
                }
            };
        }
        match self.values.get(token) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Ok(other.to_string()),
            None => {
                tracing::warn!(variable = token, "substitution: variable not set, using literal");
                Ok(format!("{{{{{token}}}}}"))
            }
        }
    }

    /// Expands templates in every key and value of a JSON object, keys
    /// first then values, repeating until stable.
    pub fn substitute_map(&self, input: &Value) -> Result<Value, StepwiseError> {
        match input {
            Value::Object(map) => {
                let mut stable = Value::Object(map.clone());
                for _ in 0..MAX_SUBSTITUTION_ROUNDS {
                    let next = self.substitute_map_once(&stable)?;
                    if next == stable {
                        return Ok(next);
                    }
                    stable = next;
                }
                Ok(stable)
            }
            other => self.substitute_value(other),
        }
    }

    fn substitute_map_once(&self, input: &Value) -> Result<Value, StepwiseError> {
        let Value::Object(map) = input else {
            return self.substitute_value(input);
        };
        let mut new_map = Map::with_capacity(map.len());
        for (k, v) in map {
            let new_key = self.substitute(k)?;
            let new_value = self.substitute_value(v)?;
            new_map.insert(new_key, new_value);
        }
        Ok(Value::Object(new_map))
    }

    /// Expands templates inside every string in a JSON array, recursively.
    pub fn substitute_slice(&self, items: &[Value]) -> Result<Vec<Value>, StepwiseError> {
        items.iter().map(|item| self.substitute_value(item)).collect()
    }

    /// Recursively expands templates inside any JSON value.
    pub fn substitute_value(&self, value: &Value) -> Result<Value, StepwiseError> {
        match value {
            Value::String(s) => Ok(Value::String(self.substitute(s)?)),
            Value::Array(items) => Ok(Value::Array(self.substitute_slice(items)?)),
            Value::Object(_) => self.substitute_map(value),
            _ => Ok(value.clone()),
        }
    }
}

fn resolve_utils(rest: &str) -> Result<String, StepwiseError> {
    let (name, arg) = split_call(rest);
    match name {
        "base64" => Ok(BASE64.encode(arg.unwrap_or_default())),
        "base64_decode" => {
            let input = arg.unwrap_or_default();
            let decoded = BASE64.decode(input).ok().and_then(|bytes| String::from_utf8(bytes).ok());
            match decoded {
                Some(s) => Ok(s),
                None => {
                    tracing::warn!(input, "utils.base64_decode: malformed input, substituting empty string");
                    Ok(String::new())
                }
            }
        }
        "sha256" => {
            let mut hasher = Sha256::new();
            hasher.update(arg.unwrap_or_default().as_bytes());
            Ok(format!("{:x}", hasher.finalize()))
        }
        other => Err(StepwiseError::SubstitutionError(format!("unknown utils function '{other}'"))),
    }
}

fn resolve_faker(rest: &str) -> String {
    let (name, arg) = split_call(rest);
    match name {
        "name" => Name().fake(),
        "email" => SafeEmail().fake(),
        "phone" => PhoneNumber().fake(),
        "address" => format!("{} {}", StreetName().fake::<String>(), CityName().fake::<String>()),
        "company" => CompanyName().fake(),
        "uuid" => uuid::Uuid::new_v4().to_string(),
        "sentence" => Sentence(5..10).fake(),
        "paragraph" => Paragraph(3..6).fake(),
        "sha" => {
            let mut hasher = Sha256::new();
            hasher.update(uuid::Uuid::new_v4().as_bytes());
            format!("{:x}", hasher.finalize())
        }
        "date" => chrono::Utc::now().to_rfc3339(),
        "number" => {
            let (min, max) = parse_number_range(arg);
            rand::thread_rng().gen_range(min..=max).to_string()
        }
        _ => format!("{{{{faker.{rest}}}}}"),
    }
}

fn parse_number_range(arg: Option<&str>) -> (i64, i64) {
    let default = (1, 100);
    let Some(arg) = arg else { return default };
    let mut parts = arg.split(',').map(|p| p.trim().parse::<i64>());
    match (parts.next(), parts.next()) {
        (Some(Ok(min)), Some(Ok(max))) => (min, max),
        _ => default,
    }
}

/// Splits `fn(arg)` into `("fn", Some("arg"))`, or `fn` into `("fn", None)`.
fn split_call(token: &str) -> (&str, Option<&str>) {
    if let Some(open) = token.find('(') {
        if let Some(close) = token.rfind(')') {
            if close > open {
                return (&token[..open], Some(&token[open + 1..close]));
            }
        }
    }
    (token, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_plain_variable() {
        let mut scope = Scope::new();
        scope.set("name", Value::String("alice".into()));
        assert_eq!(scope.substitute("hello {{name}}").unwrap(), "hello alice");
    }

    #[test]
    fn missing_variable_keeps_literal_with_warning() {
        let scope = Scope::new();
        assert_eq!(scope.substitute("hi {{missing}}").unwrap(), "hi {{missing}}");
    }

    #[test]
    fn env_namespace_reads_process_env() {
        std::env::set_var("STEPWISE_TEST_VAR", "value123");
        let scope = Scope::new();
        assert_eq!(scope.substitute("{{env.STEPWISE_TEST_VAR}}").unwrap(), "value123");
    }

    #[test]
    fn utils_base64_roundtrips() {
        let scope = Scope::new();
        let encoded = scope.substitute("{{utils.base64(hello)}}").unwrap();
        assert_eq!(encoded, BASE64.encode("hello"));
    }

    #[test]
    fn missing_env_var_keeps_literal_with_warning() {
        let scope = Scope::new();
        let result = scope.substitute("{{env.STEPWISE_DEFINITELY_UNSET_VAR}}").unwrap();
        assert_eq!(result, "{{env.STEPWISE_DEFINITELY_UNSET_VAR}}");
    }

    #[test]
    fn utils_arg_expands_nested_template_first() {
        let mut scope = Scope::new();
        scope.set("name", Value::String("hello".into()));
        let encoded = scope.substitute("{{utils.base64({{name}})}}").unwrap();
        assert_eq!(encoded, BASE64.encode("hello"));
    }

    #[test]
    fn malformed_base64_decode_yields_empty_string() {
        let scope = Scope::new();
        assert_eq!(scope.substitute("{{utils.base64_decode(not-valid-base64!!)}}").unwrap(), "");
    }

    #[test]
    fn faker_number_respects_range() {
        let scope = Scope::new();
        let s = scope.substitute("{{faker.number(5,5)}}").unwrap();
        assert_eq!(s, "5");
    }

    #[test]
    fn substitution_is_idempotent_fixpoint() {
        let mut scope = Scope::new();
        scope.set("a", Value::String("b".into()));
        scope.set("b", Value::String("c".into()));
        let once = scope.substitute("{{a}}").unwrap();
        let twice = scope.substitute(&once).unwrap();
        // Substitute(Substitute(s)) == Substitute(s): further substitution of
        // an already-resolved literal string is a no-op.
        assert_eq!(once, twice);
    }

    #[test]
    fn substitute_map_expands_keys_then_values() {
        let mut scope = Scope::new();
        scope.set("k", Value::String("real_key".into()));
        scope.set("v", Value::String("real_value".into()));
        let input = serde_json::json!({ "{{k}}": "{{v}}" });
        let out = scope.substitute_map(&input).unwrap();
        assert_eq!(out, serde_json::json!({ "real_key": "real_value" }));
    }
}
