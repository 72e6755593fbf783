//! Workflow document data model.
//!
//! A workflow document is the thing a user hands to `stepwise run`: a tree of
//! steps and groups plus the variables and imports that feed them. Documents are
//! read as either YAML or JSON, auto-detected (see [`load`]).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

use crate::errors::StepwiseError;

/// Top-level workflow document. The same shape doubles as a component
/// document when loaded through an `import` ("Component": identical shape to
/// a workflow plus a `type` tag) — entry workflows simply leave
/// `component_type`/`step` unset.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Workflow {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub imports: Vec<Import>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub groups: Vec<StepGroup>,
    /// Names of variables that should be copied into the orchestrator's final
    /// report, regardless of which step captured them.
    #[serde(default)]
    pub captures: Vec<String>,
    /// `type` tag on a component document. Absent on an entry workflow,
    /// where it has no meaning.
    #[serde(default, rename = "type")]
    pub component_type: Option<ComponentType>,
    /// The single step of a `type: step` component document.
    #[serde(default)]
    pub step: Option<Step>,
}

/// The three shapes an imported component document can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentType {
    Step,
    Group,
    Workflow,
}

/// A reference to another document, inlined at resolve time.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Import {
    pub path: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub overrides: HashMap<String, Value>,
}

/// A reusable step template, made available via `use`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Component {
    pub name: String,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    pub step: Step,
}

/// One request envelope, carried by a `request`-kind step.
/// Fields are grouped by the protocol that reads them; only `protocol` and
/// `timeout` are common to all four.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Request {
    pub protocol: Protocol,
    #[serde(default)]
    pub timeout: Option<String>,

    // http
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub query_params: HashMap<String, String>,
    #[serde(default)]
    pub auth: Option<HttpAuth>,

    // grpc
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub rpc_method: Option<String>,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub data: Option<Value>,

    // db
    #[serde(default)]
    pub dsn: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub query: Option<String>,

    // mcp
    #[serde(default)]
    pub mcp_transport: Option<McpTransport>,
    #[serde(default)]
    pub mcp_method: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

/// HTTP auth shorthand. A bearer token or basic
/// credentials, substituted like any other request field before use.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpAuth {
    Bearer { token: String },
    Basic { username: String, password: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Grpc,
    Db,
    Mcp,
}

impl Default for Protocol {
    fn default() -> Self {
        Self::Http
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum McpTransport {
    Stdio,
    Http,
}

/// A validation rule attached to a step.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ValidateRule {
    pub kind: ValidateKind,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub expr: Option<String>,
    #[serde(default)]
    pub expected: Option<Value>,
    #[serde(default)]
    pub sub_kind: Option<JsonSubKind>,
    #[serde(default)]
    pub decode: Option<String>,
    #[serde(default)]
    pub then_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidateKind {
    Status,
    Time,
    Json,
    Xml,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonSubKind {
    Equals,
    Contains,
    Type,
    Greater,
    Less,
    Pattern,
    Nil,
    Empty,
    Len,
}

/// Where a captured value is read from, and under what name it's stored.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Capture {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub decode: Option<String>,
}

/// Repeat discipline.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Repeat {
    pub count: u32,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub delay: Option<String>,
    /// Per-iteration variable overrides, substituted against the derived
    /// scope before each iteration runs.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
}

/// Poll discipline.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Poll {
    pub until: Vec<ValidateRule>,
    pub max_attempts: u32,
    pub interval: String,
}

/// One entry in a `branches` list.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Branch {
    pub condition: String,
    #[serde(default)]
    pub priority: i64,
    pub steps: Vec<Step>,
}

/// A step, the atomic unit of work. The union of possible
/// shapes (request / wait / print / use / if-then-else / branches) is
/// expressed as optional fields rather than an enum, since a step also
/// carries the cross-cutting fields (condition, retry, capture, ...) shared
/// by every kind.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Step {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,

    #[serde(default)]
    pub request: Option<Request>,
    #[serde(default)]
    pub wait: Option<String>,
    #[serde(default)]
    pub print: Option<String>,
    #[serde(default, rename = "use")]
    pub use_component: Option<String>,
    #[serde(default, rename = "if")]
    pub if_condition: Option<String>,
    #[serde(default)]
    pub then: Vec<Step>,
    #[serde(default, rename = "else")]
    pub otherwise: Vec<Step>,
    #[serde(default)]
    pub branches: Vec<Branch>,

    #[serde(default)]
    pub retry: u32,
    #[serde(default)]
    pub retry_delay: Option<String>,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub repeat: Option<Repeat>,
    #[serde(default)]
    pub poll: Option<Poll>,
    #[serde(default)]
    pub validate: Vec<ValidateRule>,
    #[serde(default)]
    pub capture: Vec<Capture>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub show_response: bool,
}

/// A named collection of steps, sequential or parallel.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StepGroup {
    pub name: String,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub groups: Vec<StepGroup>,
}

impl Workflow {
    /// Counts every step reachable in the document tree: root steps, group
    /// members (recursing into nested groups), and the `then`/`otherwise`/
    /// `branches` children a step carries inline. Used to enforce
    /// [`crate::limits::ExecutionLimits::max_steps`] before a run starts.
    pub fn step_count(&self) -> usize {
        self.steps.iter().map(Step::tree_size).sum::<usize>() + self.groups.iter().map(StepGroup::tree_size).sum::<usize>()
    }

    /// Sums every step's `retry` count across the whole tree — the
    /// worst-case number of retry attempts the plan could spend, checked
    /// against [`crate::limits::ExecutionLimits::max_retries_total`].
    pub fn total_retry_budget(&self) -> u32 {
        self.steps.iter().map(Step::retry_budget).sum::<u32>() + self.groups.iter().map(StepGroup::retry_budget).sum::<u32>()
    }
}

impl Step {
    fn tree_size(&self) -> usize {
        1 + self.then.iter().map(Step::tree_size).sum::<usize>()
            + self.otherwise.iter().map(Step::tree_size).sum::<usize>()
            + self.branches.iter().flat_map(|b| b.steps.iter()).map(Step::tree_size).sum::<usize>()
    }

    fn retry_budget(&self) -> u32 {
        self.retry
            + self.then.iter().map(Step::retry_budget).sum::<u32>()
            + self.otherwise.iter().map(Step::retry_budget).sum::<u32>()
            + self.branches.iter().flat_map(|b| b.steps.iter()).map(Step::retry_budget).sum::<u32>()
    }
}

impl StepGroup {
    fn tree_size(&self) -> usize {
        self.steps.iter().map(Step::tree_size).sum::<usize>() + self.groups.iter().map(StepGroup::tree_size).sum::<usize>()
    }

    fn retry_budget(&self) -> u32 {
        self.steps.iter().map(Step::retry_budget).sum::<u32>() + self.groups.iter().map(StepGroup::retry_budget).sum::<u32>()
    }
}

/// Reads a workflow document from disk, auto-detecting YAML vs. JSON by
/// extension first and by content as a fallback.
pub fn load(path: &Path) -> Result<Workflow, StepwiseError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| StepwiseError::ParseError(format!("reading {}: {e}", path.display())))?;
    parse(&raw, path.extension().and_then(|e| e.to_str()))
}

pub fn parse(raw: &str, extension_hint: Option<&str>) -> Result<Workflow, StepwiseError> {
    let looks_like_json = raw.trim_start().starts_with(['{', '[']);
    let try_yaml_first = matches!(extension_hint, Some("yaml") | Some("yml")) || !looks_like_json;

    let parse_yaml = || {
        serde_yaml::from_str::<Workflow>(raw)
            .map_err(|e| StepwiseError::ParseError(format!("invalid YAML workflow: {e}")))
    };
    let parse_json = || {
        serde_json::from_str::<Workflow>(raw)
            .map_err(|e| StepwiseError::ParseError(format!("invalid JSON workflow: {e}")))
    };

    if try_yaml_first {
        parse_yaml().or_else(|_| parse_json())
    } else {
        parse_json().or_else(|_| parse_yaml())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_json_by_leading_brace() {
        let doc = parse(r#"{"name": "demo", "steps": []}"#, None).unwrap();
        assert_eq!(doc.name, "demo");
    }

    #[test]
    fn detects_yaml_by_default() {
        let doc = parse("name: demo\nsteps: []\n", None).unwrap();
        assert_eq!(doc.name, "demo");
    }

    #[test]
    fn step_count_recurses_into_groups_and_branches() {
        let doc = Workflow {
            steps: vec![Step {
                if_condition: Some("true".into()),
                then: vec![Step::default()],
                otherwise: vec![Step::default()],
                ..Default::default()
            }],
            groups: vec![StepGroup { steps: vec![Step::default(), Step::default()], ..Default::default() }],
            ..Default::default()
        };
        assert_eq!(doc.step_count(), 5);
    }

    #[test]
    fn total_retry_budget_sums_every_step() {
        let doc = Workflow {
            steps: vec![Step { retry: 3, ..Default::default() }],
            groups: vec![StepGroup { steps: vec![Step { retry: 2, ..Default::default() }], ..Default::default() }],
            ..Default::default()
        };
        assert_eq!(doc.total_retry_budget(), 5);
    }

    #[test]
    fn parses_full_step_shape() {
        let yaml = r#"
name: demo
steps:
  - name: login
    request:
      protocol: http
      method: POST
      url: "{{base_url}}/login"
    capture:
      - name: token
        path: "$.data.token"
    validate:
      - kind: status
        expected: 200
"#;
        let doc = parse(yaml, Some("yaml")).unwrap();
        assert_eq!(doc.steps.len(), 1);
        let step = &doc.steps[0];
        assert_eq!(step.capture[0].name, "token");
        assert_eq!(step.validate[0].kind, ValidateKind::Status);
    }
}
