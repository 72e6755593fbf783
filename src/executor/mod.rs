//! Step Executor.
//!
//! Walks a single [`Step`] through condition check, control-flow dispatch
//! (`use` / `if-then-else` / `branches` / `wait` / `print` / `request`),
//! then — for request steps — substitution, transport dispatch, validation
//! and capture, wrapped in whichever of retry/poll/repeat the step declares.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::condition;
use crate::document::{Branch, Capture, Component, Repeat, Step};
use crate::errors::StepwiseError;
use crate::limits::{ExecutionLimits, RetryCounter};
use crate::transport::TransportRegistry;
use crate::validator::{self, ResponseEnvelope, ValidationOutcome};
use crate::vars::Scope;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

const DEFAULT_TIMEOUT_MS: f64 = 30_000.0;
const DEFAULT_RETRY_DELAY_MS: f64 = 0.0;
const DEFAULT_POLL_INTERVAL_MS: f64 = 1_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Passed,
    Failed,
    Skipped,
}

/// The outcome of running one step, including its nested attempts — `repeat`
/// iterations, the branch/use/then-else step it delegated to, and so on.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub name: Option<String>,
    pub status: StepStatus,
    pub validations: Vec<ValidationOutcome>,
    pub error: Option<String>,
    pub duration: Duration,
    pub response: Option<Value>,
    pub children: Vec<StepReport>,
}

impl StepReport {
    fn passed(name: Option<String>, duration: Duration) -> Self {
        Self { name, status: StepStatus::Passed, validations: Vec::new(), error: None, duration, response: None, children: Vec::new() }
    }

    fn skipped(name: Option<String>) -> Self {
        Self { name, status: StepStatus::Skipped, validations: Vec::new(), error: None, duration: Duration::ZERO, response: None, children: Vec::new() }
    }

    fn failed(name: Option<String>, error: impl Into<String>, duration: Duration) -> Self {
        Self { name, status: StepStatus::Failed, validations: Vec::new(), error: Some(error.into()), duration, response: None, children: Vec::new() }
    }

    pub fn all_passed(&self) -> bool {
        self.status == StepStatus::Passed && self.children.iter().all(StepReport::all_passed)
    }
}

/// Runs steps against a fixed transport registry, component table and
/// resource limits. Cheaply `Clone`-able — the state is shared across
/// `JoinSet` tasks via `Arc` — so a parallel `repeat` can hand each
/// iteration its own owned handle.
#[derive(Clone)]
pub struct Executor {
    pub transports: Arc<TransportRegistry>,
    pub components: Arc<HashMap<String, Component>>,
    pub limits: Arc<ExecutionLimits>,
    /// Bounds how many parallel `repeat` iterations (and, via the
    /// orchestrator sharing this executor, parallel group members) run at
    /// once, across the whole plan — not just within one step.
    pub parallel_gate: Arc<Semaphore>,
    /// Plan-wide retry budget. Every retry attempt across every step draws
    /// from the same counter, so a workflow with many retrying steps can't
    /// collectively exceed `max_retries_total` even though each step stays
    /// under its own `retry` count.
    pub retry_counter: Arc<RetryCounter>,
}

impl Executor {
    pub fn new(transports: Arc<TransportRegistry>, components: Arc<HashMap<String, Component>>, limits: Arc<ExecutionLimits>) -> Self {
        let parallel_gate = Arc::new(Semaphore::new(limits.max_parallel.max(1)));
        let retry_counter = Arc::new(RetryCounter::new(limits.max_retries_total));
        Self { transports, components, limits, parallel_gate, retry_counter }
    }

    /// Executes one step against `scope`, mutating it in place with any
    /// captures. Never returns `Err` — failures are reported as
    /// [`StepStatus::Failed`] so the orchestrator can decide whether to halt.
    #[tracing::instrument(name = "step", skip_all, fields(step.name = step.name.as_deref().unwrap_or("<unnamed>")))]
    pub async fn execute(&self, step: &Step, scope: &mut Scope) -> StepReport {
        let start = std::time::Instant::now();

        if let Some(condition) = &step.condition {
            match condition::evaluate(condition, scope) {
                Ok(true) => {}
                Ok(false) => return StepReport::skipped(step.name.clone()),
                Err(e) => return StepReport::failed(step.name.clone(), e.to_string(), start.elapsed()),
            }
        }

        if !step.variables.is_empty() {
            match scope.substitute_map(&Value::Object(step.variables.clone().into_iter().collect())) {
                Ok(Value::Object(map)) => {
                    for (k, v) in map {
                        scope.set(k, v);
                    }
                }
                Ok(_) => {}
                Err(e) => return StepReport::failed(step.name.clone(), e.to_string(), start.elapsed()),
            }
        }

        let mut report = self.dispatch(step, scope).await;
        report.duration = start.elapsed();
        report
    }

    async fn dispatch(&self, step: &Step, scope: &mut Scope) -> StepReport {
        if let Some(reference) = &step.use_component {
            return self.run_use(step, reference, scope).await;
        }
        if let Some(if_condition) = &step.if_condition {
            return self.run_if(step, if_condition, scope).await;
        }
        if !step.branches.is_empty() {
            return self.run_branches(step, scope).await;
        }
        if let Some(wait) = &step.wait {
            return self.run_wait(step, wait, scope).await;
        }
        if let Some(print) = &step.print {
            return self.run_print(step, print, scope);
        }
        if step.request.is_some() {
            return self.run_request_step(step, scope).await;
        }
        // A step with none of the above is a no-op (e.g. variables-only).
        StepReport::passed(step.name.clone(), Duration::ZERO)
    }

    /// Runs the component's step with the caller's shadowing fields
    /// overlaid. `capture`/`validate` shadow when non-empty, the `Option`
    /// fields shadow when `Some`, and `show_response` shadows only when the
    /// caller sets it `true` (a plain `bool` has no way to say "unset").
    async fn run_use(&self, step: &Step, reference: &str, scope: &mut Scope) -> StepReport {
        let Some(component) = self.components.get(reference) else {
            return StepReport::failed(step.name.clone(), format!("no component registered under '{reference}'"), Duration::ZERO);
        };

        for (k, v) in &component.variables {
            if scope.get(k).is_none() {
                scope.set(k.clone(), v.clone());
            }
        }
        for (k, v) in &step.variables {
            scope.set(k.clone(), v.clone());
        }

        let mut merged = component.step.clone();
        if step.name.is_some() {
            merged.name = step.name.clone();
        }
        if step.description.is_some() {
            merged.description = step.description.clone();
        }
        if !step.validate.is_empty() {
            merged.validate = step.validate.clone();
        }
        if !step.capture.is_empty() {
            merged.capture = step.capture.clone();
        }
        if step.repeat.is_some() {
            merged.repeat = step.repeat.clone();
        }
        if step.poll.is_some() {
            merged.poll = step.poll.clone();
        }
        if step.timeout.is_some() {
            merged.timeout = step.timeout.clone();
        }
        if step.show_response {
            merged.show_response = true;
        }

        let inner = Box::pin(self.execute(&merged, scope)).await;
        StepReport {
            name: step.name.clone().or_else(|| Some(component.name.clone())),
            status: inner.status,
            validations: Vec::new(),
            error: None,
            duration: Duration::ZERO,
            response: None,
            children: vec![inner],
        }
    }

    async fn run_if(&self, step: &Step, if_condition: &str, scope: &mut Scope) -> StepReport {
        let matched = match condition::evaluate(if_condition, scope) {
            Ok(b) => b,
            Err(e) => return StepReport::failed(step.name.clone(), e.to_string(), Duration::ZERO),
        };
        let branch = if matched { &step.then } else { &step.otherwise };
        if branch.is_empty() {
            return StepReport::skipped(step.name.clone());
        }
        let children = self.run_sequence(branch, scope).await;
        let status = if children.iter().all(StepReport::all_passed) { StepStatus::Passed } else { StepStatus::Failed };
        StepReport { name: step.name.clone(), status, validations: Vec::new(), error: None, duration: Duration::ZERO, response: None, children }
    }

    async fn run_branches(&self, step: &Step, scope: &mut Scope) -> StepReport {
        let mut ordered: Vec<&Branch> = step.branches.iter().collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

        for branch in ordered {
            match condition::evaluate(&branch.condition, scope) {
                Ok(true) => {
                    let children = self.run_sequence(&branch.steps, scope).await;
                    let status = if children.iter().all(StepReport::all_passed) { StepStatus::Passed } else { StepStatus::Failed };
                    return StepReport { name: step.name.clone(), status, validations: Vec::new(), error: None, duration: Duration::ZERO, response: None, children };
                }
                Ok(false) => continue,
                Err(e) => return StepReport::failed(step.name.clone(), e.to_string(), Duration::ZERO),
            }
        }
        StepReport::failed(step.name.clone(), StepwiseError::BranchError.to_string(), Duration::ZERO)
    }

    /// Runs a sub-sequence of steps (an `if`/`else` branch or a matched
    /// `branches` entry) in order, each step's captures feeding the next.
    async fn run_sequence(&self, steps: &[Step], scope: &mut Scope) -> Vec<StepReport> {
        let mut children = Vec::with_capacity(steps.len());
        for sub_step in steps {
            let report = Box::pin(self.execute(sub_step, scope)).await;
            children.push(report);
        }
        children
    }

    async fn run_wait(&self, step: &Step, wait: &str, scope: &Scope) -> StepReport {
        let resolved = match scope.substitute(wait) {
            Ok(s) => s,
            Err(e) => return StepReport::failed(step.name.clone(), e.to_string(), Duration::ZERO),
        };
        let ms = validator::parse_duration_str(&resolved).unwrap_or(0.0);
        tokio::time::sleep(Duration::from_millis(ms.max(0.0) as u64)).await;
        StepReport::passed(step.name.clone(), Duration::ZERO)
    }

    fn run_print(&self, step: &Step, print: &str, scope: &Scope) -> StepReport {
        match scope.substitute(print) {
            Ok(message) => {
                tracing::info!(step = step.name.as_deref().unwrap_or("<unnamed>"), "{message}");
                StepReport::passed(step.name.clone(), Duration::ZERO)
            }
            Err(e) => StepReport::failed(step.name.clone(), e.to_string(), Duration::ZERO),
        }
    }

    async fn run_request_step(&self, step: &Step, scope: &mut Scope) -> StepReport {
        if let Some(poll) = &step.poll {
            return self.run_poll(step, poll, scope).await;
        }
        if let Some(repeat) = &step.repeat {
            return self.run_repeat(step, repeat, scope).await;
        }
        self.run_single(step, scope).await
    }

    /// One call to the transport, retried up to `step.retry` times on
    /// transport error or validation failure, then captures applied.
    async fn run_single(&self, step: &Step, scope: &mut Scope) -> StepReport {
        let timeout = self.step_timeout(step, scope);
        let retry_delay = self.retry_delay(step, scope);
        let attempts = step.retry + 1;

        let mut last_error: Option<String> = None;
        let mut last_validations: Vec<ValidationOutcome> = Vec::new();
        let mut last_response: Option<ResponseEnvelope> = None;

        for attempt in 0..attempts {
            match self.call_once(step, scope, timeout).await {
                Ok(response) => {
                    let outcomes = validator::validate(&step.validate, &response, scope);
                    let passed = validator::all_passed(&outcomes);
                    if passed {
                        apply_captures(&step.capture, &response.body, scope);
                        let mut report = StepReport::passed(step.name.clone(), Duration::ZERO);
                        report.validations = outcomes;
                        if step.show_response {
                            report.response = Some(response.body);
                        }
                        return report;
                    }
                    last_validations = outcomes;
                    last_response = Some(response);
                }
                Err(e) => {
                    last_error = Some(e.to_string());
                    if !e.is_retryable() {
                        break;
                    }
                }
            }

            if attempt + 1 < attempts {
                if !self.retry_counter.try_increment() {
                    tracing::warn!(
                        step = step.name.as_deref().unwrap_or("<unnamed>"),
                        budget = self.retry_counter.limit(),
                        "plan-wide retry budget exhausted, not retrying further"
                    );
                    break;
                }
                tracing::warn!(step = step.name.as_deref().unwrap_or("<unnamed>"), attempt, "step attempt failed, retrying");
                tokio::time::sleep(retry_delay).await;
            }
        }

        let mut report = StepReport::failed(
            step.name.clone(),
            last_error.unwrap_or_else(|| "validation failed after all retries".to_string()),
            Duration::ZERO,
        );
        report.validations = last_validations;
        if step.show_response {
            report.response = last_response.map(|r| r.body);
        }
        report
    }

    async fn call_once(&self, step: &Step, scope: &Scope, timeout: Duration) -> Result<ResponseEnvelope, StepwiseError> {
        let request = step
            .request
            .as_ref()
            .ok_or_else(|| StepwiseError::InternalError("run_single called on a non-request step".into()))?;
        self.transports.call(request, scope, timeout).await
    }

    /// Repeats the underlying request `count` times, sequentially or in
    /// parallel. Parallel iterations read a snapshot of `scope` and write
    /// their captures back at a barrier after all iterations finish, so
    /// concurrent captures can't interleave.
    async fn run_repeat(&self, step: &Step, repeat: &Repeat, scope: &mut Scope) -> StepReport {
        let count = repeat.count.min(self.limits.max_repeat_count);
        if repeat.count > self.limits.max_repeat_count {
            tracing::warn!(requested = repeat.count, cap = self.limits.max_repeat_count, "repeat count capped by execution limits");
        }

        let delay = repeat
            .delay
            .as_deref()
            .map(|d| scope.substitute(d).ok())
            .flatten()
            .and_then(|s| validator::parse_duration_str(&s))
            .map(|ms| Duration::from_millis(ms as u64))
            .unwrap_or(Duration::ZERO);

        let mut children = Vec::with_capacity(count as usize);

        if repeat.parallel {
            // Each iteration runs as its own task against a cloned executor
            // and a scope snapshot; captures are merged back at this barrier
            // in index order once every task has finished, so two iterations
            // racing on the same capture name can't interleave mid-write.
            let mut join_set = JoinSet::new();
            for index in 0..count {
                let mut child_scope = scope.derive_for_iteration(index);
                apply_repeat_variables(repeat, &mut child_scope);
                let mut inner_step = step.clone();
                inner_step.repeat = None;
                let executor = self.clone();
                let gate = self.parallel_gate.clone();
                join_set.spawn(async move {
                    let _permit = gate.acquire_owned().await;
                    let mut child_scope = child_scope;
                    let report = executor.run_single(&inner_step, &mut child_scope).await;
                    (index, report, child_scope)
                });
            }

            let mut results = Vec::with_capacity(count as usize);
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(triple) => results.push(triple),
                    Err(e) => results.push((0, StepReport::failed(step.name.clone(), format!("repeat task panicked: {e}"), Duration::ZERO), scope.clone())),
                }
            }
            results.sort_by_key(|(index, _, _)| *index);
            for (_, report, child_scope) in results {
                for (k, v) in child_scope.get_all() {
                    if scope.get(k).is_none() {
                        scope.set(k.clone(), v.clone());
                    }
                }
                children.push(report);
            }
        } else {
            for index in 0..count {
                let mut child_scope = scope.derive_for_iteration(index);
                apply_repeat_variables(repeat, &mut child_scope);
                let mut inner_step = step.clone();
                inner_step.repeat = None;
                let report = self.run_single(&inner_step, &mut child_scope).await;
                let failed = report.status == StepStatus::Failed;
                for (k, v) in child_scope.get_all() {
                    scope.set(k.clone(), v.clone());
                }
                children.push(report);
                if failed {
                    break;
                }
                if index + 1 < count && !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        let status = if children.iter().all(StepReport::all_passed) { StepStatus::Passed } else { StepStatus::Failed };
        StepReport { name: step.name.clone(), status, validations: Vec::new(), error: None, duration: Duration::ZERO, response: None, children }
    }

    /// Calls the request repeatedly until every `until` rule passes or
    /// `max_attempts` is exhausted.
    async fn run_poll(&self, step: &Step, poll: &crate::document::Poll, scope: &mut Scope) -> StepReport {
        let max_attempts = poll.max_attempts.min(self.limits.max_poll_attempts);
        let interval = scope
            .substitute(&poll.interval)
            .ok()
            .and_then(|s| validator::parse_duration_str(&s))
            .map(|ms| Duration::from_millis(ms as u64))
            .unwrap_or_else(|| Duration::from_millis(DEFAULT_POLL_INTERVAL_MS as u64));

        let timeout = self.step_timeout(step, scope);
        let mut last_error: Option<String> = None;
        let mut last_response: Option<ResponseEnvelope> = None;

        for attempt in 0..max_attempts.max(1) {
            match self.call_once(step, scope, timeout).await {
                Ok(response) => {
                    let outcomes = validator::validate(&poll.until, &response, scope);
                    if validator::all_passed(&outcomes) {
                        apply_captures(&step.capture, &response.body, scope);
                        let mut report = StepReport::passed(step.name.clone(), Duration::ZERO);
                        report.validations = validator::validate(&step.validate, &response, scope);
                        if step.show_response {
                            report.response = Some(response.body.clone());
                        }
                        return report;
                    }
                    last_response = Some(response);
                }
                Err(e) => last_error = Some(e.to_string()),
            }

            if attempt + 1 < max_attempts {
                tokio::time::sleep(interval).await;
            }
        }

        let mut report = StepReport::failed(
            step.name.clone(),
            last_error.unwrap_or_else(|| format!("poll exhausted after {max_attempts} attempts")),
            Duration::ZERO,
        );
        if step.show_response {
            report.response = last_response.map(|r| r.body);
        }
        report
    }

    fn step_timeout(&self, step: &Step, scope: &Scope) -> Duration {
        let requested = step
            .timeout
            .as_deref()
            .and_then(|t| scope.substitute(t).ok())
            .and_then(|s| validator::parse_duration_str(&s))
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        Duration::from_millis(requested as u64).min(self.limits.max_step_timeout)
    }

    fn retry_delay(&self, step: &Step, scope: &Scope) -> Duration {
        let requested = step
            .retry_delay
            .as_deref()
            .and_then(|t| scope.substitute(t).ok())
            .and_then(|s| validator::parse_duration_str(&s))
            .unwrap_or(DEFAULT_RETRY_DELAY_MS);
        Duration::from_millis(requested as u64)
    }
}

/// Applies a `repeat`'s per-iteration `variables` overrides into a derived
/// iteration scope, substituting templates (e.g. against `index`/`iteration`)
/// first.
fn apply_repeat_variables(repeat: &Repeat, scope: &mut Scope) {
    if repeat.variables.is_empty() {
        return;
    }
    match scope.substitute_map(&Value::Object(repeat.variables.clone().into_iter().collect())) {
        Ok(Value::Object(map)) => {
            for (k, v) in map {
                scope.set(k, v);
            }
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "repeat variables substitution failed, skipping"),
    }
}

/// Applies every capture in `captures` to `scope`. A capture failure (bad
/// path, bad decode) is logged and skipped — it never fails the step.
fn apply_captures(captures: &[Capture], body: &Value, scope: &mut Scope) {
    for capture in captures {
        let value = match crate::jsonpath::select_literal(body, &capture.path) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(capture = capture.name.as_str(), error = %e, "capture failed, skipping");
                continue;
            }
        };
        let value = match decode_capture(&value, capture.decode.as_deref()) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(capture = capture.name.as_str(), error = %e, "capture decode failed, skipping");
                continue;
            }
        };
        scope.set(capture.name.clone(), value);
    }
}

fn decode_capture(value: &Value, decode: Option<&str>) -> Result<Value, String> {
    let Some(decode) = decode else { return Ok(value.clone()) };
    match decode {
        "base64" => {
            let raw = value.as_str().ok_or("capture decode: base64 requires a string value")?;
            let bytes = BASE64.decode(raw).map_err(|e| format!("base64 decode failed: {e}"))?;
            let text = String::from_utf8(bytes).map_err(|e| format!("base64 decode produced invalid utf8: {e}"))?;
            Ok(Value::String(text))
        }
        "base64json" => {
            let raw = value.as_str().ok_or("capture decode: base64json requires a string value")?;
            let bytes = BASE64.decode(raw).map_err(|e| format!("base64 decode failed: {e}"))?;
            serde_json::from_slice(&bytes).map_err(|e| format!("invalid JSON after decode: {e}"))
        }
        other => Err(format!("unknown capture decode kind '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Protocol, Request};

    fn test_executor() -> Executor {
        Executor::new(Arc::new(TransportRegistry::new()), Arc::new(HashMap::new()), Arc::new(ExecutionLimits::default()))
    }

    #[tokio::test]
    async fn wait_step_passes_without_request() {
        let executor = test_executor();
        let step = Step { wait: Some("1ms".into()), ..Default::default() };
        let mut scope = Scope::new();
        let report = executor.execute(&step, &mut scope).await;
        assert_eq!(report.status, StepStatus::Passed);
    }

    #[tokio::test]
    async fn condition_false_skips_step() {
        let executor = test_executor();
        let step = Step { condition: Some("false".into()), wait: Some("1ms".into()), ..Default::default() };
        let mut scope = Scope::new();
        let report = executor.execute(&step, &mut scope).await;
        assert_eq!(report.status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn missing_use_component_fails_gracefully() {
        let executor = test_executor();
        let step = Step { use_component: Some("nonexistent".into()), ..Default::default() };
        let mut scope = Scope::new();
        let report = executor.execute(&step, &mut scope).await;
        assert_eq!(report.status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn unmatched_branches_fail_with_branch_error() {
        let executor = test_executor();
        let step = Step {
            branches: vec![Branch { condition: "false".into(), priority: 0, steps: vec![Step { wait: Some("1ms".into()), ..Default::default() }] }],
            ..Default::default()
        };
        let mut scope = Scope::new();
        let report = executor.execute(&step, &mut scope).await;
        assert_eq!(report.status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn if_then_else_picks_the_right_branch() {
        let executor = test_executor();
        let step = Step {
            if_condition: Some("true".into()),
            then: vec![Step { wait: Some("1ms".into()), ..Default::default() }],
            otherwise: vec![Step { use_component: Some("missing".into()), ..Default::default() }],
            ..Default::default()
        };
        let mut scope = Scope::new();
        let report = executor.execute(&step, &mut scope).await;
        assert_eq!(report.status, StepStatus::Passed);
    }

    #[tokio::test]
    async fn if_branch_runs_full_subsequence_and_rolls_up_failure() {
        let executor = test_executor();
        let step = Step {
            if_condition: Some("true".into()),
            then: vec![
                Step { wait: Some("1ms".into()), ..Default::default() },
                Step { use_component: Some("missing".into()), ..Default::default() },
            ],
            ..Default::default()
        };
        let mut scope = Scope::new();
        let report = executor.execute(&step, &mut scope).await;
        assert_eq!(report.status, StepStatus::Failed);
        assert_eq!(report.children.len(), 2);
    }

    #[tokio::test]
    async fn use_step_merges_caller_name_over_component() {
        let mut components = HashMap::new();
        components.insert(
            "wait_once".to_string(),
            Component { name: "wait_once".into(), variables: HashMap::new(), step: Step { wait: Some("1ms".into()), ..Default::default() } },
        );
        let executor = Executor::new(Arc::new(TransportRegistry::new()), Arc::new(components), Arc::new(ExecutionLimits::default()));
        let step = Step { use_component: Some("wait_once".into()), name: Some("caller-name".into()), ..Default::default() };
        let mut scope = Scope::new();
        let report = executor.execute(&step, &mut scope).await;
        assert_eq!(report.status, StepStatus::Passed);
        assert_eq!(report.children[0].name.as_deref(), Some("caller-name"));
    }

    #[test]
    fn apply_repeat_variables_substitutes_against_the_iteration_scope() {
        let repeat = Repeat {
            count: 2,
            parallel: false,
            delay: None,
            variables: HashMap::from([("label".to_string(), Value::String("item-{{iteration}}".into()))]),
        };
        let mut scope = Scope::new();
        scope.set("iteration", Value::from(3u32));
        apply_repeat_variables(&repeat, &mut scope);
        assert_eq!(scope.get("label"), Some(&Value::String("item-3".into())));
    }

    #[test]
    fn decode_capture_base64_roundtrips() {
        let encoded = Value::String(BASE64.encode("hi there"));
        let decoded = decode_capture(&encoded, Some("base64")).unwrap();
        assert_eq!(decoded, Value::String("hi there".into()));
    }

    #[test]
    fn unused_protocol_import_keeps_request_shape_documented() {
        let _ = Request { protocol: Protocol::Http, ..Default::default() };
    }

    #[test]
    fn retry_counter_is_shared_across_executor_clones() {
        let limits = Arc::new(ExecutionLimits { max_retries_total: 1, ..ExecutionLimits::default() });
        let executor = Executor::new(Arc::new(TransportRegistry::new()), Arc::new(HashMap::new()), limits);
        let cloned = executor.clone();
        // The plan-wide budget is drawn from the same `Arc<RetryCounter>` no
        // matter which clone of the executor spends it — this is what makes
        // it plan-wide rather than per-task when parallel `repeat`/group
        // members each hold their own cloned `Executor`.
        assert!(executor.retry_counter.try_increment());
        assert!(!cloned.retry_counter.try_increment());
    }

    #[test]
    fn parallel_gate_is_sized_from_max_parallel() {
        let limits = Arc::new(ExecutionLimits { max_parallel: 3, ..ExecutionLimits::default() });
        let executor = Executor::new(Arc::new(TransportRegistry::new()), Arc::new(HashMap::new()), limits);
        assert_eq!(executor.parallel_gate.available_permits(), 3);
    }
}
