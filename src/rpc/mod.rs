//! JSON-RPC 2.0 server shim.
//!
//! Exposes the runner as three tools (`stepwise_run`, `stepwise_validate`,
//! `stepwise_info`) over stdin/stdout. Requests are read one line at a time
//! and handled serially to preserve ordering on the single-stream transport;
//! a single writer task owns stdout and drains every response/notification
//! through one channel, so frames can never interleave — including
//! step-progress notifications streamed from inside a running tool call.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::executor::{Executor, StepReport, StepStatus};
use crate::limits::{validate_limits, ExecutionLimits};
use crate::orchestrator::Orchestrator;
use crate::resolver::{Resolver, SearchPaths};
use crate::transport::TransportRegistry;
use crate::vars::Scope;

/// Protocol-version token advertised during the `initialize` handshake
/// (`YYYY-MM-DD` form).
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Runs the server loop until stdin closes.
pub async fn serve(transports: Arc<TransportRegistry>, limits: Arc<ExecutionLimits>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(frame) = rx.recv().await {
            let mut line = serde_json::to_string(&frame).unwrap_or_default();
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                let _ = tx.send(error_response(Value::Null, -32700, &format!("parse error: {e}")));
                continue;
            }
        };

        handle_request(&request, &tx, &transports, &limits).await;
    }

    drop(tx);
    let _ = writer.await;
}

async fn handle_request(request: &Value, tx: &mpsc::UnboundedSender<Value>, transports: &Arc<TransportRegistry>, limits: &Arc<ExecutionLimits>) {
    let id = request.get("id").cloned();
    let method = request.get("method").and_then(Value::as_str).unwrap_or("");
    let params = request.get("params").cloned().unwrap_or_else(|| Value::Object(Default::default()));

    // A request with no `id` is a notification — `notifications/initialized`
    // is the only one the shim expects — and gets no reply either way.
    let is_notification = id.is_none();

    let response = match method {
        "initialize" => Some(handle_initialize(id)),
        "notifications/initialized" => None,
        "ping" => Some(json!({ "jsonrpc": "2.0", "id": id, "result": { "status": "pong" } })),
        "tools/list" => Some(handle_tools_list(id)),
        "tools/call" => Some(handle_tools_call(id, &params, tx, transports.clone(), limits.clone()).await),
        other => Some(error_response(id.unwrap_or(Value::Null), -32601, &format!("method not found: {other}"))),
    };

    if !is_notification {
        if let Some(response) = response {
            let _ = tx.send(response);
        }
    }
}

fn handle_initialize(id: Option<Value>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {
            "protocolVersion": PROTOCOL_VERSION,
            "serverInfo": { "name": "stepwise", "version": env!("CARGO_PKG_VERSION") },
            "capabilities": { "tools": { "listChanged": true } }
        }
    })
}

fn handle_tools_list(id: Option<Value>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {
            "tools": [
                {
                    "name": "stepwise_run",
                    "description": "Runs a workflow document and reports per-step outcomes.",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "path": { "type": "string" },
                            "parallel": { "type": "boolean" },
                            "recursive": { "type": "boolean" },
                            "verbose": { "type": "boolean" },
                            "fail_fast": { "type": "boolean" },
                            "html_report": { "type": "boolean" },
                            "html_report_path": { "type": "string" }
                        },
                        "required": ["path"]
                    }
                },
                {
                    "name": "stepwise_validate",
                    "description": "Parses and resolves a workflow document without executing it.",
                    "inputSchema": {
                        "type": "object",
                        "properties": { "path": { "type": "string" } },
                        "required": ["path"]
                    }
                },
                {
                    "name": "stepwise_info",
                    "description": "Summarizes a workflow document's steps, groups and imports.",
                    "inputSchema": {
                        "type": "object",
                        "properties": { "path": { "type": "string" } },
                        "required": ["path"]
                    }
                }
            ]
        }
    })
}

async fn handle_tools_call(
    id: Option<Value>,
    params: &Value,
    tx: &mpsc::UnboundedSender<Value>,
    transports: Arc<TransportRegistry>,
    limits: Arc<ExecutionLimits>,
) -> Value {
    let name = params.get("name").and_then(Value::as_str).unwrap_or("");
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| Value::Object(Default::default()));

    let outcome = match name {
        "stepwise_run" => run_tool(&arguments, tx, transports, limits).await,
        "stepwise_validate" => validate_tool(&arguments),
        "stepwise_info" => info_tool(&arguments),
        other => Err(format!("unknown tool '{other}'")),
    };

    let (text, is_error) = match outcome {
        Ok(text) => (text, false),
        Err(text) => (text, true),
    };

    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": { "content": [{ "type": "text", "text": text }], "isError": is_error }
    })
}

fn argument_path(arguments: &Value) -> Result<PathBuf, String> {
    arguments
        .get("path")
        .and_then(Value::as_str)
        .map(PathBuf::from)
        .ok_or_else(|| "missing 'path' argument".to_string())
}

/// Runs `stepwise_run`, streaming `stepwise/progress` after every root
/// step/group and a closing `stepwise/result` + `stepwise/output`.
async fn run_tool(arguments: &Value, tx: &mpsc::UnboundedSender<Value>, transports: Arc<TransportRegistry>, limits: Arc<ExecutionLimits>) -> Result<String, String> {
    let path = argument_path(arguments)?;
    let fail_fast = arguments.get("fail_fast").and_then(Value::as_bool).unwrap_or(false);

    let mut resolver = Resolver::new(SearchPaths::default());
    let (workflow, components) = resolver.resolve(&path).map_err(|e| e.user_message())?;

    let limit_check = validate_limits(workflow.step_count(), workflow.total_retry_budget(), &limits);
    if !limit_check.passed {
        return Err(limit_check.violations.iter().map(|v| v.message.clone()).collect::<Vec<_>>().join("; "));
    }

    let mut scope = Scope::new();
    scope.extend(&workflow.variables);

    let max_execution_time = limits.max_execution_time;
    let executor = Executor::new(transports, Arc::new(components), limits);
    let orchestrator = Orchestrator::new(executor);

    let total_steps = workflow.steps.len() + workflow.groups.len();
    let progress_tx = tx.clone();
    let mut on_step = move |index: usize, total: usize, report: &StepReport| {
        let _ = progress_tx.send(json!({
            "jsonrpc": "2.0",
            "method": "stepwise/progress",
            "params": {
                "step_name": report.name,
                "step_index": index + 1,
                "total_steps": total,
                "status": format!("{:?}", report.status).to_lowercase(),
                "duration_ms": report.duration.as_millis() as u64,
                "error": report.error,
                "validation_count": report.validations.len(),
                "validations_passed": report.validations.iter().filter(|v| v.passed).count(),
            }
        }));
    };

    let report = match tokio::time::timeout(max_execution_time, orchestrator.run_with_progress(&workflow, &mut scope, fail_fast, &mut on_step)).await {
        Ok(report) => report,
        Err(_) => return Err(format!("workflow exceeded its overall execution timeout ({max_execution_time:?})")),
    };

    let _ = tx.send(json!({
        "jsonrpc": "2.0",
        "method": "stepwise/result",
        "params": {
            "passed": report.all_passed(),
            "halted_early": report.halted_early,
            "captures": report.captures,
        }
    }));

    let passed_count = report.steps.iter().filter(|s| s.status == StepStatus::Passed).count();
    let summary = format!(
        "{}/{} top-level step(s) passed for '{}' ({} of {} requested){}",
        passed_count,
        report.steps.len(),
        report.name,
        report.steps.len(),
        total_steps,
        if report.halted_early { ", halted early by fail_fast" } else { "" }
    );
    let _ = tx.send(json!({ "jsonrpc": "2.0", "method": "stepwise/output", "params": { "text": summary.clone() } }));

    if report.all_passed() {
        Ok(summary)
    } else {
        Err(summary)
    }
}

fn validate_tool(arguments: &Value) -> Result<String, String> {
    let path = argument_path(arguments)?;
    let mut resolver = Resolver::new(SearchPaths::default());
    resolver.resolve(&path).map_err(|e| e.user_message())?;
    Ok(format!("{} resolves cleanly", path.display()))
}

fn info_tool(arguments: &Value) -> Result<String, String> {
    let path = argument_path(arguments)?;
    let mut resolver = Resolver::new(SearchPaths::default());
    let (workflow, components) = resolver.resolve(&path).map_err(|e| e.user_message())?;
    Ok(format!(
        "{} (v{}): {} step(s), {} group(s), {} registered component(s)",
        workflow.name,
        workflow.version.as_deref().unwrap_or("unset"),
        workflow.steps.len(),
        workflow.groups.len(),
        components.len()
    ))
}

fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_advertises_tools_capability() {
        let response = handle_initialize(Some(json!(1)));
        assert_eq!(response["result"]["capabilities"]["tools"]["listChanged"], json!(true));
        assert_eq!(response["result"]["protocolVersion"], json!(PROTOCOL_VERSION));
    }

    #[test]
    fn tools_list_advertises_all_three_tools() {
        let response = handle_tools_list(Some(json!(1)));
        let names: Vec<&str> = response["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["stepwise_run", "stepwise_validate", "stepwise_info"]);
    }

    #[test]
    fn argument_path_requires_path_field() {
        assert!(argument_path(&json!({})).is_err());
        assert_eq!(argument_path(&json!({ "path": "a.yaml" })).unwrap(), PathBuf::from("a.yaml"));
    }

    #[test]
    fn error_response_carries_code_and_message() {
        let response = error_response(json!(1), -32601, "method not found: foo");
        assert_eq!(response["error"]["code"], json!(-32601));
    }
}
