//! MCP (JSON-RPC 2.0) client adapter.
//!
//! A step talks to another JSON-RPC 2.0 server over either `stdio` (spawn
//! `command`/`args`, write one newline-terminated request, read one
//! newline-terminated response) or `http` (POST the envelope to `url`).
//! Framing mirrors the server shim's own line-delimited stdio protocol.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::document::{McpTransport, Request};
use crate::errors::StepwiseError;
use crate::transport::TransportAdapter;
use crate::validator::ResponseEnvelope;
use crate::vars::Scope;

#[derive(Debug, Serialize)]
struct RpcRequest {
    jsonrpc: &'static str,
    id: u64,
    method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

pub struct McpAdapter {
    client: reqwest::Client,
}

impl McpAdapter {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for McpAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportAdapter for McpAdapter {
    #[tracing::instrument(name = "mcp_call", skip_all, fields(mcp.method = tracing::field::Empty))]
    async fn call(&self, request: &Request, scope: &Scope, deadline: Duration) -> Result<ResponseEnvelope, StepwiseError> {
        let start = Instant::now();

        let method = request
            .mcp_method
            .as_deref()
            .ok_or_else(|| StepwiseError::TransportError("mcp request missing 'method'".into()))?;
        let method = scope.substitute(method)?;
        tracing::Span::current().record("mcp.method", method.as_str());

        let params = match &request.params {
            Some(v) => Some(scope.substitute_value(v)?),
            None => None,
        };
        let rpc_request = RpcRequest { jsonrpc: "2.0", id: 1, method: method.clone(), params };

        let transport = request.mcp_transport.unwrap_or(McpTransport::Stdio);
        let outcome = tokio::time::timeout(deadline, self.dispatch(transport, request, scope, rpc_request)).await;
        let duration = start.elapsed();

        match outcome {
            Ok(Ok(response)) => {
                let (status, body) = match response.error {
                    Some(err) => (
                        502,
                        serde_json::json!({ "error": { "code": err.code, "message": err.message, "data": err.data } }),
                    ),
                    None => (200, response.result.unwrap_or(Value::Null)),
                };
                tracing::info!(method = %method, status, duration_ms = duration.as_millis() as u64, "mcp step finished");
                Ok(ResponseEnvelope { status_code: status, body, duration })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(StepwiseError::TimeoutError(format!("mcp call '{method}' timed out after {deadline:?}"))),
        }
    }
}

impl McpAdapter {
    async fn dispatch(
        &self,
        transport: McpTransport,
        request: &Request,
        scope: &Scope,
        rpc_request: RpcRequest,
    ) -> Result<RpcResponse, StepwiseError> {
        match transport {
            McpTransport::Http => self.call_http(request, scope, rpc_request).await,
            McpTransport::Stdio => self.call_stdio(request, scope, rpc_request).await,
        }
    }

    async fn call_http(&self, request: &Request, scope: &Scope, rpc_request: RpcRequest) -> Result<RpcResponse, StepwiseError> {
        let url = request
            .url
            .as_deref()
            .ok_or_else(|| StepwiseError::TransportError("mcp http transport missing 'url'".into()))?;
        let url = scope.substitute(url)?;

        let mut builder = self.client.post(&url).json(&rpc_request);
        for (k, v) in &request.headers {
            builder = builder.header(k, scope.substitute(v)?);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| StepwiseError::TransportError(format!("mcp http call to {url}: {e}")))?;
        response
            .json::<RpcResponse>()
            .await
            .map_err(|e| StepwiseError::TransportError(format!("mcp http response from {url}: {e}")))
    }

    async fn call_stdio(&self, request: &Request, scope: &Scope, rpc_request: RpcRequest) -> Result<RpcResponse, StepwiseError> {
        let command = request
            .command
            .as_deref()
            .ok_or_else(|| StepwiseError::TransportError("mcp stdio transport missing 'command'".into()))?;
        let command = scope.substitute(command)?;
        let mut args = Vec::with_capacity(request.args.len());
        for arg in &request.args {
            args.push(scope.substitute(arg)?);
        }

        let mut child = Command::new(&command)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| StepwiseError::TransportError(format!("spawning mcp command '{command}': {e}")))?;

        let mut line = serde_json::to_string(&rpc_request)
            .map_err(|e| StepwiseError::TransportError(format!("encoding mcp request: {e}")))?;
        line.push('\n');

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| StepwiseError::TransportError("mcp child process has no stdin".into()))?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| StepwiseError::TransportError(format!("writing to mcp process: {e}")))?;
        drop(stdin);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StepwiseError::TransportError("mcp child process has no stdout".into()))?;
        let mut reader = BufReader::new(stdout);
        let mut response_line = String::new();
        reader
            .read_line(&mut response_line)
            .await
            .map_err(|e| StepwiseError::TransportError(format!("reading mcp response: {e}")))?;

        let _ = child.kill().await;

        serde_json::from_str(response_line.trim())
            .map_err(|e| StepwiseError::TransportError(format!("parsing mcp response '{response_line}': {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_builds_adapter() {
        let _adapter = McpAdapter::new();
    }

    #[test]
    fn rpc_request_serializes_without_params_when_absent() {
        let req = RpcRequest { jsonrpc: "2.0", id: 1, method: "ping".into(), params: None };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("params").is_none());
    }
}
