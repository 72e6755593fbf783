//! HTTP/HTTPS adapter.
//!
//! Builds a `reqwest` request from a [`Request`] document node, substituting
//! templates into the URL, headers, and body via the Variable Manager, then
//! normalizes the response into a [`ResponseEnvelope`] for the Validator.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;

use crate::document::{HttpAuth, Request};
use crate::errors::StepwiseError;
use crate::transport::TransportAdapter;
use crate::validator::ResponseEnvelope;
use crate::vars::Scope;

pub struct HttpAdapter {
    client: reqwest::Client,
}

impl HttpAdapter {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for HttpAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportAdapter for HttpAdapter {
    #[tracing::instrument(
        name = "http_request",
        skip_all,
        fields(
            http.method = tracing::field::Empty,
            http.url = tracing::field::Empty,
            http.status_code = tracing::field::Empty,
            http.duration_ms = tracing::field::Empty,
            otel.kind = "client"
        )
    )]
    async fn call(&self, request: &Request, scope: &Scope, deadline: Duration) -> Result<ResponseEnvelope, StepwiseError> {
        let span = tracing::Span::current();
        let start = Instant::now();

        let method_str = request
            .method
            .as_deref()
            .ok_or_else(|| StepwiseError::TransportError("http request missing 'method'".into()))?;
        let url_template = request
            .url
            .as_deref()
            .ok_or_else(|| StepwiseError::TransportError("http request missing 'url'".into()))?;
        let url = scope.substitute(url_template)?;

        let method = Method::from_bytes(method_str.as_bytes())
            .map_err(|e| StepwiseError::TransportError(format!("invalid HTTP method '{method_str}': {e}")))?;

        span.record("http.method", method_str);
        span.record("http.url", url.as_str());

        let mut builder = self.client.request(method, &url);

        for (k, v) in &request.headers {
            let value = scope.substitute(v)?;
            builder = builder.header(k, value);
        }

        if !request.query_params.is_empty() {
            let mut resolved_query = Vec::with_capacity(request.query_params.len());
            for (k, v) in &request.query_params {
                resolved_query.push((scope.substitute(k)?, scope.substitute(v)?));
            }
            builder = builder.query(&resolved_query);
        }

        match &request.auth {
            Some(HttpAuth::Bearer { token }) => {
                let token = scope.substitute(token)?;
                builder = builder.bearer_auth(token);
            }
            Some(HttpAuth::Basic { username, password }) => {
                let username = scope.substitute(username)?;
                let password = scope.substitute(password)?;
                builder = builder.basic_auth(username, Some(password));
            }
            None => {}
        }

        if let Some(body) = &request.body {
            let resolved = scope.substitute_value(body)?;
            builder = builder.json(&resolved);
        }

        builder = builder.timeout(deadline);

        let response = builder.send().await;
        let duration = start.elapsed();

        match response {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let raw_body = resp.text().await.unwrap_or_default();
                let body: Value = serde_json::from_str(&raw_body).unwrap_or(Value::String(raw_body));

                span.record("http.status_code", status as i64);
                span.record("http.duration_ms", duration.as_millis() as i64);
                tracing::info!(method = %method_str, %url, status, duration_ms = duration.as_millis() as u64, "http step finished");

                Ok(ResponseEnvelope { status_code: status, body, duration })
            }
            Err(e) if e.is_timeout() => {
                Err(StepwiseError::TimeoutError(format!("{method_str} {url} timed out after {:?}", deadline)))
            }
            Err(e) => {
                tracing::warn!(error = %e, "http request failed");
                Err(StepwiseError::TransportError(format!("{method_str} {url}: {e}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_builds_a_client() {
        let _adapter = HttpAdapter::new();
    }
}
