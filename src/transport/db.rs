//! Raw SQL adapter.
//!
//! A step names either a `dsn` or a `host`/`user`/`password`/`database`
//! quartet (defaulted to a Postgres-style URL when no `dsn` is given) plus a
//! `query` string. The adapter opens a connection (one per call, so a
//! parallel task never contends on a shared pool), runs the query, and turns
//! every row into a JSON object keyed by column name. Built on `sqlx::any`
//! so one adapter covers Postgres/MySQL/SQLite behind a single
//! backend-agnostic envelope.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{Column, Row, TypeInfo};

use crate::document::Request;
use crate::errors::StepwiseError;
use crate::transport::TransportAdapter;
use crate::validator::ResponseEnvelope;
use crate::vars::Scope;

pub struct DbAdapter;

impl DbAdapter {
    pub fn new() -> Self {
        sqlx::any::install_default_drivers();
        Self
    }
}

impl Default for DbAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportAdapter for DbAdapter {
    #[tracing::instrument(name = "db_query", skip_all, fields(db.statement = tracing::field::Empty))]
    async fn call(&self, request: &Request, scope: &Scope, deadline: Duration) -> Result<ResponseEnvelope, StepwiseError> {
        let start = Instant::now();

        let dsn = resolve_dsn(request, scope)?;
        let query = request
            .query
            .as_deref()
            .ok_or_else(|| StepwiseError::TransportError("db request missing 'query'".into()))?;
        let query = scope.substitute(query)?;
        tracing::Span::current().record("db.statement", query.as_str());

        let outcome = tokio::time::timeout(deadline, run_query(&dsn, &query)).await;
        let duration = start.elapsed();

        match outcome {
            Ok(Ok(rows)) => {
                let row_count = rows.len();
                let body = serde_json::json!({ "data": rows, "rows": row_count });
                tracing::info!(rows = row_count, duration_ms = duration.as_millis() as u64, "db step finished");
                Ok(ResponseEnvelope { status_code: 200, body, duration })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(StepwiseError::TimeoutError(format!("query timed out after {deadline:?}"))),
        }
    }
}

fn resolve_dsn(request: &Request, scope: &Scope) -> Result<String, StepwiseError> {
    if let Some(dsn) = &request.dsn {
        return scope.substitute(dsn);
    }
    let host = request.host.as_deref().unwrap_or("localhost");
    let user = request.user.as_deref().unwrap_or("postgres");
    let password = request.password.as_deref().unwrap_or("");
    let database = request
        .database
        .as_deref()
        .ok_or_else(|| StepwiseError::TransportError("db request needs 'dsn' or 'host'/'user'/'password'/'database'".into()))?;

    let raw = format!("postgres://{user}:{password}@{host}/{database}");
    scope.substitute(&raw)
}

async fn run_query(dsn: &str, query: &str) -> Result<Vec<Value>, StepwiseError> {
    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .connect(dsn)
        .await
        .map_err(|e| StepwiseError::TransportError(format!("db connect: {e}")))?;

    let rows = sqlx::query(query)
        .fetch_all(&pool)
        .await
        .map_err(|e| StepwiseError::TransportError(format!("db query failed: {e}")))?;

    pool.close().await;
    Ok(rows.iter().map(row_to_json).collect())
}

/// Converts one row into a `{column: value}` JSON object. `sqlx::any` erases
/// the concrete driver type, so every column is decoded by the textual type
/// name it reports rather than a static Rust type.
fn row_to_json(row: &AnyRow) -> Value {
    let mut object = Map::with_capacity(row.columns().len());
    for (idx, column) in row.columns().iter().enumerate() {
        let value = decode_column(row, idx, column.type_info().name());
        object.insert(column.name().to_string(), value);
    }
    Value::Object(object)
}

fn decode_column(row: &AnyRow, idx: usize, type_name: &str) -> Value {
    match type_name.to_ascii_uppercase().as_str() {
        "BOOL" | "BOOLEAN" => row.try_get::<bool, _>(idx).map(Value::Bool).unwrap_or(Value::Null),
        "INT2" | "INT4" | "INT8" | "INTEGER" | "SMALLINT" | "BIGINT" => {
            row.try_get::<i64, _>(idx).map(Value::from).unwrap_or(Value::Null)
        }
        "FLOAT4" | "FLOAT8" | "REAL" | "DOUBLE" | "NUMERIC" | "DECIMAL" => {
            row.try_get::<f64, _>(idx).map(Value::from).unwrap_or(Value::Null)
        }
        _ => row
            .try_get::<String, _>(idx)
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dsn_falls_back_to_host_fields() {
        let mut request = Request {
            protocol: crate::document::Protocol::Db,
            database: Some("orders".into()),
            host: Some("db.local".into()),
            ..Default::default()
        };
        request.user = Some("svc".into());
        let dsn = resolve_dsn(&request, &Scope::new()).unwrap();
        assert_eq!(dsn, "postgres://svc:@db.local/orders");
    }
}
