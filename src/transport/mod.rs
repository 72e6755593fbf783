//! Transport Adapters.
//!
//! Each protocol is modeled as a small adapter behind one `call` method —
//! tagged variants behind a small interface rather than a sprawling trait.
//! All four normalize their native response into a [`ResponseEnvelope`] so
//! the Validator stays protocol-agnostic.

pub mod db;
pub mod grpc;
pub mod http;
pub mod mcp;

use async_trait::async_trait;
use std::time::Duration;

use crate::document::Request;
use crate::errors::StepwiseError;
use crate::validator::ResponseEnvelope;
use crate::vars::Scope;

#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Performs the request described by `request`, cancelling if it runs
    /// past `deadline`.
    async fn call(&self, request: &Request, scope: &Scope, deadline: Duration) -> Result<ResponseEnvelope, StepwiseError>;
}

/// Picks the adapter that handles `request.protocol` from a fixed registry,
/// one instance per protocol, lazily constructed and reused for the
/// lifetime of an execution.
pub struct TransportRegistry {
    http: http::HttpAdapter,
    grpc: grpc::GrpcAdapter,
    db: db::DbAdapter,
    mcp: mcp::McpAdapter,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self {
            http: http::HttpAdapter::new(),
            grpc: grpc::GrpcAdapter::new(),
            db: db::DbAdapter::new(),
            mcp: mcp::McpAdapter::new(),
        }
    }

    pub async fn call(&self, request: &Request, scope: &Scope, deadline: Duration) -> Result<ResponseEnvelope, StepwiseError> {
        use crate::document::Protocol;
        match request.protocol {
            Protocol::Http => self.http.call(request, scope, deadline).await,
            Protocol::Grpc => self.grpc.call(request, scope, deadline).await,
            Protocol::Db => self.db.call(request, scope, deadline).await,
            Protocol::Mcp => self.mcp.call(request, scope, deadline).await,
        }
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}
