//! The data gateway boundary.
//!
//! A `DataBackend` is the table CRUD + optional raw SQL surface of the external
//! database. Handles are built per request by a `BackendConnector` from the
//! caller's `ConnectionParams` and dropped when the request ends.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::BackendError;
use crate::registry::{EqFilter, SelectArgs};

pub mod memory;
pub mod rest;

pub use memory::{MemoryConnector, MemoryGateway};
pub use rest::{RestConnector, RestGateway};

/// Collection probed during pre-flight. It normally does not exist; only an
/// auth failure on it matters.
pub const PROBE_COLLECTION: &str = "_test_";

#[async_trait]
pub trait DataBackend: Send + Sync {
    /// The gateway's self-describing schema document, when it publishes one.
    async fn schema_document(&self) -> Result<Option<Value>, BackendError>;

    async fn select(&self, query: &SelectArgs) -> Result<Vec<Value>, BackendError>;

    /// Insert one row; returns the stored row(s) as the gateway reports them.
    async fn insert(&self, table: &str, row: &Map<String, Value>)
        -> Result<Vec<Value>, BackendError>;

    async fn update(
        &self,
        table: &str,
        filter: &EqFilter,
        data: &Map<String, Value>,
    ) -> Result<Vec<Value>, BackendError>;

    async fn delete(&self, table: &str, filter: &EqFilter) -> Result<Vec<Value>, BackendError>;

    /// Run raw SQL natively. `BackendError::Unsupported` when the gateway has
    /// no such endpoint.
    async fn execute_sql(&self, sql: &str) -> Result<Value, BackendError>;

    /// One harmless read used to check the credential.
    async fn probe(&self) -> Result<(), BackendError> {
        self.select(&SelectArgs::all(PROBE_COLLECTION, 1))
            .await
            .map(|_| ())
    }
}

/// Endpoint + credential supplied with each request.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub endpoint: String,
    pub credential: String,
}

impl ConnectionParams {
    pub fn new(endpoint: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            credential: credential.into(),
        }
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("endpoint", &self.endpoint)
            .field("credential", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("endpoint is not a valid URL: {0}")]
    Malformed(String),
    #[error("endpoint scheme must be http or https, got `{0}`")]
    UnsupportedScheme(String),
    #[error("endpoint has no host")]
    MissingHost,
    #[error("endpoint host `{0}` is not in the allowed host list")]
    HostNotAllowed(String),
}

/// Syntactic check of a connection endpoint. `allowed_hosts` holds host
/// suffixes; empty means any host.
pub fn validate_endpoint(endpoint: &str, allowed_hosts: &[String]) -> Result<url::Url, EndpointError> {
    let url = url::Url::parse(endpoint.trim()).map_err(|e| EndpointError::Malformed(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(EndpointError::UnsupportedScheme(url.scheme().to_string()));
    }
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or(EndpointError::MissingHost)?
        .to_ascii_lowercase();
    if !allowed_hosts.is_empty()
        && !allowed_hosts
            .iter()
            .any(|suffix| host == *suffix || host.ends_with(&format!(".{suffix}")))
    {
        return Err(EndpointError::HostNotAllowed(host));
    }
    Ok(url)
}

/// Builds a fresh backend handle for one request.
pub trait BackendConnector: Send + Sync {
    fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn DataBackend>, BackendError>;

    /// Per-call deadline the executor applies to this connector's handles.
    fn call_timeout(&self) -> Duration;
}

/// Top-level collection names from an OpenAPI document: `paths` keys that
/// start with `/`, carry no template parameter, and are not RPC routes.
pub fn collection_names_from_openapi(doc: &Value) -> Vec<String> {
    let Some(paths) = doc.get("paths").and_then(Value::as_object) else {
        return Vec::new();
    };
    let mut names: Vec<String> = paths
        .keys()
        .filter_map(|p| p.strip_prefix('/'))
        .map(|p| p.trim_end_matches('/'))
        .filter(|p| !p.is_empty() && !p.contains('{') && !p.contains('/'))
        .filter(|p| *p != "rpc")
        .map(str::to_string)
        .collect();
    names.sort();
    names.dedup();
    names
}
