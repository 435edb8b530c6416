//! `DataBackend` over a PostgREST-style HTTP gateway.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{BackendConnector, ConnectionParams, DataBackend};
use crate::config::CoreConfig;
use crate::error::{mentions_invalid_key, BackendError};
use crate::registry::{EqFilter, SelectArgs};

const RETURN_REPRESENTATION: &str = "return=representation";

pub struct RestGateway {
    client: Client,
    base: String,
    credential: String,
    sql_rpc: String,
    timeout: Duration,
}

impl RestGateway {
    pub fn new(
        params: &ConnectionParams,
        rest_prefix: &str,
        sql_rpc: &str,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base: format!("{}{}", params.endpoint.trim().trim_end_matches('/'), rest_prefix),
            credential: params.credential.clone(),
            sql_rpc: sql_rpc.to_string(),
            timeout,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/{}", self.base, path))
            .header("apikey", &self.credential)
            .header("Authorization", format!("Bearer {}", self.credential))
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, BackendError> {
        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout(self.timeout)
            } else {
                BackendError::Transport(e.to_string())
            }
        })
    }

    /// Send, then turn a non-2xx into a classified error and a 2xx into JSON.
    async fn send_json(&self, builder: RequestBuilder) -> Result<Value, BackendError> {
        let response = self.send(builder).await?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
        if !status.is_success() {
            return Err(classify_error(status.as_u16(), &text));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| BackendError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl DataBackend for RestGateway {
    async fn schema_document(&self) -> Result<Option<Value>, BackendError> {
        let builder = self
            .request(Method::GET, "")
            .header("Accept", "application/openapi+json, application/json");
        match self.send_json(builder).await {
            Ok(doc) if doc.is_object() => Ok(Some(doc)),
            Ok(_) => Ok(None),
            Err(BackendError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn select(&self, query: &SelectArgs) -> Result<Vec<Value>, BackendError> {
        let builder = self
            .request(Method::GET, &query.table_name)
            .query(&select_query_pairs(query));
        let body = self.send_json(builder).await?;
        Ok(rows_from_body(body))
    }

    async fn insert(
        &self,
        table: &str,
        row: &Map<String, Value>,
    ) -> Result<Vec<Value>, BackendError> {
        let builder = self
            .request(Method::POST, table)
            .header("Prefer", RETURN_REPRESENTATION)
            .json(row);
        Ok(rows_from_body(self.send_json(builder).await?))
    }

    async fn update(
        &self,
        table: &str,
        filter: &EqFilter,
        data: &Map<String, Value>,
    ) -> Result<Vec<Value>, BackendError> {
        let builder = self
            .request(Method::PATCH, table)
            .query(&[filter_pair(filter)])
            .header("Prefer", RETURN_REPRESENTATION)
            .json(data);
        Ok(rows_from_body(self.send_json(builder).await?))
    }

    async fn delete(&self, table: &str, filter: &EqFilter) -> Result<Vec<Value>, BackendError> {
        let builder = self
            .request(Method::DELETE, table)
            .query(&[filter_pair(filter)])
            .header("Prefer", RETURN_REPRESENTATION);
        Ok(rows_from_body(self.send_json(builder).await?))
    }

    async fn execute_sql(&self, sql: &str) -> Result<Value, BackendError> {
        let builder = self
            .request(Method::POST, &format!("rpc/{}", self.sql_rpc))
            .json(&json!({ "query": sql }));
        match self.send_json(builder).await {
            Ok(result) => check_sql_result(result),
            Err(BackendError::NotFound(msg)) => {
                debug!(rpc = %self.sql_rpc, message = %msg, "native SQL endpoint not found");
                Err(BackendError::Unsupported)
            }
            Err(e) if is_missing_function(&e) => Err(BackendError::Unsupported),
            Err(e) => Err(e),
        }
    }
}

/// Builds `RestGateway` handles with the configured prefix, RPC name and timeout.
#[derive(Debug, Clone)]
pub struct RestConnector {
    rest_prefix: String,
    sql_rpc: String,
    timeout: Duration,
}

impl RestConnector {
    pub fn new(rest_prefix: impl Into<String>, sql_rpc: impl Into<String>, timeout: Duration) -> Self {
        Self {
            rest_prefix: rest_prefix.into(),
            sql_rpc: sql_rpc.into(),
            timeout,
        }
    }

    pub fn from_config(config: &CoreConfig) -> Self {
        Self::new(&config.rest_prefix, &config.sql_rpc, config.backend_timeout)
    }
}

impl BackendConnector for RestConnector {
    fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn DataBackend>, BackendError> {
        Ok(Arc::new(RestGateway::new(
            params,
            &self.rest_prefix,
            &self.sql_rpc,
            self.timeout,
        )?))
    }

    fn call_timeout(&self) -> Duration {
        self.timeout
    }
}

pub(crate) fn select_query_pairs(query: &SelectArgs) -> Vec<(String, String)> {
    let columns = match &query.columns {
        Some(cols) if !cols.is_empty() => cols.join(","),
        _ => "*".to_string(),
    };
    let mut pairs = vec![("select".to_string(), columns)];
    if let Some(filter) = &query.filter {
        pairs.push(filter_pair(filter));
    }
    pairs.push(("limit".to_string(), query.limit.to_string()));
    pairs
}

fn filter_pair(filter: &EqFilter) -> (String, String) {
    (filter.column.clone(), format!("eq.{}", filter.value))
}

pub(crate) fn rows_from_body(body: Value) -> Vec<Value> {
    match body {
        Value::Array(rows) => rows,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

/// Map a non-2xx gateway response to a `BackendError`, keeping the gateway's
/// own wording (`message`, `details`, `hint`).
pub(crate) fn classify_error(status: u16, body: &str) -> BackendError {
    let message = error_message(status, body);
    if status == 401 || status == 403 || mentions_invalid_key(&message) {
        BackendError::Unauthorized(message)
    } else if status == 404 {
        BackendError::NotFound(message)
    } else {
        BackendError::Api { status, message }
    }
}

fn error_message(status: u16, body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let parts: Vec<&str> = match &parsed {
        Some(v) => ["message", "error", "details", "hint"]
            .iter()
            .filter_map(|k| v.get(*k).and_then(Value::as_str))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect(),
        None => Vec::new(),
    };
    if !parts.is_empty() {
        return parts.join(" ");
    }
    let raw = body.trim();
    if raw.is_empty() {
        format!("HTTP {status}")
    } else {
        raw.to_string()
    }
}

fn is_missing_function(err: &BackendError) -> bool {
    match err {
        BackendError::Api { message, .. } => {
            let m = message.to_ascii_lowercase();
            m.contains("could not find the function") || m.contains("pgrst202")
        }
        _ => false,
    }
}

/// A native SQL function reports its own failures as `{success: false, error}`.
pub(crate) fn check_sql_result(result: Value) -> Result<Value, BackendError> {
    if result.get("success").and_then(Value::as_bool) == Some(false) {
        let message = result
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("SQL execution failed")
            .to_string();
        return Err(BackendError::Api {
            status: 200,
            message,
        });
    }
    Ok(result)
}
