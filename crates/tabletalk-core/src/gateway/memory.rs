//! In-memory `DataBackend` for demos and tests.
//!
//! Rows are JSON objects; equality filters compare the text form of values,
//! the way the REST gateway compares query-string values.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};

use super::{BackendConnector, ConnectionParams, DataBackend};
use crate::error::BackendError;
use crate::registry::{EqFilter, SelectArgs};

type Row = Map<String, Value>;
type NativeSql = Arc<dyn Fn(&str) -> Result<Value, BackendError> + Send + Sync>;

pub struct MemoryGateway {
    tables: RwLock<BTreeMap<String, Vec<Row>>>,
    native_sql: Option<NativeSql>,
    publish_schema: bool,
    reject_credential: bool,
    latency: Option<Duration>,
    calls: AtomicUsize,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(BTreeMap::new()),
            native_sql: None,
            publish_schema: true,
            reject_credential: false,
            latency: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Add a table. Non-object rows are ignored.
    pub fn with_table(self, name: impl Into<String>, rows: Vec<Value>) -> Self {
        let rows = rows
            .into_iter()
            .filter_map(|r| match r {
                Value::Object(o) => Some(o),
                _ => None,
            })
            .collect();
        self.tables.write().insert(name.into(), rows);
        self
    }

    pub fn with_native_sql<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> Result<Value, BackendError> + Send + Sync + 'static,
    {
        self.native_sql = Some(Arc::new(f));
        self
    }

    /// Behave like a gateway that publishes no schema document.
    pub fn without_schema_document(mut self) -> Self {
        self.publish_schema = false;
        self
    }

    /// Refuse every call as if the credential were invalid.
    pub fn rejecting_credential(mut self) -> Self {
        self.reject_credential = true;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of backend calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reset_calls(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }

    pub fn rows(&self, table: &str) -> Option<Vec<Value>> {
        self.tables
            .read()
            .get(table)
            .map(|rows| rows.iter().cloned().map(Value::Object).collect())
    }

    async fn enter(&self) -> Result<(), BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.reject_credential {
            return Err(BackendError::Unauthorized("Invalid API key".to_string()));
        }
        Ok(())
    }
}

fn missing_table(table: &str) -> BackendError {
    BackendError::NotFound(format!("relation \"public.{table}\" does not exist"))
}

fn missing_column(table: &str, column: &str) -> BackendError {
    BackendError::Api {
        status: 400,
        message: format!("column {table}.{column} does not exist"),
    }
}

fn value_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn matches(row: &Row, filter: &EqFilter) -> bool {
    row.get(&filter.column)
        .and_then(value_text)
        .is_some_and(|v| v == filter.value)
}

/// Columns are only checked once a table has rows to infer them from.
fn check_column(rows: &[Row], table: &str, column: &str) -> Result<(), BackendError> {
    if rows.is_empty() || rows.iter().any(|r| r.contains_key(column)) {
        Ok(())
    } else {
        Err(missing_column(table, column))
    }
}

#[async_trait]
impl DataBackend for MemoryGateway {
    async fn schema_document(&self) -> Result<Option<Value>, BackendError> {
        self.enter().await?;
        if !self.publish_schema {
            return Ok(None);
        }
        let mut paths = Map::new();
        paths.insert("/".to_string(), json!({}));
        for name in self.tables.read().keys() {
            paths.insert(format!("/{name}"), json!({}));
        }
        Ok(Some(json!({ "swagger": "2.0", "paths": paths })))
    }

    async fn select(&self, query: &SelectArgs) -> Result<Vec<Value>, BackendError> {
        self.enter().await?;
        let tables = self.tables.read();
        let rows = tables
            .get(&query.table_name)
            .ok_or_else(|| missing_table(&query.table_name))?;
        if let Some(filter) = &query.filter {
            check_column(rows, &query.table_name, &filter.column)?;
        }
        if let Some(columns) = &query.columns {
            for c in columns {
                check_column(rows, &query.table_name, c)?;
            }
        }

        Ok(rows
            .iter()
            .filter(|r| query.filter.as_ref().map_or(true, |f| matches(r, f)))
            .take(query.limit)
            .map(|r| match &query.columns {
                Some(columns) => Value::Object(
                    columns
                        .iter()
                        .filter_map(|c| r.get(c).map(|v| (c.clone(), v.clone())))
                        .collect(),
                ),
                None => Value::Object(r.clone()),
            })
            .collect())
    }

    async fn insert(
        &self,
        table: &str,
        row: &Map<String, Value>,
    ) -> Result<Vec<Value>, BackendError> {
        self.enter().await?;
        let mut tables = self.tables.write();
        let rows = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        let mut row = row.clone();
        if !row.contains_key("id") && rows.iter().any(|r| r.contains_key("id")) {
            let next = rows
                .iter()
                .filter_map(|r| r.get("id").and_then(Value::as_i64))
                .max()
                .unwrap_or(0)
                + 1;
            row.insert("id".to_string(), json!(next));
        }
        rows.push(row.clone());
        Ok(vec![Value::Object(row)])
    }

    async fn update(
        &self,
        table: &str,
        filter: &EqFilter,
        data: &Map<String, Value>,
    ) -> Result<Vec<Value>, BackendError> {
        self.enter().await?;
        let mut tables = self.tables.write();
        let rows = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        check_column(rows, table, &filter.column)?;
        let mut updated = Vec::new();
        for row in rows.iter_mut().filter(|r| matches(r, filter)) {
            for (k, v) in data {
                row.insert(k.clone(), v.clone());
            }
            updated.push(Value::Object(row.clone()));
        }
        Ok(updated)
    }

    async fn delete(&self, table: &str, filter: &EqFilter) -> Result<Vec<Value>, BackendError> {
        self.enter().await?;
        let mut tables = self.tables.write();
        let rows = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        check_column(rows, table, &filter.column)?;
        let (deleted, kept): (Vec<Row>, Vec<Row>) =
            rows.drain(..).partition(|r| matches(r, filter));
        *rows = kept;
        Ok(deleted.into_iter().map(Value::Object).collect())
    }

    async fn execute_sql(&self, sql: &str) -> Result<Value, BackendError> {
        self.enter().await?;
        match &self.native_sql {
            Some(f) => f(sql),
            None => Err(BackendError::Unsupported),
        }
    }
}

/// Hands out the same shared `MemoryGateway` for every request.
pub struct MemoryConnector {
    gateway: Arc<MemoryGateway>,
    timeout: Duration,
    connections: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(gateway: Arc<MemoryGateway>) -> Self {
        Self {
            gateway,
            timeout: Duration::from_secs(5),
            connections: AtomicUsize::new(0),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl BackendConnector for MemoryConnector {
    fn connect(&self, _params: &ConnectionParams) -> Result<Arc<dyn DataBackend>, BackendError> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        let handle: Arc<dyn DataBackend> = self.gateway.clone();
        Ok(handle)
    }

    fn call_timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shop() -> MemoryGateway {
        MemoryGateway::new().with_table(
            "products",
            vec![
                json!({"id": 1, "name": "Lamp", "price": 20}),
                json!({"id": 2, "name": "Desk", "price": 150}),
                json!({"id": 3, "name": "Chair", "price": 80}),
            ],
        )
    }

    fn eq(column: &str, value: &str) -> EqFilter {
        EqFilter {
            column: column.into(),
            value: value.into(),
        }
    }

    #[tokio::test]
    async fn select_filters_by_text_and_respects_limit() {
        let gw = shop();
        let rows = gw.select(&SelectArgs::all("products", 2)).await.unwrap();
        assert_eq!(rows.len(), 2);

        let mut q = SelectArgs::all("products", 50);
        q.filter = Some(eq("id", "2"));
        q.columns = Some(vec!["name".into()]);
        assert_eq!(gw.select(&q).await.unwrap(), vec![json!({"name": "Desk"})]);

        let err = gw.select(&SelectArgs::all("nope", 1)).await.unwrap_err();
        assert!(matches!(err, BackendError::NotFound(_)));
        assert_eq!(gw.calls(), 3);
    }

    #[tokio::test]
    async fn mutations_return_affected_rows() {
        let gw = shop();
        let mut row = Map::new();
        row.insert("name".into(), json!("Shelf"));
        let inserted = gw.insert("products", &row).await.unwrap();
        assert_eq!(inserted, vec![json!({"id": 4, "name": "Shelf"})]);

        let mut data = Map::new();
        data.insert("price".into(), json!(25));
        let updated = gw.update("products", &eq("name", "Lamp"), &data).await.unwrap();
        assert_eq!(updated, vec![json!({"id": 1, "name": "Lamp", "price": 25})]);

        let deleted = gw.delete("products", &eq("id", "3")).await.unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(gw.rows("products").unwrap().len(), 3);

        let err = gw.delete("products", &eq("colour", "red")).await.unwrap_err();
        assert_eq!(err.to_string(), "column products.colour does not exist");
    }

    #[tokio::test]
    async fn probe_surfaces_credential_rejection() {
        let gw = shop();
        assert!(matches!(gw.probe().await, Err(BackendError::NotFound(_))));
        let gw = shop().rejecting_credential();
        assert!(gw.probe().await.unwrap_err().is_auth_failure());
    }

    #[tokio::test]
    async fn native_sql_is_optional() {
        let gw = shop();
        assert!(matches!(
            gw.execute_sql("select 1").await,
            Err(BackendError::Unsupported)
        ));
        let gw = shop().with_native_sql(|_| Ok(json!({"success": true})));
        assert_eq!(gw.execute_sql("select 1").await.unwrap(), json!({"success": true}));
    }
}
