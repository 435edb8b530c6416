//! Runs validated tool invocations against a `DataBackend`.
//!
//! Every path ends in a `ToolEnvelope`; backend errors, timeouts and rejected
//! arguments are all folded into `success: false` here and never reach the
//! orchestration loop as errors.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::conversation::ToolCallRequest;
use crate::envelope::{Payload, ToolEnvelope};
use crate::error::BackendError;
use crate::gateway::{collection_names_from_openapi, DataBackend};
use crate::registry::{self, DataOperation, SelectArgs};
use crate::sql::{self, ParsedStatement, StatementError};

/// Probed one by one when the gateway publishes no schema document.
pub const COMMON_TABLE_NAMES: &[&str] = &[
    "users",
    "profiles",
    "products",
    "orders",
    "customers",
    "posts",
    "comments",
    "items",
    "categories",
    "todos",
    "messages",
    "tasks",
];

pub const DESCRIBE_SAMPLE_ROWS: usize = 5;

const EMPTY_DATABASE: &str = "No tables found. The database looks empty.";
const EMPTY_TABLE: &str = "The table exists but has no rows yet, so column types cannot be inferred.";

pub struct Executor {
    backend: Arc<dyn DataBackend>,
    timeout: Duration,
    sql_rpc: String,
}

impl Executor {
    pub fn new(backend: Arc<dyn DataBackend>, timeout: Duration, sql_rpc: impl Into<String>) -> Self {
        Self {
            backend,
            timeout,
            sql_rpc: sql_rpc.into(),
        }
    }

    /// Validate and run one raw invocation.
    pub async fn dispatch(&self, call: &ToolCallRequest) -> ToolEnvelope {
        match registry::validate_call(&call.name, &call.arguments) {
            Ok(op) => self.run(&op).await,
            Err(e) => {
                warn!(tool = %call.name, error = %e, "rejected tool call");
                ToolEnvelope::failure(e.to_string())
            }
        }
    }

    /// Run a batch concurrently; results come back in invocation order.
    pub async fn dispatch_all(&self, calls: &[ToolCallRequest]) -> Vec<ToolEnvelope> {
        join_all(calls.iter().map(|c| self.dispatch(c))).await
    }

    pub async fn run(&self, op: &DataOperation) -> ToolEnvelope {
        let tool = op.kind().name();
        info!(tool, "running tool");
        let envelope = match op {
            DataOperation::ListTables => self.list_tables().await,
            DataOperation::ExecuteSql { sql, description } => {
                if let Some(d) = description {
                    debug!(description = %d, "execute_sql");
                }
                return self.execute_sql(sql).await;
            }
            other => self.run_rows(other).await,
        };
        envelope.unwrap_or_else(|e| {
            warn!(tool, error = %e, "tool failed");
            ToolEnvelope::failure(e.to_string())
        })
    }

    async fn call<T, F>(&self, fut: F) -> Result<T, BackendError>
    where
        F: Future<Output = Result<T, BackendError>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| BackendError::Timeout(self.timeout))?
    }

    async fn list_tables(&self) -> Result<ToolEnvelope, BackendError> {
        match self.call(self.backend.schema_document()).await {
            Ok(Some(doc)) => {
                let names = collection_names_from_openapi(&doc);
                if !names.is_empty() {
                    return Ok(tables_envelope(names));
                }
                debug!("schema document lists no collections; probing common names");
            }
            Ok(None) => debug!("no schema document; probing common names"),
            Err(e) if e.is_auth_failure() => return Err(e),
            Err(e) => debug!(error = %e, "schema document unavailable; probing common names"),
        }

        let probes = COMMON_TABLE_NAMES.iter().map(|name| async move {
            let found = self
                .call(self.backend.select(&SelectArgs::all(*name, 1)))
                .await
                .is_ok();
            (*name, found)
        });
        let names = join_all(probes)
            .await
            .into_iter()
            .filter(|(_, found)| *found)
            .map(|(name, _)| name.to_string())
            .collect();
        Ok(tables_envelope(names))
    }

    /// Row-level operations: describe, select, insert, update, delete.
    async fn run_rows(&self, op: &DataOperation) -> Result<ToolEnvelope, BackendError> {
        let payload = match op {
            DataOperation::DescribeTable { table_name } => {
                let sample = self
                    .call(
                        self.backend
                            .select(&SelectArgs::all(table_name.clone(), DESCRIBE_SAMPLE_ROWS)),
                    )
                    .await?;
                describe(table_name, sample)
            }
            DataOperation::SelectData(args) => {
                let mut rows = self.call(self.backend.select(args)).await?;
                rows.truncate(args.limit);
                Payload::rows(rows)
            }
            DataOperation::InsertData { table_name, data } => {
                Payload::inserted(self.call(self.backend.insert(table_name, data)).await?)
            }
            DataOperation::UpdateData {
                table_name,
                filter,
                data,
            } => Payload::updated(self.call(self.backend.update(table_name, filter, data)).await?),
            DataOperation::DeleteData { table_name, filter } => {
                Payload::deleted(self.call(self.backend.delete(table_name, filter)).await?)
            }
            DataOperation::ListTables | DataOperation::ExecuteSql { .. } => {
                return Err(BackendError::InvalidResponse(format!(
                    "{} is not a row operation",
                    op.kind().name()
                )))
            }
        };
        Ok(ToolEnvelope::ok(payload))
    }

    /// Native SQL first. The statement parser runs only when the native
    /// endpoint is absent or definitively rejected the statement; after a
    /// timeout or a lost connection the statement may already have run, so it
    /// is reported instead of replayed.
    async fn execute_sql(&self, sql: &str) -> ToolEnvelope {
        let native_error = match self.call(self.backend.execute_sql(sql)).await {
            Ok(result) => {
                return ToolEnvelope::ok(Payload::SqlResult {
                    result,
                    message: Some("SQL executed.".to_string()),
                })
            }
            Err(BackendError::Unsupported) => None,
            Err(e @ (BackendError::Api { .. } | BackendError::NotFound(_))) => {
                warn!(error = %e, "native SQL rejected; trying the statement parser");
                Some(e)
            }
            Err(e) => {
                warn!(error = %e, "native SQL outcome unknown; not retrying");
                return ToolEnvelope::failure_with(
                    Payload::EchoSql {
                        sql: sql.to_string(),
                    },
                    format!("{e}; the statement may or may not have been applied"),
                );
            }
        };

        let parsed = match sql::parse_statement(sql) {
            Ok(parsed) => parsed,
            Err(e) => return self.unparseable(sql, e, native_error.as_ref()),
        };

        if let ParsedStatement::Ddl(kind) = parsed {
            if let Some(e) = native_error {
                return ToolEnvelope::failure_with(
                    Payload::EchoSql {
                        sql: sql.to_string(),
                    },
                    e.to_string(),
                );
            }
            info!(?kind, "schema change needs the native SQL function");
            let message = format!(
                "Schema changes need the `{}` function in the database. Run setup_sql once in the SQL editor, then try again.",
                self.sql_rpc
            );
            return ToolEnvelope::failure_with(
                Payload::SetupRequired {
                    requires_setup: true,
                    message: message.clone(),
                    setup_sql: sql::setup_sql(&self.sql_rpc),
                    requested_sql: sql.to_string(),
                },
                message,
            );
        }

        match parsed.into_operation() {
            Some(op) => self
                .run_rows(&op)
                .await
                .unwrap_or_else(|e| ToolEnvelope::failure(e.to_string())),
            None => ToolEnvelope::failure_with(
                Payload::EchoSql {
                    sql: sql.to_string(),
                },
                "statement has no row-level equivalent",
            ),
        }
    }

    fn unparseable(
        &self,
        sql: &str,
        err: StatementError,
        native_error: Option<&BackendError>,
    ) -> ToolEnvelope {
        let error = match native_error {
            Some(native) => format!("{native}; fallback parser: {err}"),
            None => err.to_string(),
        };
        debug!(error = %error, "execute_sql could not be serviced");
        ToolEnvelope::failure_with(
            Payload::EchoSql {
                sql: sql.to_string(),
            },
            error,
        )
    }
}

fn tables_envelope(tables: Vec<String>) -> ToolEnvelope {
    let count = tables.len();
    ToolEnvelope::ok(Payload::Tables {
        message: (count == 0).then(|| EMPTY_DATABASE.to_string()),
        tables,
        count,
    })
}

fn describe(table_name: &str, sample: Vec<Value>) -> Payload {
    let mut columns: BTreeMap<String, String> = BTreeMap::new();
    for row in &sample {
        let Some(obj) = row.as_object() else { continue };
        for (key, value) in obj {
            let ty = json_type_name(value);
            columns
                .entry(key.clone())
                .and_modify(|seen| {
                    if seen == "null" {
                        *seen = ty.to_string();
                    }
                })
                .or_insert_with(|| ty.to_string());
        }
    }
    Payload::TableDescription {
        table_name: table_name.to_string(),
        row_count: sample.len(),
        message: sample.is_empty().then(|| EMPTY_TABLE.to_string()),
        columns,
        sample_data: sample,
    }
}

pub fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MemoryGateway;
    use serde_json::json;

    fn executor(gw: MemoryGateway) -> (Arc<MemoryGateway>, Executor) {
        let gw = Arc::new(gw);
        let ex = Executor::new(gw.clone(), Duration::from_secs(2), "exec_sql");
        (gw, ex)
    }

    fn call(name: &str, args: Value) -> ToolCallRequest {
        ToolCallRequest::new("c1", name, args.to_string())
    }

    fn shop() -> MemoryGateway {
        MemoryGateway::new()
            .with_table(
                "products",
                vec![
                    json!({"id": 1, "name": "Lamp", "note": null}),
                    json!({"id": 2, "name": "Desk", "note": "oak"}),
                    json!({"id": 3, "name": "Chair", "note": null}),
                ],
            )
            .with_table("orders", vec![])
    }

    #[tokio::test]
    async fn list_tables_prefers_the_schema_document() {
        let (_, ex) = executor(shop());
        let env = ex.dispatch(&call("list_tables", json!({}))).await;
        assert!(env.success);
        assert_eq!(
            env.payload,
            Payload::Tables {
                tables: vec!["orders".into(), "products".into()],
                count: 2,
                message: None
            }
        );
    }

    #[tokio::test]
    async fn list_tables_probes_common_names_without_schema() {
        let (gw, ex) = executor(
            MemoryGateway::new()
                .with_table("orders", vec![])
                .with_table("users", vec![json!({"id": 1})])
                .with_table("audit_log", vec![])
                .without_schema_document(),
        );
        let env = ex.run(&DataOperation::ListTables).await;
        assert_eq!(
            env.payload,
            Payload::Tables {
                tables: vec!["users".into(), "orders".into()],
                count: 2,
                message: None
            }
        );
        assert_eq!(gw.calls(), 1 + COMMON_TABLE_NAMES.len());

        let (_, ex) = executor(MemoryGateway::new().without_schema_document());
        let env = ex.run(&DataOperation::ListTables).await;
        assert!(env.success);
        assert!(matches!(env.payload, Payload::Tables { count: 0, message: Some(_), .. }));
    }

    #[tokio::test]
    async fn describe_infers_types_and_distinguishes_empty_from_missing() {
        let (_, ex) = executor(shop());
        let env = ex
            .dispatch(&call("describe_table", json!({"table_name": "products"})))
            .await;
        match env.payload {
            Payload::TableDescription {
                columns, row_count, ..
            } => {
                assert_eq!(row_count, 3);
                assert_eq!(columns["id"], "number");
                assert_eq!(columns["name"], "string");
                assert_eq!(columns["note"], "string");
            }
            other => panic!("unexpected payload {other:?}"),
        }

        let env = ex
            .dispatch(&call("describe_table", json!({"table_name": "orders"})))
            .await;
        assert!(env.success);
        assert!(matches!(
            env.payload,
            Payload::TableDescription { row_count: 0, message: Some(_), .. }
        ));

        let env = ex
            .dispatch(&call("describe_table", json!({"table_name": "ghosts"})))
            .await;
        assert!(!env.success);
        assert!(env.error.unwrap().contains("does not exist"));
    }

    #[tokio::test]
    async fn select_never_returns_more_than_limit() {
        let (_, ex) = executor(shop());
        for limit in 1..=4u64 {
            let env = ex
                .dispatch(&call("select_data", json!({"table_name": "products", "limit": limit})))
                .await;
            match env.payload {
                Payload::Rows { data, count } => {
                    assert!(count as u64 <= limit);
                    assert_eq!(count, data.len());
                }
                other => panic!("unexpected payload {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn insert_returns_exactly_the_backend_rows() {
        let (_, ex) = executor(shop());
        let env = ex
            .dispatch(&call(
                "insert_data",
                json!({"table_name": "products", "data": {"name": "Shelf"}}),
            ))
            .await;
        assert!(env.success);
        assert_eq!(env.payload, Payload::inserted(vec![json!({"id": 4, "name": "Shelf"})]));

        let env = ex
            .dispatch(&call(
                "insert_data",
                json!({"table_name": "nope", "data": {"name": "x"}}),
            ))
            .await;
        assert!(!env.success);
        assert_eq!(env.payload, Payload::Empty {});
    }

    #[tokio::test]
    async fn malformed_calls_become_failed_envelopes() {
        let (gw, ex) = executor(shop());
        let env = ex
            .dispatch(&ToolCallRequest::new("x", "select_data", "{not json"))
            .await;
        assert!(!env.success);
        let env = ex.dispatch(&call("truncate_all", json!({}))).await;
        assert!(!env.success);
        assert_eq!(gw.calls(), 0);
    }

    #[tokio::test]
    async fn drop_without_native_sql_requires_setup_and_touches_nothing_else() {
        let (gw, ex) = executor(shop());
        let env = ex
            .dispatch(&call("execute_sql", json!({"sql": "DROP TABLE products"})))
            .await;
        assert!(!env.success);
        assert!(env.requires_setup());
        match &env.payload {
            Payload::SetupRequired {
                setup_sql,
                requested_sql,
                ..
            } => {
                assert!(!setup_sql.is_empty());
                assert_eq!(requested_sql, "DROP TABLE products");
            }
            other => panic!("unexpected payload {other:?}"),
        }
        // Only the native SQL attempt reached the backend.
        assert_eq!(gw.calls(), 1);
        assert_eq!(gw.rows("products").unwrap().len(), 3);
    }

    #[tokio::test]
    async fn execute_sql_uses_native_endpoint_first() {
        let (gw, ex) = executor(shop().with_native_sql(|_| Ok(json!({"success": true}))));
        let env = ex
            .dispatch(&call("execute_sql", json!({"sql": "CREATE TABLE t (id int)"})))
            .await;
        assert!(env.success);
        assert_eq!(gw.calls(), 1);
    }

    #[tokio::test]
    async fn execute_sql_falls_back_to_the_parser() {
        let (gw, ex) = executor(shop().with_native_sql(|_| {
            Err(BackendError::Api {
                status: 200,
                message: "permission denied".into(),
            })
        }));
        let env = ex
            .dispatch(&call(
                "execute_sql",
                json!({"sql": "INSERT INTO products (name, note) VALUES ('Rug', 'wool')"}),
            ))
            .await;
        assert!(env.success);
        assert!(matches!(env.payload, Payload::Inserted { count: 1, .. }));
        assert_eq!(gw.rows("products").unwrap().len(), 4);

        let env = ex
            .dispatch(&call("execute_sql", json!({"sql": "DELETE FROM products"})))
            .await;
        assert!(!env.success);
        assert_eq!(
            env.payload,
            Payload::EchoSql {
                sql: "DELETE FROM products".into()
            }
        );
        assert_eq!(gw.rows("products").unwrap().len(), 4);
    }

    #[tokio::test]
    async fn uncertain_native_outcome_is_not_replayed() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        for err in [
            BackendError::Timeout(Duration::from_secs(30)),
            BackendError::Transport("connection reset".into()),
        ] {
            let runs = Arc::new(AtomicUsize::new(0));
            let seen = runs.clone();
            let (gw, ex) = executor(shop().with_native_sql(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(err.clone())
            }));
            let sql = "INSERT INTO products (name) VALUES ('Rug')";
            let env = ex.dispatch(&call("execute_sql", json!({ "sql": sql }))).await;

            assert!(!env.success);
            assert_eq!(env.payload, Payload::EchoSql { sql: sql.into() });
            assert_eq!(runs.load(Ordering::SeqCst), 1);
            assert_eq!(gw.rows("products").unwrap().len(), 3);
        }
    }

    #[tokio::test]
    async fn slow_backend_times_out_into_a_failed_envelope() {
        let gw = Arc::new(shop().with_latency(Duration::from_millis(500)));
        let ex = Executor::new(gw, Duration::from_millis(20), "exec_sql");
        let env = ex
            .dispatch(&call("select_data", json!({"table_name": "products"})))
            .await;
        assert!(!env.success);
        assert!(env.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn batch_results_keep_invocation_order() {
        let (_, ex) = executor(shop());
        let calls = vec![
            call("describe_table", json!({"table_name": "ghosts"})),
            call("select_data", json!({"table_name": "products", "limit": 1})),
            call("list_tables", json!({})),
        ];
        let results = ex.dispatch_all(&calls).await;
        assert_eq!(results.len(), 3);
        assert!(!results[0].success);
        assert!(matches!(results[1].payload, Payload::Rows { count: 1, .. }));
        assert!(matches!(results[2].payload, Payload::Tables { .. }));
    }
}
