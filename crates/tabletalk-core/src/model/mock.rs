//! Offline models: a keyword-driven mock for demos and a scripted model for tests.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::{ChatModel, ModelReply};
use crate::conversation::{ToolCallRequest, Turn};
use crate::error::ModelError;
use crate::registry::{is_identifier, DEFAULT_SELECT_LIMIT};

const MAX_NARRATED_ROWS: usize = 10;

const STOP_WORDS: &[&str] = &[
    "me", "all", "the", "a", "an", "of", "from", "rows", "records", "data", "in", "table", "my",
    "every", "some", "please", "entries", "contents",
];

/// Deterministic keyword model, good enough to drive the loop without an API key.
///
/// - "describe X" / "columns of X" → `describe_table`
/// - anything mentioning "tables" → `list_tables`
/// - "show/list/get/display/fetch … X" → `select_data` on X
/// - after tool results: narrates the latest envelope
#[derive(Debug, Default, Clone)]
pub struct MockModel;

impl MockModel {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ChatModel for MockModel {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, turns: &[Turn], _tools: &[Value]) -> Result<ModelReply, ModelError> {
        if let Some(Turn::Tool { content, .. }) = turns.last() {
            return Ok(ModelReply::text(narrate(content)));
        }

        let question = turns
            .iter()
            .rev()
            .find_map(|t| match t {
                Turn::User { content } => Some(content.as_str()),
                _ => None,
            })
            .unwrap_or_default();

        Ok(match plan(question) {
            Some((name, args)) => {
                ModelReply::tool_calls(vec![ToolCallRequest::new("", name, args.to_string())])
            }
            None => ModelReply::text(
                "I can list your tables, describe a table, or show its rows. Try \"show me all products\".",
            ),
        })
    }
}

fn words(question: &str) -> Vec<String> {
    question
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_ascii_lowercase())
        .collect()
}

fn first_table_word<'a>(words: impl Iterator<Item = &'a String>) -> Option<String> {
    words
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .find(|w| is_identifier(w))
        .cloned()
}

fn plan(question: &str) -> Option<(&'static str, Value)> {
    let words = words(question);

    for (i, w) in words.iter().enumerate() {
        if matches!(w.as_str(), "describe" | "columns" | "schema" | "structure") {
            if let Some(table) = first_table_word(words.iter().skip(i + 1)) {
                return Some(("describe_table", json!({ "table_name": table })));
            }
        }
    }

    if words.iter().any(|w| w == "tables") {
        return Some(("list_tables", json!({})));
    }

    for (i, w) in words.iter().enumerate() {
        if matches!(w.as_str(), "show" | "list" | "get" | "display" | "fetch") {
            if let Some(table) = first_table_word(words.iter().skip(i + 1)) {
                return Some((
                    "select_data",
                    json!({ "table_name": table, "limit": DEFAULT_SELECT_LIMIT }),
                ));
            }
        }
    }
    None
}

/// Plain-text summary of a tool envelope.
fn narrate(content: &str) -> String {
    let Ok(v) = serde_json::from_str::<Value>(content) else {
        return "The tool returned something I could not read.".to_string();
    };

    if v.get("success").and_then(Value::as_bool) != Some(true) {
        let error = v
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        if v.get("requires_setup").and_then(Value::as_bool) == Some(true) {
            return format!("{error}\n\nSetup script:\n{}", v["setup_sql"].as_str().unwrap_or_default());
        }
        return format!("That did not work: {error}");
    }

    if let Some(tables) = v.get("tables").and_then(Value::as_array) {
        if tables.is_empty() {
            return "I could not find any tables; the database looks empty.".to_string();
        }
        let names: Vec<&str> = tables.iter().filter_map(Value::as_str).collect();
        return format!("Found {} table(s): {}.", names.len(), names.join(", "));
    }

    if let (Some(table), Some(columns)) = (
        v.get("table_name").and_then(Value::as_str),
        v.get("columns").and_then(Value::as_object),
    ) {
        if columns.is_empty() {
            return format!("Table {table} exists but has no rows yet.");
        }
        let cols: Vec<String> = columns
            .iter()
            .map(|(k, t)| format!("{k} ({})", t.as_str().unwrap_or("?")))
            .collect();
        return format!("Table {table} has columns: {}.", cols.join(", "));
    }

    for (key, verb) in [
        ("data", "Found"),
        ("inserted", "Inserted"),
        ("updated", "Updated"),
        ("deleted", "Deleted"),
    ] {
        if let Some(rows) = v.get(key).and_then(Value::as_array) {
            let mut out = format!("{verb} {} row(s).", rows.len());
            for row in rows.iter().take(MAX_NARRATED_ROWS) {
                out.push_str(&format!("\n- {row}"));
            }
            if rows.len() > MAX_NARRATED_ROWS {
                out.push_str(&format!("\n… and {} more", rows.len() - MAX_NARRATED_ROWS));
            }
            return out;
        }
    }

    "Done.".to_string()
}

/// Replays queued replies and records every request it receives.
pub struct ScriptedModel {
    script: Mutex<VecDeque<Result<ModelReply, ModelError>>>,
    fallback: Option<ModelReply>,
    requests: Mutex<Vec<Vec<Turn>>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<ModelReply>) -> Self {
        Self {
            script: Mutex::new(replies.into_iter().map(Ok).collect()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A model that answers every request with `reply`.
    pub fn repeating(reply: ModelReply) -> Self {
        Self {
            fallback: Some(reply),
            ..Self::new(Vec::new())
        }
    }

    pub fn then_error(self, err: ModelError) -> Self {
        self.script.lock().push_back(Err(err));
        self
    }

    pub fn requests(&self) -> Vec<Vec<Turn>> {
        self.requests.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, turns: &[Turn], _tools: &[Value]) -> Result<ModelReply, ModelError> {
        self.requests.lock().push(turns.to_vec());
        match self.script.lock().pop_front() {
            Some(next) => next,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| ModelError::InvalidResponse("scripted model has no more replies".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(content: &str) -> Vec<Turn> {
        vec![
            Turn::System {
                content: "sys".into(),
            },
            Turn::User {
                content: content.into(),
            },
        ]
    }

    #[tokio::test]
    async fn mock_plans_tool_calls_from_keywords() {
        let model = MockModel::new();
        let reply = model.complete(&user("show me all products"), &[]).await.unwrap();
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].name, "select_data");
        let args: Value = serde_json::from_str(&reply.tool_calls[0].arguments).unwrap();
        assert_eq!(args, json!({"table_name": "products", "limit": 50}));

        let reply = model.complete(&user("What tables do I have?"), &[]).await.unwrap();
        assert_eq!(reply.tool_calls[0].name, "list_tables");

        let reply = model.complete(&user("describe the orders table"), &[]).await.unwrap();
        assert_eq!(reply.tool_calls[0].name, "describe_table");
        assert_eq!(reply.tool_calls[0].arguments, r#"{"table_name":"orders"}"#);

        let reply = model.complete(&user("hello there"), &[]).await.unwrap();
        assert!(!reply.has_tool_calls());
        assert!(reply.non_empty_content().is_some());
    }

    #[tokio::test]
    async fn mock_narrates_tool_results() {
        let mut turns = user("show me all products");
        turns.push(Turn::Tool {
            tool_call_id: "call_1_0".into(),
            content: r#"{"success":true,"data":[{"id":1},{"id":2}],"count":2}"#.into(),
        });
        let reply = MockModel::new().complete(&turns, &[]).await.unwrap();
        assert!(!reply.has_tool_calls());
        assert!(reply.content.unwrap().starts_with("Found 2 row(s)."));

        assert_eq!(
            narrate(r#"{"success":false,"error":"relation \"x\" does not exist"}"#),
            "That did not work: relation \"x\" does not exist"
        );
        assert_eq!(
            narrate(r#"{"success":true,"tables":["a","b"],"count":2}"#),
            "Found 2 table(s): a, b."
        );
    }

    #[tokio::test]
    async fn scripted_model_replays_then_falls_back_or_fails() {
        let model = ScriptedModel::new(vec![ModelReply::text("one")])
            .then_error(ModelError::RateLimited { retry_after_ms: 1000 });
        assert_eq!(model.complete(&[], &[]).await.unwrap(), ModelReply::text("one"));
        assert!(matches!(
            model.complete(&[], &[]).await,
            Err(ModelError::RateLimited { .. })
        ));
        assert!(model.complete(&[], &[]).await.is_err());
        assert_eq!(model.calls(), 3);

        let model = ScriptedModel::repeating(ModelReply::text("again"));
        for _ in 0..3 {
            assert_eq!(model.complete(&[], &[]).await.unwrap(), ModelReply::text("again"));
        }
    }
}
