//! The tool result envelope: the only thing the model ever sees from the
//! executor.
//!
//! On the wire an envelope is one flat JSON object: `success`, the payload
//! fields, and an optional `error`. Raw backend errors never leak through;
//! they are rendered into `error` first.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Tables {
        tables: Vec<String>,
        count: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    TableDescription {
        table_name: String,
        columns: BTreeMap<String, String>,
        sample_data: Vec<Value>,
        row_count: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Rows {
        data: Vec<Value>,
        count: usize,
    },
    Inserted {
        inserted: Vec<Value>,
        count: usize,
    },
    Updated {
        updated: Vec<Value>,
        count: usize,
    },
    Deleted {
        deleted: Vec<Value>,
        count: usize,
    },
    SetupRequired {
        requires_setup: bool,
        message: String,
        setup_sql: String,
        requested_sql: String,
    },
    SqlResult {
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    EchoSql {
        sql: String,
    },
    Empty {},
}

impl Payload {
    pub fn rows(data: Vec<Value>) -> Self {
        let count = data.len();
        Self::Rows { data, count }
    }

    pub fn inserted(rows: Vec<Value>) -> Self {
        let count = rows.len();
        Self::Inserted {
            inserted: rows,
            count,
        }
    }

    pub fn updated(rows: Vec<Value>) -> Self {
        let count = rows.len();
        Self::Updated {
            updated: rows,
            count,
        }
    }

    pub fn deleted(rows: Vec<Value>) -> Self {
        let count = rows.len();
        Self::Deleted {
            deleted: rows,
            count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEnvelope {
    pub success: bool,
    #[serde(flatten)]
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolEnvelope {
    pub fn ok(payload: Payload) -> Self {
        Self {
            success: true,
            payload,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: Payload::Empty {},
            error: Some(error.into()),
        }
    }

    /// A failure that still carries a payload, e.g. the offending SQL.
    pub fn failure_with(payload: Payload, error: impl Into<String>) -> Self {
        Self {
            success: false,
            payload,
            error: Some(error.into()),
        }
    }

    pub fn requires_setup(&self) -> bool {
        matches!(
            self.payload,
            Payload::SetupRequired {
                requires_setup: true,
                ..
            }
        )
    }

    /// Text handed to the model as the tool turn content.
    pub fn to_content(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!("{{\"success\":false,\"error\":\"failed to serialize tool result: {e}\"}}")
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JsonExtractError {
    #[error("no JSON object found (no '{{')")]
    NoObject,
    #[error("unterminated JSON object (no '}}')")]
    Unterminated,
    #[error("invalid JSON: {0}")]
    Invalid(String),
}

/// Read an envelope (or any object) back out of text that may wrap it in
/// prose or a markdown fence. The object is the first `{` and its matching
/// `}`; braces inside string values do not count.
pub fn parse_json_object<T: DeserializeOwned>(text: &str) -> Result<T, JsonExtractError> {
    let text = text.trim();
    if let Ok(v) = serde_json::from_str(text) {
        return Ok(v);
    }

    let open = text.find('{').ok_or(JsonExtractError::NoObject)?;
    let close = matching_brace(&text[open..])
        .map(|len| open + len)
        .or_else(|| text.rfind('}').filter(|&i| i > open))
        .ok_or(JsonExtractError::Unterminated)?;

    serde_json::from_str(&text[open..=close]).map_err(|e| JsonExtractError::Invalid(e.to_string()))
}

/// Byte offset of the `}` closing the object that starts at `s[0]`.
fn matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, b) in s.bytes().enumerate() {
        match (in_string, b) {
            (true, _) if escaped => escaped = false,
            (true, b'\\') => escaped = true,
            (true, b'"') => in_string = false,
            (true, _) => {}
            (false, b'"') => in_string = true,
            (false, b'{') => depth += 1,
            (false, b'}') => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn envelope_is_flat_on_the_wire() {
        let env = ToolEnvelope::ok(Payload::rows(vec![json!({"id": 1})]));
        let v: Value = serde_json::from_str(&env.to_content()).unwrap();
        assert_eq!(v, json!({"success": true, "data": [{"id": 1}], "count": 1}));

        let env = ToolEnvelope::failure("relation \"nope\" does not exist");
        let v: Value = serde_json::from_str(&env.to_content()).unwrap();
        assert_eq!(
            v,
            json!({"success": false, "error": "relation \"nope\" does not exist"})
        );
    }

    #[test]
    fn rows_envelope_deserializes_back_to_rows() {
        let env = ToolEnvelope::ok(Payload::rows(vec![json!({"name": "Lamp"})]));
        let back: ToolEnvelope = parse_json_object(&env.to_content()).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn setup_required_is_detected() {
        let env = ToolEnvelope::failure_with(
            Payload::SetupRequired {
                requires_setup: true,
                message: "needs exec_sql".into(),
                setup_sql: "CREATE FUNCTION ...".into(),
                requested_sql: "DROP TABLE t".into(),
            },
            "needs exec_sql",
        );
        assert!(env.requires_setup());
        assert!(!ToolEnvelope::failure("x").requires_setup());
    }

    #[test]
    fn extracts_object_wrapped_in_prose() {
        let text = "Sure! Here it is:\n```json\n{\"success\": true, \"note\": \"a } inside\"}\n```\nDone {";
        let v: Value = parse_json_object(text).unwrap();
        assert_eq!(v["success"], json!(true));
        assert_eq!(v["note"], json!("a } inside"));
    }

    #[test]
    fn reports_missing_object() {
        let err = parse_json_object::<Value>("no json here").unwrap_err();
        assert_eq!(err, JsonExtractError::NoObject);
    }

    fn scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-zA-Z0-9 {}\"'\\\\]{0,12}".prop_map(Value::String),
        ]
    }

    fn row() -> impl Strategy<Value = Value> {
        proptest::collection::btree_map("[a-z_]{1,8}", scalar(), 0..5)
            .prop_map(|m| Value::Object(m.into_iter().collect()))
    }

    proptest! {
        #[test]
        fn envelope_text_round_trips_through_extraction(
            success in any::<bool>(),
            data in proptest::collection::vec(row(), 0..6),
            prefix in "[a-zA-Z ,.!]{0,20}",
        ) {
            let env = ToolEnvelope {
                success,
                payload: Payload::rows(data.clone()),
                error: if success { None } else { Some("boom".to_string()) },
            };
            let text = format!("{prefix}{}", env.to_content());
            let v: Value = parse_json_object(&text).unwrap();
            prop_assert_eq!(v["success"].as_bool(), Some(success));
            prop_assert_eq!(v["data"].as_array().cloned(), Some(data.clone()));
            prop_assert_eq!(v["count"].as_u64(), Some(data.len() as u64));
        }
    }
}
