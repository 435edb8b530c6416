//! OpenAI-compatible chat-completions client with tool calling.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use super::{ChatModel, ModelReply};
use crate::config::ModelConfig;
use crate::conversation::{ToolCallRequest, Turn};
use crate::error::ModelError;

const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

pub struct OpenAiChatModel {
    client: Client,
    config: ModelConfig,
}

impl OpenAiChatModel {
    pub fn new(config: ModelConfig) -> Result<Self, ModelError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ModelError::NotConfigured(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    fn name(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, turns: &[Turn], tools: &[Value]) -> Result<ModelReply, ModelError> {
        if self.config.api_key.trim().is_empty() {
            return Err(ModelError::NotConfigured(
                "no model API key (set TABLETALK_MODEL_API_KEY or OPENAI_API_KEY)".to_string(),
            ));
        }

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let mut body = json!({
            "model": self.config.model,
            "messages": turns_to_messages(turns),
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
            body["tool_choice"] = json!("auto");
        }

        debug!(model = %self.config.model, turns = turns.len(), "chat completion request");
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout(self.config.timeout)
                } else {
                    ModelError::Network(e.to_string())
                }
            })?;

        if response.status() == 429 {
            return Err(ModelError::RateLimited {
                retry_after_ms: retry_after_ms(response.headers()),
            });
        }

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ModelError::Api(format!("{status}: {error_text}")));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;
        parse_chat_completion(&data)
    }
}

/// `Retry-After` in milliseconds. Only the delta-seconds form is understood;
/// anything else falls back to the default wait.
fn retry_after_ms(headers: &HeaderMap) -> u64 {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
        .saturating_mul(1000)
}

/// Render turns as chat-completions `messages`.
pub fn turns_to_messages(turns: &[Turn]) -> Vec<Value> {
    turns
        .iter()
        .map(|t| match t {
            Turn::System { content } => json!({ "role": "system", "content": content }),
            Turn::User { content } => json!({ "role": "user", "content": content }),
            Turn::Assistant {
                content,
                tool_calls,
            } => {
                let mut m = json!({ "role": "assistant", "content": content });
                if !tool_calls.is_empty() {
                    m["tool_calls"] = tool_calls
                        .iter()
                        .map(|c| {
                            json!({
                                "id": c.id,
                                "type": "function",
                                "function": { "name": c.name, "arguments": c.arguments },
                            })
                        })
                        .collect();
                }
                m
            }
            Turn::Tool {
                tool_call_id,
                content,
            } => json!({ "role": "tool", "tool_call_id": tool_call_id, "content": content }),
        })
        .collect()
}

/// Extract the assistant turn from a chat-completions response body.
///
/// Tool calls missing an id come back with an empty id; the orchestrator
/// assigns one.
pub fn parse_chat_completion(data: &Value) -> Result<ModelReply, ModelError> {
    if let Some(err) = data.get("error").filter(|e| !e.is_null()) {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return Err(ModelError::Api(message));
    }

    let message = data
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| ModelError::InvalidResponse("response has no choices[0].message".to_string()))?;

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            let function = call.get("function").ok_or_else(|| {
                ModelError::InvalidResponse("tool call without `function`".to_string())
            })?;
            let name = function
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| ModelError::InvalidResponse("tool call without a name".to_string()))?;
            let arguments = match function.get("arguments") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            };
            let id = call.get("id").and_then(Value::as_str).unwrap_or_default();
            tool_calls.push(ToolCallRequest::new(id, name, arguments));
        }
    }

    Ok(ModelReply {
        content,
        tool_calls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parses_tool_calls_and_text() {
        let data = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [
                        {"id": "call_a", "type": "function",
                         "function": {"name": "select_data", "arguments": "{\"table_name\":\"products\",\"limit\":50}"}},
                        {"type": "function",
                         "function": {"name": "list_tables", "arguments": {}}}
                    ]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let reply = parse_chat_completion(&data).unwrap();
        assert_eq!(reply.content, None);
        assert_eq!(reply.tool_calls.len(), 2);
        assert_eq!(reply.tool_calls[0].id, "call_a");
        assert_eq!(reply.tool_calls[1].id, "");
        assert_eq!(reply.tool_calls[1].arguments, "{}");

        let data = json!({"choices": [{"message": {"content": "You have 3 products."}}]});
        assert_eq!(
            parse_chat_completion(&data).unwrap(),
            ModelReply::text("You have 3 products.")
        );
    }

    #[test]
    fn error_bodies_and_missing_choices_are_errors() {
        assert!(matches!(
            parse_chat_completion(&json!({"error": {"message": "bad model"}})),
            Err(ModelError::Api(m)) if m == "bad model"
        ));
        assert!(matches!(
            parse_chat_completion(&json!({"choices": []})),
            Err(ModelError::InvalidResponse(_))
        ));
    }

    #[test]
    fn messages_keep_tool_correlation() {
        let turns = vec![
            Turn::System {
                content: "sys".into(),
            },
            Turn::Assistant {
                content: None,
                tool_calls: vec![ToolCallRequest::new("call_1_0", "list_tables", "{}")],
            },
            Turn::Tool {
                tool_call_id: "call_1_0".into(),
                content: "{\"success\":true}".into(),
            },
        ];
        let messages = turns_to_messages(&turns);
        assert_eq!(messages[0], json!({"role": "system", "content": "sys"}));
        assert_eq!(messages[1]["tool_calls"][0]["id"], "call_1_0");
        assert_eq!(messages[1]["tool_calls"][0]["function"]["name"], "list_tables");
        assert_eq!(messages[2]["tool_call_id"], "call_1_0");
    }

    #[test]
    fn retry_after_header_is_read_in_seconds() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after_ms(&headers), DEFAULT_RETRY_AFTER_SECS * 1000);
        headers.insert(RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(retry_after_ms(&headers), 7_000);
        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap());
        assert_eq!(retry_after_ms(&headers), DEFAULT_RETRY_AFTER_SECS * 1000);
    }

    #[tokio::test]
    async fn huge_retry_after_saturates_instead_of_overflowing() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = sock.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                if n == 0 || buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let body = r#"{"error":{"message":"slow down"}}"#;
            let response = format!(
                "HTTP/1.1 429 Too Many Requests\r\nRetry-After: 18446744073709551615\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            sock.write_all(response.as_bytes()).await.unwrap();
            sock.shutdown().await.ok();
        });

        let model = OpenAiChatModel::new(ModelConfig {
            api_key: "sk-test".into(),
            base_url: format!("http://{addr}"),
            model: "gpt-4o-mini".into(),
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        let turns = vec![Turn::User {
            content: "hi".into(),
        }];
        let err = model.complete(&turns, &[]).await.unwrap_err();
        assert!(matches!(
            err,
            ModelError::RateLimited { retry_after_ms } if retry_after_ms == u64::MAX
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn missing_api_key_is_reported_before_any_request() {
        let model = OpenAiChatModel::new(ModelConfig {
            api_key: String::new(),
            base_url: "http://127.0.0.1:9".into(),
            model: "gpt-4o-mini".into(),
            timeout: Duration::from_secs(1),
        })
        .unwrap();
        let err = model.complete(&[], &[]).await.unwrap_err();
        assert!(matches!(err, ModelError::NotConfigured(_)));
    }
}
