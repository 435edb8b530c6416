//! One chat request end to end: pre-flight the connection, build the
//! conversation, run the loop, and map the outcome to a response.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::CoreConfig;
use crate::conversation::{Conversation, HistoryMessage};
use crate::error::ModelError;
use crate::executor::Executor;
use crate::gateway::{validate_endpoint, BackendConnector, ConnectionParams};
use crate::orchestrator::{LoopOutcome, Orchestrator};
use crate::prompt;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<HistoryMessage>,
    #[serde(default)]
    pub conversation_history: Vec<HistoryMessage>,
    #[serde(default, alias = "supabaseUrl")]
    pub connection_endpoint: Option<String>,
    #[serde(default, alias = "supabaseKey")]
    pub connection_credential: Option<String>,
}

impl ChatRequest {
    pub fn question(
        endpoint: impl Into<String>,
        credential: impl Into<String>,
        question: impl Into<String>,
    ) -> Self {
        Self {
            messages: vec![HistoryMessage {
                role: crate::conversation::Role::User,
                content: question.into(),
            }],
            conversation_history: Vec::new(),
            connection_endpoint: Some(endpoint.into()),
            connection_credential: Some(credential.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingCredentials,
    InvalidUrl,
    InvalidKey,
    RateLimit,
    ServerError,
    InvalidRequest,
}

impl ErrorKind {
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::MissingCredentials | ErrorKind::InvalidUrl | ErrorKind::InvalidRequest => 400,
            ErrorKind::InvalidKey => 401,
            ErrorKind::RateLimit => 429,
            ErrorKind::ServerError => 500,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::MissingCredentials => "missing_credentials",
            ErrorKind::InvalidUrl => "invalid_url",
            ErrorKind::InvalidKey => "invalid_key",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ServerError => "server_error",
            ErrorKind::InvalidRequest => "invalid_request",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponseBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    pub response: String,
}

#[derive(Debug, Clone)]
pub struct ChatReply {
    pub status: u16,
    pub body: ChatResponseBody,
    /// Loop details when the model was reached.
    pub outcome: Option<LoopOutcome>,
}

impl ChatReply {
    fn ok(outcome: LoopOutcome) -> Self {
        Self {
            status: 200,
            body: ChatResponseBody {
                error: None,
                response: outcome.answer.clone(),
            },
            outcome: Some(outcome),
        }
    }

    pub fn error(kind: ErrorKind, response: impl Into<String>) -> Self {
        Self {
            status: kind.http_status(),
            body: ChatResponseBody {
                error: Some(kind),
                response: response.into(),
            },
            outcome: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.body.error.is_none()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.body).unwrap_or_else(|_| {
            r#"{"error":"server_error","response":"failed to encode response"}"#.to_string()
        })
    }
}

pub struct ChatService {
    orchestrator: Orchestrator,
    connector: Arc<dyn BackendConnector>,
    config: CoreConfig,
}

impl ChatService {
    pub fn new(
        orchestrator: Orchestrator,
        connector: Arc<dyn BackendConnector>,
        config: CoreConfig,
    ) -> Self {
        Self {
            orchestrator,
            connector,
            config,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Parse a raw JSON body and handle it.
    pub async fn handle_json(&self, body: &[u8]) -> ChatReply {
        match serde_json::from_slice::<ChatRequest>(body) {
            Ok(req) => self.handle(req).await,
            Err(e) => {
                debug!(error = %e, "rejected malformed chat request");
                ChatReply::error(
                    ErrorKind::InvalidRequest,
                    format!("{}: {e}", prompt::INVALID_REQUEST_MESSAGE),
                )
            }
        }
    }

    pub async fn handle(&self, req: ChatRequest) -> ChatReply {
        let endpoint = non_blank(req.connection_endpoint.as_deref());
        let credential = non_blank(req.connection_credential.as_deref());
        let (Some(endpoint), Some(credential)) = (endpoint, credential) else {
            return ChatReply::error(
                ErrorKind::MissingCredentials,
                prompt::MISSING_CREDENTIALS_MESSAGE,
            );
        };

        let url = match validate_endpoint(endpoint, &self.config.allowed_hosts) {
            Ok(url) => url,
            Err(e) => {
                info!(error = %e, "rejected connection endpoint");
                return ChatReply::error(ErrorKind::InvalidUrl, prompt::INVALID_URL_MESSAGE);
            }
        };
        let host = url.host_str().unwrap_or_default().to_string();

        let params = ConnectionParams::new(endpoint, credential);
        let backend = match self.connector.connect(&params) {
            Ok(backend) => backend,
            Err(e) => {
                error!(host = %host, error = %e, "failed to build backend handle");
                return ChatReply::error(
                    ErrorKind::ServerError,
                    prompt::server_error_message(&e.to_string()),
                );
            }
        };

        let timeout = self.connector.call_timeout();
        match tokio::time::timeout(timeout, backend.probe()).await {
            Ok(Ok(())) => debug!(host = %host, "connection probe succeeded"),
            Ok(Err(e)) if e.is_auth_failure() => {
                info!(host = %host, "credential rejected by the data gateway");
                return ChatReply::error(ErrorKind::InvalidKey, prompt::INVALID_KEY_MESSAGE);
            }
            Ok(Err(e)) => debug!(host = %host, error = %e, "connection probe failed; continuing"),
            Err(_) => warn!(host = %host, "connection probe timed out; continuing"),
        }

        let mut conversation = Conversation::new(prompt::SYSTEM_PROMPT);
        let dropped = conversation.extend_messages(req.conversation_history)
            + conversation.extend_messages(req.messages);
        if dropped > 0 {
            debug!(dropped, "ignored system/tool messages supplied by the caller");
        }

        let executor = Executor::new(backend, timeout, self.config.sql_rpc.clone());
        info!(host = %host, model = %self.orchestrator.model_name(), turns = conversation.len(), "running chat request");
        match self.orchestrator.run(conversation, &executor).await {
            Ok(outcome) => ChatReply::ok(outcome),
            Err(e @ ModelError::RateLimited { .. }) => {
                warn!(error = %e, "model rate limited");
                ChatReply::error(ErrorKind::RateLimit, prompt::RATE_LIMIT_MESSAGE)
            }
            Err(e) => {
                error!(error = %e, "model call failed");
                ChatReply::error(
                    ErrorKind::ServerError,
                    prompt::server_error_message(&e.to_string()),
                )
            }
        }
    }
}

fn non_blank(v: Option<&str>) -> Option<&str> {
    v.map(str::trim).filter(|s| !s.is_empty())
}
