//! Tabletalk: natural-language access to a database behind a REST gateway.
//!
//! A language model is given a fixed catalog of data operations. It calls
//! them, the executor runs them against the caller's gateway, and the results
//! go back to the model until it produces a plain answer.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                          CHAT REQUEST                              │
//! ├────────────────────────────────────────────────────────────────────┤
//! │                                                                    │
//! │  ChatService ──► pre-flight (URL shape, credential probe)          │
//! │       │                                                            │
//! │       ▼                                                            │
//! │  Orchestrator ◄──────────── ChatModel (OpenAI-compatible / mock)   │
//! │       │   tool calls            ▲                                  │
//! │       ▼                         │ tool envelopes                   │
//! │  Registry (validate) ──► Executor ──► DataBackend (REST / memory)  │
//! │                             │                                      │
//! │                             └──► sql (fallback statement parser)   │
//! │                                                                    │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing is cached between requests: every request builds its own backend
//! handle from the connection parameters it carries.

pub mod config;
pub mod conversation;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod model;
pub mod orchestrator;
pub mod prompt;
pub mod registry;
pub mod service;
pub mod sql;

pub use config::{CoreConfig, ModelConfig};
pub use conversation::{Conversation, HistoryMessage, Role, ToolCallRequest, Turn};
pub use envelope::{parse_json_object, Payload, ToolEnvelope};
pub use error::{BackendError, ConfigError, ModelError};
pub use executor::Executor;
pub use gateway::{BackendConnector, ConnectionParams, DataBackend, MemoryConnector, MemoryGateway, RestConnector};
pub use model::{ChatModel, MockModel, ModelReply, OpenAiChatModel, ScriptedModel};
pub use orchestrator::{LoopOptions, LoopOutcome, Orchestrator, StopReason};
pub use registry::{DataOperation, OperationKind};
pub use service::{ChatReply, ChatRequest, ChatService, ErrorKind};
pub use sql::{ParsedStatement, StatementError};
