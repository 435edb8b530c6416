//! Request-scoped conversation state.
//!
//! A conversation always starts with exactly one system turn, which is never
//! touched again. Tool turns can only be appended together with the assistant
//! turn that requested them, so every tool turn answers exactly one pending
//! invocation.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation as emitted by the model: the operation name plus the raw
/// JSON argument text. Validation happens in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Turn {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: Option<String>,
        tool_calls: Vec<ToolCallRequest>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

impl Turn {
    pub fn role(&self) -> Role {
        match self {
            Turn::System { .. } => Role::System,
            Turn::User { .. } => Role::User,
            Turn::Assistant { .. } => Role::Assistant,
            Turn::Tool { .. } => Role::Tool,
        }
    }

    pub fn content(&self) -> Option<&str> {
        match self {
            Turn::System { content } | Turn::User { content } | Turn::Tool { content, .. } => {
                Some(content)
            }
            Turn::Assistant { content, .. } => content.as_deref(),
        }
    }
}

/// A plain `{role, content}` message as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            turns: vec![Turn::System {
                content: system_prompt.into(),
            }],
        }
    }

    pub fn system_prompt(&self) -> &str {
        match self.turns.first() {
            Some(Turn::System { content }) => content,
            _ => "",
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.turns.push(Turn::User {
            content: content.into(),
        });
    }

    pub fn push_assistant_text(&mut self, content: impl Into<String>) {
        self.turns.push(Turn::Assistant {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        });
    }

    /// Append caller-supplied messages. `system` and `tool` messages are
    /// dropped: the caller cannot replace the system prompt, and a tool turn
    /// without its invocation would break correlation. Returns how many were
    /// dropped.
    pub fn extend_messages<I>(&mut self, messages: I) -> usize
    where
        I: IntoIterator<Item = HistoryMessage>,
    {
        let mut dropped = 0;
        for m in messages {
            match m.role {
                Role::User => self.push_user(m.content),
                Role::Assistant => self.push_assistant_text(m.content),
                Role::System | Role::Tool => dropped += 1,
            }
        }
        dropped
    }

    /// Record one orchestration round: the assistant turn carrying the tool
    /// invocations, followed by one tool turn per invocation in the same order.
    pub fn record_round(&mut self, content: Option<String>, outcomes: Vec<(ToolCallRequest, String)>) {
        let (calls, results): (Vec<_>, Vec<_>) = outcomes.into_iter().unzip();
        let ids: Vec<String> = calls.iter().map(|c| c.id.clone()).collect();
        self.turns.push(Turn::Assistant {
            content,
            tool_calls: calls,
        });
        for (tool_call_id, content) in ids.into_iter().zip(results) {
            self.turns.push(Turn::Tool {
                tool_call_id,
                content,
            });
        }
    }
}
