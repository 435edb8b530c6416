//! The chat-completion boundary.

use async_trait::async_trait;
use serde_json::Value;

use crate::conversation::{ToolCallRequest, Turn};
use crate::error::ModelError;

pub mod mock;
pub mod openai;

pub use mock::{MockModel, ScriptedModel};
pub use openai::OpenAiChatModel;

/// One model turn: optional text plus zero or more tool invocations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelReply {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ModelReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        Self {
            content: None,
            tool_calls: calls,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Content with surrounding whitespace removed; `None` when blank.
    pub fn non_empty_content(&self) -> Option<&str> {
        self.content
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// A pure function from conversation + tool catalog to the next assistant turn.
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, turns: &[Turn], tools: &[Value]) -> Result<ModelReply, ModelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_content_is_not_content() {
        assert_eq!(ModelReply::text("  \n").non_empty_content(), None);
        assert_eq!(ModelReply::text(" hi ").non_empty_content(), Some("hi"));
        assert_eq!(ModelReply::default().non_empty_content(), None);
    }
}
