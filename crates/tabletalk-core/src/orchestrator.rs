//! The tool-calling loop.
//!
//! `AWAIT_MODEL → (tool calls) DISPATCH → AWAIT_MODEL → … → (no tool calls) DONE`.
//! Each dispatch round runs the whole batch concurrently, appends one tool turn
//! per invocation in invocation order, and asks the model again. The number of
//! dispatch rounds is capped; at the cap the loop returns the best text it has.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{CoreConfig, DEFAULT_MAX_TOOL_ROUNDS, DEFAULT_MODEL_TIMEOUT_SECS};
use crate::conversation::{Conversation, ToolCallRequest};
use crate::envelope::ToolEnvelope;
use crate::error::ModelError;
use crate::executor::Executor;
use crate::model::{ChatModel, ModelReply};
use crate::prompt::{FALLBACK_ACK, ROUND_LIMIT_NOTE};
use crate::registry;

#[derive(Debug, Clone, Copy)]
pub struct LoopOptions {
    pub max_tool_rounds: usize,
    pub model_timeout: Duration,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            model_timeout: Duration::from_secs(DEFAULT_MODEL_TIMEOUT_SECS),
        }
    }
}

impl LoopOptions {
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            max_tool_rounds: config.max_tool_rounds.max(1),
            model_timeout: config.model_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model answered without requesting tools.
    Finished,
    /// The dispatch round cap was reached.
    RoundLimit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopOutcome {
    pub answer: String,
    pub rounds: usize,
    pub tool_calls: usize,
    pub stop: StopReason,
}

pub struct Orchestrator {
    model: Arc<dyn ChatModel>,
    options: LoopOptions,
    tools: Vec<Value>,
}

impl Orchestrator {
    pub fn new(model: Arc<dyn ChatModel>, options: LoopOptions) -> Self {
        Self {
            model,
            options,
            tools: registry::tools_json(),
        }
    }

    pub fn options(&self) -> LoopOptions {
        self.options
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Drive `conversation` to a final answer. Model failures abort the run;
    /// tool failures are handed back to the model as envelopes.
    pub async fn run(
        &self,
        mut conversation: Conversation,
        executor: &Executor,
    ) -> Result<LoopOutcome, ModelError> {
        let mut rounds = 0usize;
        let mut tool_calls = 0usize;
        let mut last_text: Option<String> = None;

        let mut reply = self.ask(&conversation).await?;
        loop {
            if let Some(text) = reply.non_empty_content() {
                last_text = Some(text.to_string());
            }

            if !reply.has_tool_calls() {
                let answer = reply
                    .content
                    .filter(|c| !c.trim().is_empty())
                    .unwrap_or_else(|| FALLBACK_ACK.to_string());
                info!(rounds, tool_calls, "model finished");
                return Ok(LoopOutcome {
                    answer,
                    rounds,
                    tool_calls,
                    stop: StopReason::Finished,
                });
            }

            if rounds >= self.options.max_tool_rounds {
                warn!(
                    rounds,
                    pending = reply.tool_calls.len(),
                    "tool round limit reached; returning partial answer"
                );
                let answer = last_text
                    .unwrap_or_else(|| format!("{FALLBACK_ACK}\n\n{ROUND_LIMIT_NOTE}"));
                return Ok(LoopOutcome {
                    answer,
                    rounds,
                    tool_calls,
                    stop: StopReason::RoundLimit,
                });
            }

            rounds += 1;
            let ModelReply {
                content,
                tool_calls: requested,
            } = reply;
            let calls = assign_call_ids(requested, rounds);
            tool_calls += calls.len();
            info!(round = rounds, calls = calls.len(), "dispatching tool calls");

            let envelopes = executor.dispatch_all(&calls).await;
            for (call, env) in calls.iter().zip(&envelopes) {
                debug!(round = rounds, id = %call.id, tool = %call.name, success = env.success, "tool result");
            }
            let outcomes = calls
                .into_iter()
                .zip(envelopes.iter().map(ToolEnvelope::to_content))
                .collect();
            conversation.record_round(content, outcomes);

            reply = self.ask(&conversation).await?;
        }
    }

    async fn ask(&self, conversation: &Conversation) -> Result<ModelReply, ModelError> {
        let timeout = self.options.model_timeout;
        tokio::time::timeout(timeout, self.model.complete(conversation.turns(), &self.tools))
            .await
            .map_err(|_| ModelError::Timeout(timeout))?
    }
}

/// Give every invocation a unique correlation id. Missing or repeated ids
/// become `call_<round>_<index>`, suffixed with `_<n>` if the model already
/// used that name.
pub fn assign_call_ids(calls: Vec<ToolCallRequest>, round: usize) -> Vec<ToolCallRequest> {
    let mut seen: HashSet<String> = calls
        .iter()
        .map(|c| c.id.clone())
        .filter(|id| !id.trim().is_empty())
        .collect();
    let mut kept = HashSet::new();
    calls
        .into_iter()
        .enumerate()
        .map(|(index, mut call)| {
            if call.id.trim().is_empty() || !kept.insert(call.id.clone()) {
                let base = format!("call_{round}_{index}");
                let mut candidate = base.clone();
                let mut n = 1;
                while !seen.insert(candidate.clone()) {
                    candidate = format!("{base}_{n}");
                    n += 1;
                }
                kept.insert(candidate.clone());
                call.id = candidate;
            }
            call
        })
        .collect()
}
