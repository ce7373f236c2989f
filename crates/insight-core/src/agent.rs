//! Conversation orchestrator
//!
//! Drives one user turn to completion: call the model, run any tools it asks
//! for, feed the results back, and stop once the model answers without tools
//! or the iteration cap is reached. Only the final assistant message is
//! persisted; the tool round-trips of the current turn live in memory.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::compaction;

use crate::llm::{LlmClient, LlmRequest, LlmResponse, ProviderError};
use crate::models::{now_millis, Conversation, Message, ToolCall, ToolResult};
use crate::storage::{Store, StoreError};
use crate::tools::{render_output, ToolContext, ToolRegistry};

/// Assistant content used when the model calls tools without any text
pub const TOOL_PLACEHOLDER: &str = "[Using tools]";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Insight, an AI assistant for operators and engineers \
working on the {PROJECT_NAME} project.

## Your Role
Answer questions about the project and its live system using the tools available to you. \
Only report values you have read through a tool; never guess at live data. \
You are talking with {USER_NAME}.

## Available Tools
{TOOL_NAMES}

## Response Style
- Be concise and specific.
- Quote paths, names and values exactly as the tools return them.
- If a tool fails, say what failed and suggest a next step.";

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("LLM provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub model: String,
    pub max_output_tokens: u32,
    pub max_iterations: usize,
    pub max_history: usize,
    /// Replaces [`DEFAULT_SYSTEM_PROMPT`] when set
    pub system_prompt_template: Option<String>,
    /// Summarize older history once it exceeds `compaction_token_threshold`
    pub auto_compaction: bool,
    pub compaction_token_threshold: u32,
    /// Messages kept verbatim after a compaction (at least 1)
    pub compact_to_recent: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-5".to_string(),
            max_output_tokens: 4096,
            max_iterations: 10,
            max_history: 50,
            system_prompt_template: None,
            auto_compaction: true,
            compaction_token_threshold: 180_000,
            compact_to_recent: 30,
        }
    }
}

/// Substitute `{PROJECT_NAME}`, `{USER_NAME}` and `{TOOL_NAMES}`
pub fn build_system_prompt(template: &str, conversation: &Conversation, tools: &[String]) -> String {
    let project = if conversation.project_name.is_empty() {
        "Unknown"
    } else {
        conversation.project_name.as_str()
    };
    let user = conversation
        .user_name
        .as_deref()
        .filter(|u| !u.is_empty())
        .unwrap_or("Anonymous");
    let tool_list = if tools.is_empty() {
        "No tools available.".to_string()
    } else {
        tools
            .iter()
            .map(|t| format!("- {}", t))
            .collect::<Vec<_>>()
            .join("\n")
    };

    template
        .replace("{PROJECT_NAME}", project)
        .replace("{USER_NAME}", user)
        .replace("{TOOL_NAMES}", &tool_list)
}

/// Next message timestamp for a conversation, strictly after `last`
pub fn next_timestamp(last: Option<i64>) -> i64 {
    let now = now_millis();
    match last {
        Some(last) if now <= last => last + 1,
        _ => now,
    }
}

pub struct Orchestrator {
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn Store>,
    config: AgentConfig,
}

impl Orchestrator {
    pub fn new(llm: Arc<dyn LlmClient>, store: Arc<dyn Store>, config: AgentConfig) -> Self {
        Self { llm, store, config }
    }

    /// Same client and store, with auto-compaction turned off
    pub fn without_compaction(&self) -> Self {
        Self {
            llm: Arc::clone(&self.llm),
            store: Arc::clone(&self.store),
            config: AgentConfig {
                auto_compaction: false,
                ..self.config.clone()
            },
        }
    }

    /// Run the agent loop for a conversation whose latest user message is
    /// already persisted. Returns the persisted final assistant message.
    pub async fn run(
        &self,
        conversation: &Conversation,
        registry: &ToolRegistry,
    ) -> Result<Message, AgentError> {
        let history = self
            .store
            .list_messages(&conversation.id, self.config.max_history as i64)?;
        let last_persisted = history.last().map(|m| m.timestamp);
        let history = compaction::reuse_latest_summary(history);

        let template = self
            .config
            .system_prompt_template
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);
        let system = build_system_prompt(template, conversation, &registry.names());
        let tools = registry.list_definitions();

        let history = if self.config.auto_compaction {
            self.compact(conversation, &system, history).await
        } else {
            history
        };

        // Earlier turns' tool activity is never replayed
        let mut messages: Vec<Message> =
            history.iter().map(Message::without_tool_activity).collect();

        let ctx = ToolContext {
            conversation_id: conversation.id.clone(),
            user_name: conversation.user_name.clone(),
            project_name: conversation.project_name.clone(),
        };

        let mut all_tool_calls: Vec<ToolCall> = Vec::new();
        let mut input_tokens = 0i32;
        let mut output_tokens = 0i32;
        let mut iteration = 0usize;
        let mut clock = last_persisted;

        let response: LlmResponse = loop {
            let request = LlmRequest {
                model: self.config.model.clone(),
                max_tokens: self.config.max_output_tokens,
                system: Some(system.clone()),
                messages: messages.clone(),
                tools: tools.clone(),
            };

            let response = self.llm.send(request).await?;
            input_tokens = input_tokens.saturating_add(response.input_tokens);
            output_tokens = output_tokens.saturating_add(response.output_tokens);

            if response.tool_calls.is_empty() {
                break response;
            }

            let mut results = Vec::with_capacity(response.tool_calls.len());
            for call in &response.tool_calls {
                debug!("Executing tool: {} ({})", call.name, call.id);
                let result = match registry.execute(&call.name, &call.input, &ctx).await {
                    Ok(output) => ToolResult::success(&call.id, render_output(&output)),
                    Err(e) => {
                        warn!("Tool {} failed: {}", call.name, e);
                        ToolResult::error(&call.id, format!("Error: {}", e))
                    }
                };
                results.push(result);
            }

            let content = if response.content.is_empty() {
                TOOL_PLACEHOLDER.to_string()
            } else {
                response.content.clone()
            };
            let ts = next_timestamp(clock);
            messages.push(Message::tool_use(
                &conversation.id,
                content,
                response.tool_calls.clone(),
                ts,
            ));
            let ts = next_timestamp(Some(ts));
            messages.push(Message::tool_results(&conversation.id, results, ts));
            clock = Some(ts);

            all_tool_calls.extend(response.tool_calls.iter().cloned());
            iteration += 1;

            if iteration >= self.config.max_iterations {
                warn!(
                    "Max tool iterations reached ({}), returning partial response",
                    self.config.max_iterations
                );
                break response;
            }
        };

        // Placed after the last persisted message, not after in-memory carriers
        let mut reply = Message::assistant(
            &conversation.id,
            response.content,
            next_timestamp(last_persisted),
        );
        reply.tool_calls = all_tool_calls;
        reply.input_tokens = Some(input_tokens);
        reply.output_tokens = Some(output_tokens);

        self.store.create_message(&reply)?;

        let mut updated = conversation.clone();
        updated.updated_at = reply.timestamp;
        self.store.update_conversation(&updated)?;

        info!(
            "Conversation {} answered after {} tool round(s), {} tool call(s)",
            conversation.id,
            iteration,
            reply.tool_calls.len()
        );
        Ok(reply)
    }

    /// Replace all but the most recent messages with a persisted summary when
    /// the history is over the token threshold. Failures leave it untouched.
    async fn compact(
        &self,
        conversation: &Conversation,
        system: &str,
        history: Vec<Message>,
    ) -> Vec<Message> {
        let keep = self.config.compact_to_recent.max(1);
        let tokens = compaction::history_tokens(system, &history);
        if tokens <= i64::from(self.config.compaction_token_threshold) || history.len() <= keep {
            return history;
        }

        info!(
            "Auto-compaction triggered for conversation {}: ~{} tokens",
            conversation.id, tokens
        );
        let split = history.len() - keep;
        let summary =
            match compaction::summarize(self.llm.as_ref(), &self.config.model, &history[..split])
                .await
            {
                Ok(summary) => summary,
                Err(e) => {
                    error!("Compaction failed, continuing with full history: {}", e);
                    return history;
                }
            };

        let (old, recent) = history.split_at(split);
        let summary = Message::user(
            &conversation.id,
            compaction::summary_content(old.len(), &summary),
            compaction::summary_timestamp(old, recent),
        );
        if let Err(e) = self.store.create_message(&summary) {
            warn!("Failed to persist conversation summary: {}", e);
        }

        let mut compacted = Vec::with_capacity(recent.len() + 1);
        compacted.push(summary);
        compacted.extend_from_slice(recent);
        info!(
            "Compacted {} messages; ~{} tokens remain",
            old.len(),
            compaction::history_tokens(system, &compacted)
        );
        compacted
    }
}
