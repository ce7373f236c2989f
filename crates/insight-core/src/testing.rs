//! Test doubles shared by the unit tests

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::llm::{LlmClient, LlmRequest, LlmResponse, ProviderError};
use crate::models::{
    Conversation, Message, ScheduledTask, TaskExecution, TaskStatus, ToolCall, ToolInput,
};
use crate::storage::{MemoryStore, Store, StoreError, StoreResult};
use crate::tools::{Tool, ToolContext, ToolError};

/// LLM client that replays canned responses and records every request.
/// Once the script runs out every call fails with a 500.
#[derive(Default)]
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<LlmResponse>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<LlmResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn send(&self, request: LlmRequest) -> Result<LlmResponse, ProviderError> {
        self.requests.lock().unwrap().push(request);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::Status {
                status: 500,
                body: "script exhausted".to_string(),
            })
    }
}

/// LLM client that takes `delay` before every reply
pub struct SlowLlm {
    delay: Duration,
    reply: String,
}

impl SlowLlm {
    pub fn new(delay: Duration, reply: &str) -> Self {
        Self {
            delay,
            reply: reply.to_string(),
        }
    }
}

#[async_trait]
impl LlmClient for SlowLlm {
    async fn send(&self, _request: LlmRequest) -> Result<LlmResponse, ProviderError> {
        tokio::time::sleep(self.delay).await;
        Ok(text_reply(&self.reply))
    }
}

pub fn text_reply(text: &str) -> LlmResponse {
    LlmResponse {
        content: text.to_string(),
        tool_calls: Vec::new(),
        input_tokens: 10,
        output_tokens: 5,
        stop_reason: Some("end_turn".to_string()),
    }
}

pub fn tool_reply(text: &str, calls: Vec<ToolCall>) -> LlmResponse {
    LlmResponse {
        content: text.to_string(),
        tool_calls: calls,
        input_tokens: 10,
        output_tokens: 5,
        stop_reason: Some("tool_use".to_string()),
    }
}

pub fn call(id: &str, name: &str) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        input: ToolInput::new(),
    }
}

/// Tool that always returns the same output
pub struct StaticTool {
    name: String,
    output: String,
}

impl StaticTool {
    pub fn new(name: &str, output: &str) -> Self {
        Self {
            name: name.to_string(),
            output: output.to_string(),
        }
    }
}

#[async_trait]
impl Tool for StaticTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Returns a fixed value"
    }

    fn parameter_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _input: &ToolInput, _ctx: &ToolContext) -> Result<Value, ToolError> {
        Ok(Value::String(self.output.clone()))
    }
}

/// Tool that always fails
pub struct FailingTool {
    name: String,
    message: String,
}

impl FailingTool {
    pub fn new(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    fn parameter_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _input: &ToolInput, _ctx: &ToolContext) -> Result<Value, ToolError> {
        Err(ToolError::Execution(self.message.clone()))
    }
}

/// [`MemoryStore`] with switchable task-table failures
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    /// Fail the next `update_next_run` that records a completed run
    fail_next_run_update: AtomicBool,
    /// `find_task` calls so far, and which one (1-based) should fail
    find_calls: AtomicUsize,
    fail_find_on: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_run_update_once(&self) {
        self.fail_next_run_update.store(true, Ordering::SeqCst);
    }

    /// Fail the `n`th `find_task` call counted from now
    pub fn fail_find_task_on_call(&self, n: usize) {
        self.find_calls.store(0, Ordering::SeqCst);
        self.fail_find_on.store(n, Ordering::SeqCst);
    }

    fn injected(what: &str) -> StoreError {
        StoreError::Lock(format!("injected {} failure", what))
    }
}

impl Store for FlakyStore {
    fn create_conversation(&self, conversation: &Conversation) -> StoreResult<()> {
        self.inner.create_conversation(conversation)
    }

    fn find_conversation(&self, id: &str) -> StoreResult<Option<Conversation>> {
        self.inner.find_conversation(id)
    }

    fn list_conversations_by_user(
        &self,
        user_name: &str,
        limit: i64,
    ) -> StoreResult<Vec<Conversation>> {
        self.inner.list_conversations_by_user(user_name, limit)
    }

    fn list_conversations_by_project(
        &self,
        project_name: &str,
        limit: i64,
    ) -> StoreResult<Vec<Conversation>> {
        self.inner.list_conversations_by_project(project_name, limit)
    }

    fn update_conversation(&self, conversation: &Conversation) -> StoreResult<()> {
        self.inner.update_conversation(conversation)
    }

    fn delete_conversation(&self, id: &str) -> StoreResult<bool> {
        self.inner.delete_conversation(id)
    }

    fn create_message(&self, message: &Message) -> StoreResult<()> {
        self.inner.create_message(message)
    }

    fn list_messages(&self, conversation_id: &str, limit: i64) -> StoreResult<Vec<Message>> {
        self.inner.list_messages(conversation_id, limit)
    }

    fn count_messages(&self, conversation_id: &str) -> StoreResult<i64> {
        self.inner.count_messages(conversation_id)
    }

    fn create_task(&self, task: &ScheduledTask) -> StoreResult<()> {
        self.inner.create_task(task)
    }

    fn find_task(&self, id: &str) -> StoreResult<Option<ScheduledTask>> {
        let call = self.find_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_find_on.load(Ordering::SeqCst) {
            return Err(Self::injected("find_task"));
        }
        self.inner.find_task(id)
    }

    fn list_enabled_tasks(&self) -> StoreResult<Vec<ScheduledTask>> {
        self.inner.list_enabled_tasks()
    }

    fn list_tasks_by_user(&self, user_name: &str) -> StoreResult<Vec<ScheduledTask>> {
        self.inner.list_tasks_by_user(user_name)
    }

    fn list_tasks_by_project(&self, project_name: &str) -> StoreResult<Vec<ScheduledTask>> {
        self.inner.list_tasks_by_project(project_name)
    }

    fn update_next_run(
        &self,
        id: &str,
        next_run_at: i64,
        last_run_at: Option<i64>,
    ) -> StoreResult<()> {
        if last_run_at.is_some() && self.fail_next_run_update.swap(false, Ordering::SeqCst) {
            return Err(Self::injected("update_next_run"));
        }
        self.inner.update_next_run(id, next_run_at, last_run_at)
    }

    fn update_task_status(&self, id: &str, status: TaskStatus) -> StoreResult<()> {
        self.inner.update_task_status(id, status)
    }

    fn set_task_enabled(&self, id: &str, enabled: bool) -> StoreResult<()> {
        self.inner.set_task_enabled(id, enabled)
    }

    fn delete_task(&self, id: &str) -> StoreResult<bool> {
        self.inner.delete_task(id)
    }

    fn record_execution(&self, execution: &TaskExecution) -> StoreResult<()> {
        self.inner.record_execution(execution)
    }

    fn list_executions(&self, task_id: &str, limit: i64) -> StoreResult<Vec<TaskExecution>> {
        self.inner.list_executions(task_id, limit)
    }
}
