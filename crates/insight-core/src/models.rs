//! Domain types shared by the agent loop, the scheduler and the store
//!
//! All identifiers are UUID strings and all timestamps are epoch milliseconds.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Structured tool input, as issued by the model
pub type ToolInput = serde_json::Map<String, serde_json::Value>;

/// Current time in epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Fresh random identifier
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// ============================================================================
// Conversations and messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            _ => Err(anyhow::anyhow!(
                "Invalid role: {}. Must be 'user' or 'assistant'",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub user_name: Option<String>,
    pub project_name: String,
    pub title: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Conversation {
    pub fn new(
        user_name: Option<String>,
        project_name: impl Into<String>,
        title: impl Into<String>,
        now: i64,
    ) -> Self {
        Self {
            id: new_id(),
            user_name,
            project_name: project_name.into(),
            title: title.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A model-issued request to invoke a named tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: ToolInput,
}

/// The answer to a [`ToolCall`], paired by id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub tool_call_id: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
    pub input_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
    pub timestamp: i64,
}

impl Message {
    fn new(conversation_id: &str, role: Role, content: Option<String>, timestamp: i64) -> Self {
        Self {
            id: new_id(),
            conversation_id: conversation_id.to_string(),
            role,
            content,
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            input_tokens: None,
            output_tokens: None,
            timestamp,
        }
    }

    pub fn user(conversation_id: &str, content: impl Into<String>, timestamp: i64) -> Self {
        Self::new(conversation_id, Role::User, Some(content.into()), timestamp)
    }

    pub fn assistant(conversation_id: &str, content: impl Into<String>, timestamp: i64) -> Self {
        Self::new(
            conversation_id,
            Role::Assistant,
            Some(content.into()),
            timestamp,
        )
    }

    /// Assistant turn carrying the tool calls of one model response
    pub fn tool_use(
        conversation_id: &str,
        content: impl Into<String>,
        tool_calls: Vec<ToolCall>,
        timestamp: i64,
    ) -> Self {
        let mut msg = Self::assistant(conversation_id, content, timestamp);
        msg.tool_calls = tool_calls;
        msg
    }

    /// User-role carrier for a batch of tool results
    pub fn tool_results(conversation_id: &str, results: Vec<ToolResult>, timestamp: i64) -> Self {
        let mut msg = Self::new(conversation_id, Role::User, None, timestamp);
        msg.tool_results = results;
        msg
    }

    /// Copy of this message with tool activity removed, for replaying history
    pub fn without_tool_activity(&self) -> Self {
        Self {
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            ..self.clone()
        }
    }

    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

// ============================================================================
// Scheduled tasks
// ============================================================================

/// Status label stored on a scheduled task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Scheduled,
    Running,
    Paused,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Scheduled => "SCHEDULED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Paused => "PAUSED",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "SCHEDULED" => Ok(TaskStatus::Scheduled),
            "RUNNING" => Ok(TaskStatus::Running),
            "PAUSED" => Ok(TaskStatus::Paused),
            _ => Err(anyhow::anyhow!("Invalid task status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub id: String,
    pub user_name: Option<String>,
    pub project_name: String,
    pub description: String,
    pub prompt: String,
    pub cron_expression: String,
    pub last_run_at: Option<i64>,
    pub next_run_at: i64,
    pub status: TaskStatus,
    pub enabled: bool,
    pub created_at: i64,
}

impl ScheduledTask {
    pub fn new(
        user_name: Option<String>,
        project_name: impl Into<String>,
        description: impl Into<String>,
        prompt: impl Into<String>,
        cron_expression: impl Into<String>,
        next_run_at: i64,
        now: i64,
    ) -> Self {
        Self {
            id: new_id(),
            user_name,
            project_name: project_name.into(),
            description: description.into(),
            prompt: prompt.into(),
            cron_expression: cron_expression.into(),
            last_run_at: None,
            next_run_at,
            status: TaskStatus::Pending,
            enabled: true,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SUCCESS" => Ok(ExecutionStatus::Success),
            "FAILED" => Ok(ExecutionStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid execution status: {}", s)),
        }
    }
}

/// One firing of a scheduled task. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecution {
    pub id: String,
    pub task_id: String,
    pub executed_at: i64,
    pub conversation_id: Option<String>,
    pub status: ExecutionStatus,
    pub error_message: Option<String>,
    pub duration_ms: i64,
}
