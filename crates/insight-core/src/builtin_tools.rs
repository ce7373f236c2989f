//! Read-only tools registered for every conversation

use async_trait::async_trait;
use insight_tools::{project_files_schema, FileAction, FilesystemError, ProjectFiles, ProjectFilesArgs};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use crate::models::ToolInput;
use crate::scheduler_tools::{
    CreateScheduledTaskTool, ListScheduledTasksTool, ManageScheduledTaskTool, TaskService,
};
use crate::storage::Store;
use crate::tools::{optional_u64, required_str, Tool, ToolContext, ToolError, ToolRegistry};

const DEFAULT_LOOKBACK: u64 = 20;
const MAX_LOOKBACK: u64 = 1000;

/// Everything the built-in tools need
#[derive(Clone)]
pub struct ToolDeps {
    pub store: Arc<dyn Store>,
    pub projects: ProjectFiles,
    pub tasks: TaskService,
}

/// Fresh registry with every built-in tool
pub fn default_registry(deps: &ToolDeps) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(QueryConversationMemoryTool::new(deps.store.clone())));
    registry.register(Arc::new(ProjectFilesTool::new(deps.projects.clone())));
    registry.register(Arc::new(CreateScheduledTaskTool::new(deps.tasks.clone())));
    registry.register(Arc::new(ListScheduledTasksTool::new(deps.tasks.clone())));
    registry.register(Arc::new(ManageScheduledTaskTool::new(deps.tasks.clone())));
    registry
}

// ============================================================================
// Conversation memory
// ============================================================================

pub struct QueryConversationMemoryTool {
    store: Arc<dyn Store>,
}

impl QueryConversationMemoryTool {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for QueryConversationMemoryTool {
    fn name(&self) -> &str {
        "query_conversation_memory"
    }

    fn description(&self) -> &str {
        "Search this conversation's history to recall what was said earlier. \
         Use it to find previous requests or information discussed in older messages."
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Text to look for in earlier messages"
                },
                "lookback": {
                    "type": "integer",
                    "description": "Number of recent messages to search (default 20, at most 1000)",
                    "default": DEFAULT_LOOKBACK
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, input: &ToolInput, ctx: &ToolContext) -> Result<Value, ToolError> {
        if ctx.conversation_id.is_empty() {
            return Err(ToolError::Execution(
                "No conversation available for memory query".into(),
            ));
        }

        let query = required_str(input, "query")?.to_lowercase();
        let lookback = optional_u64(input, "lookback")
            .unwrap_or(DEFAULT_LOOKBACK)
            .min(MAX_LOOKBACK);

        let messages = self
            .store
            .list_messages(&ctx.conversation_id, lookback as i64)
            .map_err(|e| ToolError::Execution(e.to_string()))?;

        let results: Vec<Value> = messages
            .iter()
            .filter(|m| m.text().to_lowercase().contains(&query))
            .map(|m| {
                json!({
                    "role": m.role.as_str(),
                    "content": m.text(),
                    "timestamp": m.timestamp,
                })
            })
            .collect();
        let matched = results.len();
        debug!("Memory query '{}' matched {} messages", query, matched);

        let mut out = json!({
            "query": query,
            "matches": matched,
            "searchedMessages": messages.len(),
            "results": results,
        });
        if matched == 0 {
            out["message"] = json!("No matches found in recent conversation history");
        }
        Ok(out)
    }
}

// ============================================================================
// Project files
// ============================================================================

pub struct ProjectFilesTool {
    files: ProjectFiles,
}

impl ProjectFilesTool {
    pub fn new(files: ProjectFiles) -> Self {
        Self { files }
    }
}

fn filesystem_error(e: FilesystemError) -> ToolError {
    match e {
        FilesystemError::Io(e) => ToolError::Execution(e.to_string()),
        other => ToolError::InvalidInput(other.to_string()),
    }
}

#[async_trait]
impl Tool for ProjectFilesTool {
    fn name(&self) -> &str {
        "project_files"
    }

    fn description(&self) -> &str {
        "Browse the current project's files (read-only). \
         'list' shows a directory, 'read' returns a file's contents (large files are truncated), \
         'search' finds files whose names contain the query."
    }

    fn parameter_schema(&self) -> Value {
        project_files_schema()
    }

    async fn execute(&self, input: &ToolInput, ctx: &ToolContext) -> Result<Value, ToolError> {
        let args: ProjectFilesArgs = serde_json::from_value(Value::Object(input.clone()))
            .map_err(|e| ToolError::InvalidInput(e.to_string()))?;
        let project = ctx.project_name.as_str();

        match args.action {
            FileAction::List => {
                let entries = self
                    .files
                    .list(project, args.path.as_deref())
                    .await
                    .map_err(filesystem_error)?;
                Ok(json!({
                    "path": args.path.unwrap_or_default(),
                    "entries": entries,
                }))
            }
            FileAction::Read => {
                let path = args
                    .path
                    .ok_or_else(|| filesystem_error(FilesystemError::MissingArgument("path")))?;
                let file = self
                    .files
                    .read(project, &path)
                    .await
                    .map_err(filesystem_error)?;
                serde_json::to_value(file).map_err(|e| ToolError::Execution(e.to_string()))
            }
            FileAction::Search => {
                let query = args
                    .query
                    .ok_or_else(|| filesystem_error(FilesystemError::MissingArgument("query")))?;
                let matches = self
                    .files
                    .search(project, &query)
                    .await
                    .map_err(filesystem_error)?;
                Ok(json!({
                    "query": query,
                    "count": matches.len(),
                    "matches": matches,
                }))
            }
        }
    }
}
