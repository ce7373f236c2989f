//! Scheduled task management
//!
//! [`TaskService`] holds the create/list/pause/resume/delete operations shared
//! by the HTTP API and the model-facing tools:
//! - create_scheduled_task: persist a recurring prompt and arm it
//! - list_scheduled_tasks: list tasks for the current user and project
//! - manage_scheduled_task: pause, resume or delete a task

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

use crate::cron::{next_run_after, CronError};
use crate::models::{now_millis, ScheduledTask, TaskExecution, TaskStatus, ToolInput};
use crate::scheduler::SchedulerHandle;
use crate::storage::{Store, StoreError};
use crate::tools::{optional_bool, required_str, Tool, ToolContext, ToolError};

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Invalid cron expression: {0}")]
    Cron(#[from] CronError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Task not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Invalid(String),
}

impl From<TaskError> for ToolError {
    fn from(e: TaskError) -> Self {
        match e {
            TaskError::Store(e) => ToolError::Execution(e.to_string()),
            other => ToolError::InvalidInput(other.to_string()),
        }
    }
}

/// Fields supplied when creating a task
#[derive(Debug, Clone)]
pub struct NewTask {
    pub user_name: Option<String>,
    pub project_name: String,
    pub description: String,
    pub prompt: String,
    pub cron_expression: String,
}

/// Human-readable timestamp in the scheduler's timezone
pub fn format_millis(ms: i64, tz: Tz) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|t| t.with_timezone(&tz).format("%Y-%m-%d %H:%M %Z").to_string())
        .unwrap_or_else(|| ms.to_string())
}

// ============================================================================
// Task Service
// ============================================================================

#[derive(Clone)]
pub struct TaskService {
    store: Arc<dyn Store>,
    scheduler: SchedulerHandle,
    timezone: Tz,
}

impl TaskService {
    pub fn new(store: Arc<dyn Store>, scheduler: SchedulerHandle, timezone: Tz) -> Self {
        Self {
            store,
            scheduler,
            timezone,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn create(&self, new: NewTask) -> Result<ScheduledTask, TaskError> {
        if new.project_name.trim().is_empty() {
            return Err(TaskError::Invalid("projectName is required".into()));
        }
        if new.description.trim().is_empty() || new.prompt.trim().is_empty() {
            return Err(TaskError::Invalid(
                "description and prompt must not be empty".into(),
            ));
        }

        let now = now_millis();
        let cron_expression = new.cron_expression.trim().to_string();
        let next_run_at = next_run_after(&cron_expression, now, self.timezone)?;

        let task = ScheduledTask::new(
            new.user_name,
            new.project_name,
            new.description,
            new.prompt,
            cron_expression,
            next_run_at,
            now,
        );
        self.store.create_task(&task)?;
        info!("Scheduled task created: {} ({})", task.description, task.id);

        self.scheduler.schedule(task.clone());
        Ok(task)
    }

    /// Tasks for a user (optionally narrowed to a project) or for a whole project
    pub fn list(
        &self,
        user_name: Option<&str>,
        project_name: Option<&str>,
        enabled_only: bool,
    ) -> Result<Vec<ScheduledTask>, TaskError> {
        let mut tasks = match (user_name, project_name) {
            (Some(user), project) => {
                let mut tasks = self.store.list_tasks_by_user(user)?;
                if let Some(project) = project {
                    tasks.retain(|t| t.project_name == project);
                }
                tasks
            }
            (None, Some(project)) => self.store.list_tasks_by_project(project)?,
            (None, None) => {
                return Err(TaskError::Invalid(
                    "userName or projectName is required".into(),
                ))
            }
        };

        if enabled_only {
            tasks.retain(|t| t.enabled);
        }
        Ok(tasks)
    }

    pub fn find(&self, id: &str) -> Result<ScheduledTask, TaskError> {
        self.store
            .find_task(id)?
            .ok_or_else(|| TaskError::NotFound(id.to_string()))
    }

    pub fn pause(&self, id: &str) -> Result<ScheduledTask, TaskError> {
        self.find(id)?;
        self.store.set_task_enabled(id, false)?;
        self.store.update_task_status(id, TaskStatus::Paused)?;
        self.scheduler.unschedule(id);
        info!("Task paused: {}", id);
        self.find(id)
    }

    pub fn resume(&self, id: &str) -> Result<ScheduledTask, TaskError> {
        let task = self.find(id)?;
        let next_run_at = next_run_after(&task.cron_expression, now_millis(), self.timezone)?;

        self.store.update_next_run(id, next_run_at, None)?;
        self.store.set_task_enabled(id, true)?;
        self.store.update_task_status(id, TaskStatus::Pending)?;

        let task = self.find(id)?;
        self.scheduler.schedule(task.clone());
        info!("Task resumed: {}", id);
        Ok(task)
    }

    pub fn delete(&self, id: &str) -> Result<(), TaskError> {
        self.scheduler.unschedule(id);
        if !self.store.delete_task(id)? {
            return Err(TaskError::NotFound(id.to_string()));
        }
        info!("Task deleted: {}", id);
        Ok(())
    }

    pub fn executions(&self, id: &str, limit: i64) -> Result<Vec<TaskExecution>, TaskError> {
        self.find(id)?;
        Ok(self.store.list_executions(id, limit)?)
    }
}

fn task_summary(task: &ScheduledTask, tz: Tz) -> Value {
    json!({
        "id": task.id,
        "taskDescription": task.description,
        "prompt": task.prompt,
        "cronExpression": task.cron_expression,
        "nextRunAt": task.next_run_at,
        "nextRunAtFormatted": format_millis(task.next_run_at, tz),
        "lastRunAt": task.last_run_at,
        "lastRunAtFormatted": task
            .last_run_at
            .map(|t| format_millis(t, tz))
            .unwrap_or_else(|| "Never".to_string()),
        "status": task.status.as_str(),
        "enabled": task.enabled,
        "userName": task.user_name,
        "projectName": task.project_name,
        "createdAt": task.created_at,
    })
}

// ============================================================================
// Create Scheduled Task Tool
// ============================================================================

pub struct CreateScheduledTaskTool {
    tasks: TaskService,
}

impl CreateScheduledTaskTool {
    pub fn new(tasks: TaskService) -> Self {
        Self { tasks }
    }
}

#[async_trait]
impl Tool for CreateScheduledTaskTool {
    fn name(&self) -> &str {
        "create_scheduled_task"
    }

    fn description(&self) -> &str {
        "Create a scheduled task that runs an AI prompt on a recurring schedule. \
         Use this when the user asks to automate a query or set up a recurring report. \
         Each run starts a new, isolated conversation."
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "taskDescription": {
                    "type": "string",
                    "description": "Human-readable description of what the task does"
                },
                "prompt": {
                    "type": "string",
                    "description": "The prompt to run on each execution"
                },
                "cronExpression": {
                    "type": "string",
                    "description": "Cron expression (5 fields: minute hour day month weekday). Examples: '*/5 * * * *' (every 5 min), '0 6 * * *' (daily 6 AM), '0 9 * * 1-5' (weekdays 9 AM)"
                }
            },
            "required": ["taskDescription", "prompt", "cronExpression"]
        })
    }

    async fn execute(&self, input: &ToolInput, ctx: &ToolContext) -> Result<Value, ToolError> {
        let task = self.tasks.create(NewTask {
            user_name: ctx.user_name.clone(),
            project_name: ctx.project_name.clone(),
            description: required_str(input, "taskDescription")?.to_string(),
            prompt: required_str(input, "prompt")?.to_string(),
            cron_expression: required_str(input, "cronExpression")?.to_string(),
        })?;

        let next = format_millis(task.next_run_at, self.tasks.timezone());
        Ok(json!({
            "success": true,
            "taskId": task.id,
            "cronExpression": task.cron_expression,
            "nextRunAt": task.next_run_at,
            "nextRunAtFormatted": next,
            "message": format!("Scheduled task created. Next run: {}", next),
        }))
    }
}

// ============================================================================
// List Scheduled Tasks Tool
// ============================================================================

pub struct ListScheduledTasksTool {
    tasks: TaskService,
}

impl ListScheduledTasksTool {
    pub fn new(tasks: TaskService) -> Self {
        Self { tasks }
    }
}

#[async_trait]
impl Tool for ListScheduledTasksTool {
    fn name(&self) -> &str {
        "list_scheduled_tasks"
    }

    fn description(&self) -> &str {
        "List scheduled tasks for the current user and project. \
         Use this to show existing tasks or check whether a task already exists. \
         Returns each task's ID, description, schedule, next run time and status."
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "enabledOnly": {
                    "type": "boolean",
                    "description": "Only return tasks that are currently enabled (default false)"
                }
            },
            "required": []
        })
    }

    async fn execute(&self, input: &ToolInput, ctx: &ToolContext) -> Result<Value, ToolError> {
        let enabled_only = optional_bool(input, "enabledOnly").unwrap_or(false);
        let tasks = self.tasks.list(
            ctx.user_name.as_deref(),
            Some(ctx.project_name.as_str()),
            enabled_only,
        )?;
        debug!("Found {} scheduled tasks", tasks.len());

        let tz = self.tasks.timezone();
        let active = tasks.iter().filter(|t| t.enabled).count();
        Ok(json!({
            "tasks": tasks.iter().map(|t| task_summary(t, tz)).collect::<Vec<_>>(),
            "totalCount": tasks.len(),
            "activeCount": active,
            "pausedCount": tasks.len() - active,
        }))
    }
}

// ============================================================================
// Manage Scheduled Task Tool
// ============================================================================

pub struct ManageScheduledTaskTool {
    tasks: TaskService,
}

impl ManageScheduledTaskTool {
    pub fn new(tasks: TaskService) -> Self {
        Self { tasks }
    }
}

#[async_trait]
impl Tool for ManageScheduledTaskTool {
    fn name(&self) -> &str {
        "manage_scheduled_task"
    }

    fn description(&self) -> &str {
        "Pause, resume or delete a scheduled task. \
         'pause' stops future runs, 'resume' restarts them and 'delete' removes the task permanently. \
         Get the task ID from list_scheduled_tasks."
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "taskId": {
                    "type": "string",
                    "description": "ID of the scheduled task"
                },
                "action": {
                    "type": "string",
                    "enum": ["pause", "resume", "delete"],
                    "description": "Action to perform on the task"
                }
            },
            "required": ["taskId", "action"]
        })
    }

    async fn execute(&self, input: &ToolInput, ctx: &ToolContext) -> Result<Value, ToolError> {
        let task_id = required_str(input, "taskId")?;
        let action = required_str(input, "action")?.to_lowercase();

        // Tasks of other projects are invisible here
        let task = self.tasks.find(task_id)?;
        if task.project_name != ctx.project_name {
            return Err(TaskError::NotFound(task_id.to_string()).into());
        }

        let message = match action.as_str() {
            "pause" => {
                self.tasks.pause(task_id)?;
                "Task paused. It will no longer run on schedule."
            }
            "resume" => {
                self.tasks.resume(task_id)?;
                "Task resumed. It will run on its schedule."
            }
            "delete" => {
                self.tasks.delete(task_id)?;
                "Task deleted permanently."
            }
            other => {
                return Err(ToolError::InvalidInput(format!(
                    "Invalid action '{}'. Must be 'pause', 'resume', or 'delete'",
                    other
                )))
            }
        };

        Ok(json!({
            "success": true,
            "taskId": task_id,
            "action": action,
            "message": message,
        }))
    }
}
