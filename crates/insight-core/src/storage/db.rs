//! PostgreSQL store using Diesel

use anyhow::Context;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

use super::{Store, StoreError, StoreResult};
use crate::models::{
    Conversation, ExecutionStatus, Message, Role, ScheduledTask, TaskExecution, TaskStatus,
    ToolCall, ToolResult,
};
use crate::schema::{conversations, messages, scheduled_tasks, task_executions};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Apply any pending embedded migrations
pub fn run_migrations(database_url: &str) -> anyhow::Result<()> {
    let mut conn =
        PgConnection::establish(database_url).context("Failed to connect to database")?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("Migration failed: {}", e))?;
    info!("Database migrations applied");
    Ok(())
}

// ============================================================================
// Rows
// ============================================================================

#[derive(Queryable, Selectable, Insertable, Debug)]
#[diesel(table_name = conversations)]
struct ConversationRow {
    id: String,
    user_name: Option<String>,
    project_name: String,
    title: String,
    created_at: i64,
    updated_at: i64,
}

impl From<&Conversation> for ConversationRow {
    fn from(c: &Conversation) -> Self {
        Self {
            id: c.id.clone(),
            user_name: c.user_name.clone(),
            project_name: c.project_name.clone(),
            title: c.title.clone(),
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        Self {
            id: row.id,
            user_name: row.user_name,
            project_name: row.project_name,
            title: row.title,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Queryable, Selectable, Insertable, Debug)]
#[diesel(table_name = messages)]
struct MessageRow {
    id: String,
    conversation_id: String,
    role: String,
    content: Option<String>,
    tool_calls: Option<serde_json::Value>,
    tool_results: Option<serde_json::Value>,
    input_tokens: Option<i32>,
    output_tokens: Option<i32>,
    created_at: i64,
}

impl TryFrom<&Message> for MessageRow {
    type Error = StoreError;

    fn try_from(m: &Message) -> StoreResult<Self> {
        let tool_calls = if m.tool_calls.is_empty() {
            None
        } else {
            Some(serde_json::to_value(&m.tool_calls)?)
        };
        let tool_results = if m.tool_results.is_empty() {
            None
        } else {
            Some(serde_json::to_value(&m.tool_results)?)
        };

        Ok(Self {
            id: m.id.clone(),
            conversation_id: m.conversation_id.clone(),
            role: m.role.as_str().to_string(),
            content: m.content.clone(),
            tool_calls,
            tool_results,
            input_tokens: m.input_tokens,
            output_tokens: m.output_tokens,
            created_at: m.timestamp,
        })
    }
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> StoreResult<Self> {
        let role = Role::from_str(&row.role).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let tool_calls: Vec<ToolCall> = match row.tool_calls {
            Some(v) => serde_json::from_value(v)?,
            None => Vec::new(),
        };
        let tool_results: Vec<ToolResult> = match row.tool_results {
            Some(v) => serde_json::from_value(v)?,
            None => Vec::new(),
        };

        Ok(Self {
            id: row.id,
            conversation_id: row.conversation_id,
            role,
            content: row.content,
            tool_calls,
            tool_results,
            input_tokens: row.input_tokens,
            output_tokens: row.output_tokens,
            timestamp: row.created_at,
        })
    }
}

#[derive(Queryable, Selectable, Insertable, Debug)]
#[diesel(table_name = scheduled_tasks)]
struct ScheduledTaskRow {
    id: String,
    user_name: Option<String>,
    project_name: String,
    description: String,
    prompt: String,
    cron_expression: String,
    last_run_at: Option<i64>,
    next_run_at: i64,
    status: String,
    enabled: bool,
    created_at: i64,
}

impl From<&ScheduledTask> for ScheduledTaskRow {
    fn from(t: &ScheduledTask) -> Self {
        Self {
            id: t.id.clone(),
            user_name: t.user_name.clone(),
            project_name: t.project_name.clone(),
            description: t.description.clone(),
            prompt: t.prompt.clone(),
            cron_expression: t.cron_expression.clone(),
            last_run_at: t.last_run_at,
            next_run_at: t.next_run_at,
            status: t.status.as_str().to_string(),
            enabled: t.enabled,
            created_at: t.created_at,
        }
    }
}

impl TryFrom<ScheduledTaskRow> for ScheduledTask {
    type Error = StoreError;

    fn try_from(row: ScheduledTaskRow) -> StoreResult<Self> {
        let status =
            TaskStatus::from_str(&row.status).map_err(|e| StoreError::Corrupt(e.to_string()))?;

        Ok(Self {
            id: row.id,
            user_name: row.user_name,
            project_name: row.project_name,
            description: row.description,
            prompt: row.prompt,
            cron_expression: row.cron_expression,
            last_run_at: row.last_run_at,
            next_run_at: row.next_run_at,
            status,
            enabled: row.enabled,
            created_at: row.created_at,
        })
    }
}

#[derive(Queryable, Selectable, Insertable, Debug)]
#[diesel(table_name = task_executions)]
struct TaskExecutionRow {
    id: String,
    task_id: String,
    executed_at: i64,
    conversation_id: Option<String>,
    status: String,
    error_message: Option<String>,
    duration_ms: i64,
}

impl From<&TaskExecution> for TaskExecutionRow {
    fn from(e: &TaskExecution) -> Self {
        Self {
            id: e.id.clone(),
            task_id: e.task_id.clone(),
            executed_at: e.executed_at,
            conversation_id: e.conversation_id.clone(),
            status: e.status.as_str().to_string(),
            error_message: e.error_message.clone(),
            duration_ms: e.duration_ms,
        }
    }
}

impl TryFrom<TaskExecutionRow> for TaskExecution {
    type Error = StoreError;

    fn try_from(row: TaskExecutionRow) -> StoreResult<Self> {
        let status = ExecutionStatus::from_str(&row.status)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        Ok(Self {
            id: row.id,
            task_id: row.task_id,
            executed_at: row.executed_at,
            conversation_id: row.conversation_id,
            status,
            error_message: row.error_message,
            duration_ms: row.duration_ms,
        })
    }
}

// ============================================================================
// Store
// ============================================================================

pub struct PgStore {
    conn: Arc<Mutex<PgConnection>>,
}

impl PgStore {
    /// Create a store over a shared connection
    pub fn new(conn: Arc<Mutex<PgConnection>>) -> Self {
        Self { conn }
    }

    /// Create a store with its own connection
    pub fn connect(database_url: &str) -> StoreResult<Self> {
        let conn = PgConnection::establish(database_url)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, PgConnection>> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))
    }
}

impl Store for PgStore {
    fn create_conversation(&self, conversation: &Conversation) -> StoreResult<()> {
        let mut conn = self.conn()?;
        diesel::insert_into(conversations::table)
            .values(ConversationRow::from(conversation))
            .execute(&mut *conn)?;
        Ok(())
    }

    fn find_conversation(&self, id: &str) -> StoreResult<Option<Conversation>> {
        let mut conn = self.conn()?;
        let row = conversations::table
            .filter(conversations::id.eq(id))
            .select(ConversationRow::as_select())
            .first(&mut *conn)
            .optional()?;
        Ok(row.map(Conversation::from))
    }

    fn list_conversations_by_user(
        &self,
        user_name: &str,
        limit: i64,
    ) -> StoreResult<Vec<Conversation>> {
        let mut conn = self.conn()?;
        let rows = conversations::table
            .filter(conversations::user_name.eq(user_name))
            .order(conversations::updated_at.desc())
            .limit(limit)
            .select(ConversationRow::as_select())
            .load(&mut *conn)?;
        Ok(rows.into_iter().map(Conversation::from).collect())
    }

    fn list_conversations_by_project(
        &self,
        project_name: &str,
        limit: i64,
    ) -> StoreResult<Vec<Conversation>> {
        let mut conn = self.conn()?;
        let rows = conversations::table
            .filter(conversations::project_name.eq(project_name))
            .order(conversations::updated_at.desc())
            .limit(limit)
            .select(ConversationRow::as_select())
            .load(&mut *conn)?;
        Ok(rows.into_iter().map(Conversation::from).collect())
    }

    fn update_conversation(&self, conversation: &Conversation) -> StoreResult<()> {
        let mut conn = self.conn()?;
        diesel::update(conversations::table.filter(conversations::id.eq(&conversation.id)))
            .set((
                conversations::title.eq(&conversation.title),
                conversations::updated_at.eq(conversation.updated_at),
            ))
            .execute(&mut *conn)?;
        Ok(())
    }

    fn delete_conversation(&self, id: &str) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        let deleted = conn.transaction::<usize, diesel::result::Error, _>(|conn| {
            diesel::delete(messages::table.filter(messages::conversation_id.eq(id)))
                .execute(conn)?;
            diesel::delete(conversations::table.filter(conversations::id.eq(id))).execute(conn)
        })?;
        Ok(deleted > 0)
    }

    fn create_message(&self, message: &Message) -> StoreResult<()> {
        let row = MessageRow::try_from(message)?;
        let mut conn = self.conn()?;
        diesel::insert_into(messages::table)
            .values(row)
            .execute(&mut *conn)?;
        Ok(())
    }

    fn list_messages(&self, conversation_id: &str, limit: i64) -> StoreResult<Vec<Message>> {
        let mut conn = self.conn()?;
        let mut rows: Vec<MessageRow> = messages::table
            .filter(messages::conversation_id.eq(conversation_id))
            .order(messages::created_at.desc())
            .limit(limit)
            .select(MessageRow::as_select())
            .load(&mut *conn)?;

        // Chronological order
        rows.reverse();
        rows.into_iter().map(Message::try_from).collect()
    }

    fn count_messages(&self, conversation_id: &str) -> StoreResult<i64> {
        let mut conn = self.conn()?;
        let count = messages::table
            .filter(messages::conversation_id.eq(conversation_id))
            .count()
            .get_result(&mut *conn)?;
        Ok(count)
    }

    fn create_task(&self, task: &ScheduledTask) -> StoreResult<()> {
        let mut conn = self.conn()?;
        diesel::insert_into(scheduled_tasks::table)
            .values(ScheduledTaskRow::from(task))
            .execute(&mut *conn)?;
        Ok(())
    }

    fn find_task(&self, id: &str) -> StoreResult<Option<ScheduledTask>> {
        let mut conn = self.conn()?;
        let row = scheduled_tasks::table
            .filter(scheduled_tasks::id.eq(id))
            .select(ScheduledTaskRow::as_select())
            .first(&mut *conn)
            .optional()?;
        row.map(ScheduledTask::try_from).transpose()
    }

    fn list_enabled_tasks(&self) -> StoreResult<Vec<ScheduledTask>> {
        let mut conn = self.conn()?;
        let rows = scheduled_tasks::table
            .filter(scheduled_tasks::enabled.eq(true))
            .order(scheduled_tasks::next_run_at.asc())
            .select(ScheduledTaskRow::as_select())
            .load(&mut *conn)?;
        rows.into_iter().map(ScheduledTask::try_from).collect()
    }

    fn list_tasks_by_user(&self, user_name: &str) -> StoreResult<Vec<ScheduledTask>> {
        let mut conn = self.conn()?;
        let rows = scheduled_tasks::table
            .filter(scheduled_tasks::user_name.eq(user_name))
            .order(scheduled_tasks::created_at.desc())
            .select(ScheduledTaskRow::as_select())
            .load(&mut *conn)?;
        rows.into_iter().map(ScheduledTask::try_from).collect()
    }

    fn list_tasks_by_project(&self, project_name: &str) -> StoreResult<Vec<ScheduledTask>> {
        let mut conn = self.conn()?;
        let rows = scheduled_tasks::table
            .filter(scheduled_tasks::project_name.eq(project_name))
            .order(scheduled_tasks::created_at.desc())
            .select(ScheduledTaskRow::as_select())
            .load(&mut *conn)?;
        rows.into_iter().map(ScheduledTask::try_from).collect()
    }

    fn update_next_run(
        &self,
        id: &str,
        next_run_at: i64,
        last_run_at: Option<i64>,
    ) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let target = scheduled_tasks::table.filter(scheduled_tasks::id.eq(id));
        match last_run_at {
            Some(last) => diesel::update(target)
                .set((
                    scheduled_tasks::next_run_at.eq(next_run_at),
                    scheduled_tasks::last_run_at.eq(last),
                ))
                .execute(&mut *conn)?,
            None => diesel::update(target)
                .set(scheduled_tasks::next_run_at.eq(next_run_at))
                .execute(&mut *conn)?,
        };
        Ok(())
    }

    fn update_task_status(&self, id: &str, status: TaskStatus) -> StoreResult<()> {
        let mut conn = self.conn()?;
        diesel::update(scheduled_tasks::table.filter(scheduled_tasks::id.eq(id)))
            .set(scheduled_tasks::status.eq(status.as_str()))
            .execute(&mut *conn)?;
        Ok(())
    }

    fn set_task_enabled(&self, id: &str, enabled: bool) -> StoreResult<()> {
        let mut conn = self.conn()?;
        diesel::update(scheduled_tasks::table.filter(scheduled_tasks::id.eq(id)))
            .set(scheduled_tasks::enabled.eq(enabled))
            .execute(&mut *conn)?;
        Ok(())
    }

    fn delete_task(&self, id: &str) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        let deleted = conn.transaction::<usize, diesel::result::Error, _>(|conn| {
            diesel::delete(task_executions::table.filter(task_executions::task_id.eq(id)))
                .execute(conn)?;
            diesel::delete(scheduled_tasks::table.filter(scheduled_tasks::id.eq(id)))
                .execute(conn)
        })?;
        Ok(deleted > 0)
    }

    fn record_execution(&self, execution: &TaskExecution) -> StoreResult<()> {
        let mut conn = self.conn()?;
        diesel::insert_into(task_executions::table)
            .values(TaskExecutionRow::from(execution))
            .execute(&mut *conn)?;
        Ok(())
    }

    fn list_executions(&self, task_id: &str, limit: i64) -> StoreResult<Vec<TaskExecution>> {
        let mut conn = self.conn()?;
        let rows = task_executions::table
            .filter(task_executions::task_id.eq(task_id))
            .order(task_executions::executed_at.desc())
            .limit(limit)
            .select(TaskExecutionRow::as_select())
            .load(&mut *conn)?;
        rows.into_iter().map(TaskExecution::try_from).collect()
    }
}
