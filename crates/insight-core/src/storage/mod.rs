//! Durable store for conversations, messages, scheduled tasks and executions
//!
//! Both the agent loop and the scheduler go through the [`Store`] trait.
//! [`PgStore`] persists to PostgreSQL with Diesel; [`MemoryStore`] keeps
//! everything in process and backs the tests.

mod db;
mod memory;

pub use db::{run_migrations, PgStore};
pub use memory::MemoryStore;

use crate::models::{Conversation, Message, ScheduledTask, TaskExecution, TaskStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("Connection error: {0}")]
    Connection(#[from] diesel::ConnectionError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Lock error: {0}")]
    Lock(String),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Operations the agent loop and scheduler require from persistence.
///
/// All identifiers are strings and all timestamps epoch milliseconds.
/// Lookups by id return `Ok(None)` when absent; updates and deletes of
/// missing rows are not errors.
pub trait Store: Send + Sync {
    // Conversations
    fn create_conversation(&self, conversation: &Conversation) -> StoreResult<()>;
    fn find_conversation(&self, id: &str) -> StoreResult<Option<Conversation>>;
    /// Most recently updated first
    fn list_conversations_by_user(&self, user_name: &str, limit: i64)
        -> StoreResult<Vec<Conversation>>;
    /// Most recently updated first
    fn list_conversations_by_project(
        &self,
        project_name: &str,
        limit: i64,
    ) -> StoreResult<Vec<Conversation>>;
    fn update_conversation(&self, conversation: &Conversation) -> StoreResult<()>;
    /// Deletes the conversation and its messages. Returns whether it existed.
    fn delete_conversation(&self, id: &str) -> StoreResult<bool>;

    // Messages
    fn create_message(&self, message: &Message) -> StoreResult<()>;
    /// The most recent `limit` messages, oldest first
    fn list_messages(&self, conversation_id: &str, limit: i64) -> StoreResult<Vec<Message>>;
    fn count_messages(&self, conversation_id: &str) -> StoreResult<i64>;

    // Scheduled tasks
    fn create_task(&self, task: &ScheduledTask) -> StoreResult<()>;
    fn find_task(&self, id: &str) -> StoreResult<Option<ScheduledTask>>;
    fn list_enabled_tasks(&self) -> StoreResult<Vec<ScheduledTask>>;
    fn list_tasks_by_user(&self, user_name: &str) -> StoreResult<Vec<ScheduledTask>>;
    fn list_tasks_by_project(&self, project_name: &str) -> StoreResult<Vec<ScheduledTask>>;
    fn update_next_run(
        &self,
        id: &str,
        next_run_at: i64,
        last_run_at: Option<i64>,
    ) -> StoreResult<()>;
    fn update_task_status(&self, id: &str, status: TaskStatus) -> StoreResult<()>;
    fn set_task_enabled(&self, id: &str, enabled: bool) -> StoreResult<()>;
    /// Deletes the task and its executions. Returns whether it existed.
    fn delete_task(&self, id: &str) -> StoreResult<bool>;

    // Task executions
    fn record_execution(&self, execution: &TaskExecution) -> StoreResult<()>;
    /// Newest first
    fn list_executions(&self, task_id: &str, limit: i64) -> StoreResult<Vec<TaskExecution>>;
}
