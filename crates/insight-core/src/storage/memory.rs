//! In-process store

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{Store, StoreError, StoreResult};
use crate::models::{Conversation, Message, ScheduledTask, TaskExecution, TaskStatus};

#[derive(Default)]
struct Tables {
    conversations: HashMap<String, Conversation>,
    messages: Vec<Message>,
    tasks: HashMap<String, ScheduledTask>,
    executions: Vec<TaskExecution>,
}

/// Store kept entirely in memory. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))
    }
}

fn newest_conversations<'a>(
    iter: impl Iterator<Item = &'a Conversation>,
    limit: i64,
) -> Vec<Conversation> {
    let mut found: Vec<Conversation> = iter.cloned().collect();
    found.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    found.truncate(limit.max(0) as usize);
    found
}

fn newest_tasks<'a>(iter: impl Iterator<Item = &'a ScheduledTask>) -> Vec<ScheduledTask> {
    let mut found: Vec<ScheduledTask> = iter.cloned().collect();
    found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    found
}

impl Store for MemoryStore {
    fn create_conversation(&self, conversation: &Conversation) -> StoreResult<()> {
        self.lock()?
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    fn find_conversation(&self, id: &str) -> StoreResult<Option<Conversation>> {
        Ok(self.lock()?.conversations.get(id).cloned())
    }

    fn list_conversations_by_user(
        &self,
        user_name: &str,
        limit: i64,
    ) -> StoreResult<Vec<Conversation>> {
        let tables = self.lock()?;
        Ok(newest_conversations(
            tables
                .conversations
                .values()
                .filter(|c| c.user_name.as_deref() == Some(user_name)),
            limit,
        ))
    }

    fn list_conversations_by_project(
        &self,
        project_name: &str,
        limit: i64,
    ) -> StoreResult<Vec<Conversation>> {
        let tables = self.lock()?;
        Ok(newest_conversations(
            tables
                .conversations
                .values()
                .filter(|c| c.project_name == project_name),
            limit,
        ))
    }

    fn update_conversation(&self, conversation: &Conversation) -> StoreResult<()> {
        let mut tables = self.lock()?;
        if let Some(existing) = tables.conversations.get_mut(&conversation.id) {
            *existing = conversation.clone();
        }
        Ok(())
    }

    fn delete_conversation(&self, id: &str) -> StoreResult<bool> {
        let mut tables = self.lock()?;
        let existed = tables.conversations.remove(id).is_some();
        tables.messages.retain(|m| m.conversation_id != id);
        Ok(existed)
    }

    fn create_message(&self, message: &Message) -> StoreResult<()> {
        self.lock()?.messages.push(message.clone());
        Ok(())
    }

    fn list_messages(&self, conversation_id: &str, limit: i64) -> StoreResult<Vec<Message>> {
        let tables = self.lock()?;
        let mut found: Vec<Message> = tables
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        found.sort_by_key(|m| m.timestamp);

        let skip = found.len().saturating_sub(limit.max(0) as usize);
        Ok(found.split_off(skip))
    }

    fn count_messages(&self, conversation_id: &str) -> StoreResult<i64> {
        let tables = self.lock()?;
        Ok(tables
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .count() as i64)
    }

    fn create_task(&self, task: &ScheduledTask) -> StoreResult<()> {
        self.lock()?.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    fn find_task(&self, id: &str) -> StoreResult<Option<ScheduledTask>> {
        Ok(self.lock()?.tasks.get(id).cloned())
    }

    fn list_enabled_tasks(&self) -> StoreResult<Vec<ScheduledTask>> {
        let tables = self.lock()?;
        let mut found: Vec<ScheduledTask> =
            tables.tasks.values().filter(|t| t.enabled).cloned().collect();
        found.sort_by_key(|t| t.next_run_at);
        Ok(found)
    }

    fn list_tasks_by_user(&self, user_name: &str) -> StoreResult<Vec<ScheduledTask>> {
        let tables = self.lock()?;
        Ok(newest_tasks(
            tables
                .tasks
                .values()
                .filter(|t| t.user_name.as_deref() == Some(user_name)),
        ))
    }

    fn list_tasks_by_project(&self, project_name: &str) -> StoreResult<Vec<ScheduledTask>> {
        let tables = self.lock()?;
        Ok(newest_tasks(
            tables
                .tasks
                .values()
                .filter(|t| t.project_name == project_name),
        ))
    }

    fn update_next_run(
        &self,
        id: &str,
        next_run_at: i64,
        last_run_at: Option<i64>,
    ) -> StoreResult<()> {
        let mut tables = self.lock()?;
        if let Some(task) = tables.tasks.get_mut(id) {
            task.next_run_at = next_run_at;
            if last_run_at.is_some() {
                task.last_run_at = last_run_at;
            }
        }
        Ok(())
    }

    fn update_task_status(&self, id: &str, status: TaskStatus) -> StoreResult<()> {
        let mut tables = self.lock()?;
        if let Some(task) = tables.tasks.get_mut(id) {
            task.status = status;
        }
        Ok(())
    }

    fn set_task_enabled(&self, id: &str, enabled: bool) -> StoreResult<()> {
        let mut tables = self.lock()?;
        if let Some(task) = tables.tasks.get_mut(id) {
            task.enabled = enabled;
        }
        Ok(())
    }

    fn delete_task(&self, id: &str) -> StoreResult<bool> {
        let mut tables = self.lock()?;
        let existed = tables.tasks.remove(id).is_some();
        tables.executions.retain(|e| e.task_id != id);
        Ok(existed)
    }

    fn record_execution(&self, execution: &TaskExecution) -> StoreResult<()> {
        self.lock()?.executions.push(execution.clone());
        Ok(())
    }

    fn list_executions(&self, task_id: &str, limit: i64) -> StoreResult<Vec<TaskExecution>> {
        let tables = self.lock()?;
        let mut found: Vec<TaskExecution> = tables
            .executions
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.executed_at.cmp(&a.executed_at));
        found.truncate(limit.max(0) as usize);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExecutionStatus;

    #[test]
    fn test_list_messages_returns_most_recent_oldest_first() {
        let store = MemoryStore::new();
        let conv = Conversation::new(Some("ana".into()), "plant", "hello", 1);
        store.create_conversation(&conv).unwrap();

        for i in 0..5 {
            store
                .create_message(&Message::user(&conv.id, format!("m{}", i), 100 + i))
                .unwrap();
        }

        let recent = store.list_messages(&conv.id, 2).unwrap();
        let texts: Vec<&str> = recent.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["m3", "m4"]);
        assert_eq!(store.count_messages(&conv.id).unwrap(), 5);
    }

    #[test]
    fn test_delete_conversation_cascades() {
        let store = MemoryStore::new();
        let conv = Conversation::new(None, "plant", "hello", 1);
        store.create_conversation(&conv).unwrap();
        store
            .create_message(&Message::user(&conv.id, "hi", 2))
            .unwrap();

        assert!(store.delete_conversation(&conv.id).unwrap());
        assert!(!store.delete_conversation(&conv.id).unwrap());
        assert_eq!(store.count_messages(&conv.id).unwrap(), 0);
        assert!(store.find_conversation(&conv.id).unwrap().is_none());
    }

    #[test]
    fn test_conversations_sorted_by_update() {
        let store = MemoryStore::new();
        let mut older = Conversation::new(Some("ana".into()), "plant", "older", 1);
        let newer = Conversation::new(Some("ana".into()), "plant", "newer", 5);
        store.create_conversation(&older).unwrap();
        store.create_conversation(&newer).unwrap();

        older.updated_at = 10;
        store.update_conversation(&older).unwrap();

        let listed = store.list_conversations_by_user("ana", 10).unwrap();
        assert_eq!(listed[0].title, "older");
        assert_eq!(store.list_conversations_by_project("plant", 1).unwrap().len(), 1);
        assert!(store.list_conversations_by_user("bob", 10).unwrap().is_empty());
    }

    #[test]
    fn test_task_lifecycle() {
        let store = MemoryStore::new();
        let task = ScheduledTask::new(
            Some("ana".into()),
            "plant",
            "Daily report",
            "Summarise alarms",
            "0 9 * * *",
            1_000,
            0,
        );
        store.create_task(&task).unwrap();

        store.update_next_run(&task.id, 2_000, Some(1_500)).unwrap();
        store.update_task_status(&task.id, TaskStatus::Scheduled).unwrap();
        let found = store.find_task(&task.id).unwrap().unwrap();
        assert_eq!(found.next_run_at, 2_000);
        assert_eq!(found.last_run_at, Some(1_500));
        assert_eq!(found.status, TaskStatus::Scheduled);

        store.set_task_enabled(&task.id, false).unwrap();
        assert!(store.list_enabled_tasks().unwrap().is_empty());

        for (i, status) in [ExecutionStatus::Success, ExecutionStatus::Failed]
            .into_iter()
            .enumerate()
        {
            store
                .record_execution(&TaskExecution {
                    id: format!("exec-{}", i),
                    task_id: task.id.clone(),
                    executed_at: i as i64,
                    conversation_id: None,
                    status,
                    error_message: None,
                    duration_ms: 1,
                })
                .unwrap();
        }
        let executions = store.list_executions(&task.id, 10).unwrap();
        assert_eq!(executions[0].status, ExecutionStatus::Failed);

        assert!(store.delete_task(&task.id).unwrap());
        assert!(store.list_executions(&task.id, 10).unwrap().is_empty());
    }
}
