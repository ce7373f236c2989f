//! Task scheduler for recurring prompts
//!
//! Every enabled task has at most one armed firing: a delayed tokio task
//! keyed by task id in the pending map and cancelled through its
//! [`CancellationToken`]. A fixed number of semaphore permits bounds how many
//! firings run at once. A firing runs the prompt in a fresh conversation,
//! records a [`TaskExecution`], recomputes `next_run_at` and re-arms the task
//! if it is still enabled.

use chrono_tz::Tz;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::agent::Orchestrator;
use crate::cron::{next_run_after, parse_cron, CronError};
use crate::models::{
    new_id, now_millis, Conversation, ExecutionStatus, Message, ScheduledTask, TaskExecution,
    TaskStatus,
};
use crate::storage::{Store, StoreError};
use crate::tools::RegistryFactory;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Cron error: {0}")]
    Cron(#[from] CronError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub timezone: Tz,
    /// How long `stop` waits for in-flight firings before aborting them
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            timezone: Tz::UTC,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Requests sent to a running scheduler
#[derive(Debug)]
pub enum SchedulerCommand {
    Schedule(ScheduledTask),
    Unschedule(String),
}

/// Cloneable sender used by tools and the API to reach the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerCommand>,
}

impl SchedulerHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SchedulerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn schedule(&self, task: ScheduledTask) {
        let id = task.id.clone();
        if self.tx.send(SchedulerCommand::Schedule(task)).is_err() {
            warn!("Scheduler not running; task {} will be armed on next start", id);
        }
    }

    pub fn unschedule(&self, task_id: &str) {
        if self
            .tx
            .send(SchedulerCommand::Unschedule(task_id.to_string()))
            .is_err()
        {
            warn!("Scheduler not running; cannot unschedule task {}", task_id);
        }
    }
}

struct PendingFiring {
    token: CancellationToken,
    generation: u64,
}

// ============================================================================
// Shared state
// ============================================================================

struct Shared {
    store: Arc<dyn Store>,
    orchestrator: Arc<Orchestrator>,
    registry_factory: RegistryFactory,
    timezone: Tz,
    pending: Mutex<HashMap<String, PendingFiring>>,
    workers: Arc<Semaphore>,
    tracker: TaskTracker,
    generation: AtomicU64,
    /// Set once `stop` begins; nothing new is armed afterwards
    closing: CancellationToken,
    /// Aborts in-flight firings once the shutdown grace period is over
    hard_stop: CancellationToken,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingFiring>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn unschedule(&self, task_id: &str) -> bool {
        match self.pending().remove(task_id) {
            Some(firing) => {
                firing.token.cancel();
                debug!("Cancelled pending firing for task {}", task_id);
                true
            }
            None => false,
        }
    }

    /// Arm one firing for `task`. Store writes here are best effort: a task
    /// is armed even when its status or recomputed time cannot be persisted.
    fn schedule(self: &Arc<Self>, task: &ScheduledTask) -> Result<(), ScheduleError> {
        if self.closing.is_cancelled() {
            return Err(ScheduleError::ShuttingDown);
        }
        parse_cron(&task.cron_expression)?;

        let now = now_millis();
        let mut armed = task.clone();
        if armed.next_run_at < now {
            armed.next_run_at = next_run_after(&task.cron_expression, now, self.timezone)?;
            if let Err(e) = self.store.update_next_run(&task.id, armed.next_run_at, None) {
                warn!("Failed to persist recomputed next run for task {}: {}", task.id, e);
            }
            info!(
                "Task {} missed its run; next run recomputed to {}",
                task.id, armed.next_run_at
            );
        }
        if let Err(e) = self.store.update_task_status(&task.id, TaskStatus::Scheduled) {
            warn!("Failed to mark task {} scheduled: {}", task.id, e);
        }
        armed.status = TaskStatus::Scheduled;

        let delay = Duration::from_millis((armed.next_run_at - now).max(0) as u64);
        let token = CancellationToken::new();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        {
            let mut pending = self.pending();
            if let Some(previous) = pending.insert(
                task.id.clone(),
                PendingFiring {
                    token: token.clone(),
                    generation,
                },
            ) {
                previous.token.cancel();
                debug!("Replaced pending firing for task {}", task.id);
            }
        }

        let shared = Arc::clone(self);
        self.tracker.spawn(async move {
            shared.fire(armed, generation, token, delay).await;
        });

        debug!("Task {} armed to fire in {:?}", task.id, delay);
        Ok(())
    }

    async fn fire(
        self: Arc<Self>,
        armed: ScheduledTask,
        generation: u64,
        token: CancellationToken,
        delay: Duration,
    ) {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let _permit = tokio::select! {
            _ = token.cancelled() => return,
            permit = self.workers.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        {
            let mut pending = self.pending();
            if token.is_cancelled() {
                return;
            }
            if pending.get(&armed.id).map(|p| p.generation) == Some(generation) {
                pending.remove(&armed.id);
            }
        }

        self.execute_and_reschedule(armed).await;
    }

    /// `armed` is the task as it was when the firing was armed
    async fn execute_and_reschedule(self: &Arc<Self>, armed: ScheduledTask) {
        let task = match self.store.find_task(&armed.id) {
            Ok(Some(task)) if task.enabled => task,
            Ok(Some(_)) => {
                debug!("Task {} was disabled before firing", armed.id);
                return;
            }
            Ok(None) => {
                debug!("Task {} no longer exists", armed.id);
                return;
            }
            Err(e) => {
                // Only a pause or delete may drop an enabled task
                error!("Failed to load task {}; skipping this run: {}", armed.id, e);
                self.reschedule(&armed, None);
                return;
            }
        };

        if let Err(e) = self.store.update_task_status(&task.id, TaskStatus::Running) {
            warn!("Failed to mark task {} running: {}", task.id, e);
        }

        info!("Executing scheduled task: {} ({})", task.description, task.id);
        let executed_at = now_millis();
        let started = Instant::now();

        // The conversation exists before the body starts so an aborted run
        // still points at it
        let conversation = Conversation::new(
            task.user_name.clone(),
            task.project_name.clone(),
            format!("[Task] {}", task.description),
            executed_at,
        );
        let (conversation_id, result) = match self.store.create_conversation(&conversation) {
            Ok(()) => {
                let prompt = Message::user(&conversation.id, &task.prompt, executed_at);
                let result = match self.store.create_message(&prompt) {
                    Ok(()) => self.run_body(task.clone(), conversation.clone()).await,
                    Err(e) => Err(e.into()),
                };
                (Some(conversation.id), result)
            }
            Err(e) => (None, Err(anyhow::Error::from(e))),
        };

        let duration_ms = started.elapsed().as_millis() as i64;
        let (status, error_message) = match &result {
            Ok(()) => (ExecutionStatus::Success, None),
            Err(e) => (ExecutionStatus::Failed, Some(format!("{:#}", e))),
        };

        match &error_message {
            None => info!("Task {} succeeded in {}ms", task.id, duration_ms),
            Some(e) => error!("Task {} failed after {}ms: {}", task.id, duration_ms, e),
        }

        let execution = TaskExecution {
            id: new_id(),
            task_id: task.id.clone(),
            executed_at,
            conversation_id,
            status,
            error_message,
            duration_ms,
        };
        if let Err(e) = self.store.record_execution(&execution) {
            error!("Failed to record execution for task {}: {}", task.id, e);
        }

        self.reschedule(&task, Some(executed_at));
    }

    /// Race the agent run against the shutdown deadline
    async fn run_body(
        self: &Arc<Self>,
        task: ScheduledTask,
        conversation: Conversation,
    ) -> anyhow::Result<()> {
        let body = tokio::spawn(run_task_body(Arc::clone(self), task, conversation));
        let abort = body.abort_handle();
        tokio::select! {
            joined = body => match joined {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("Task body panicked: {}", e)),
            },
            _ = self.hard_stop.cancelled() => {
                abort.abort();
                Err(anyhow::anyhow!("Aborted during scheduler shutdown"))
            }
        }
    }

    fn reschedule(self: &Arc<Self>, task: &ScheduledTask, last_run_at: Option<i64>) {
        if self.closing.is_cancelled() {
            return;
        }

        let now = now_millis();
        let next_run_at = match next_run_after(&task.cron_expression, now, self.timezone) {
            Ok(next) => next,
            Err(e) => {
                error!("Cannot compute next run for task {}: {}", task.id, e);
                return;
            }
        };
        if let Err(e) = self.store.update_next_run(&task.id, next_run_at, last_run_at) {
            error!("Failed to persist next run for task {}: {}", task.id, e);
        }

        // Reload to pick up a pause or delete that happened while firing
        match self.store.find_task(&task.id) {
            Ok(Some(fresh)) if fresh.enabled => self.rearm(&fresh),
            Ok(Some(_)) => {
                if let Err(e) = self.store.update_task_status(&task.id, TaskStatus::Paused) {
                    warn!("Failed to mark task {} paused: {}", task.id, e);
                }
                debug!("Task {} disabled while firing; not rescheduled", task.id);
            }
            Ok(None) => debug!("Task {} deleted while firing", task.id),
            Err(e) => {
                error!(
                    "Failed to reload task {}; re-arming from last known state: {}",
                    task.id, e
                );
                let mut known = task.clone();
                known.next_run_at = next_run_at;
                known.last_run_at = last_run_at.or(task.last_run_at);
                self.rearm(&known);
            }
        }
    }

    fn rearm(self: &Arc<Self>, task: &ScheduledTask) {
        match self.schedule(task) {
            Ok(()) => info!("Task {} rescheduled", task.id),
            Err(e) => error!("Failed to reschedule task {}: {}", task.id, e),
        }
    }
}

/// One agent run over the task's conversation, which already holds the prompt
async fn run_task_body(
    shared: Arc<Shared>,
    task: ScheduledTask,
    conversation: Conversation,
) -> anyhow::Result<()> {
    let registry = (shared.registry_factory)();
    let reply = shared.orchestrator.run(&conversation, &registry).await?;
    debug!(
        "Task {} produced {} chars in conversation {}",
        task.id,
        reply.text().len(),
        conversation.id
    );
    Ok(())
}

// ============================================================================
// Scheduler
// ============================================================================

#[derive(Clone)]
pub struct TaskScheduler {
    shared: Arc<Shared>,
    shutdown_grace: Duration,
}

impl TaskScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        orchestrator: Arc<Orchestrator>,
        registry_factory: RegistryFactory,
        config: SchedulerConfig,
    ) -> Self {
        // Scheduled runs always start from a fresh conversation
        let shared = Shared {
            store,
            orchestrator: Arc::new(orchestrator.without_compaction()),
            registry_factory,
            timezone: config.timezone,
            pending: Mutex::new(HashMap::new()),
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            tracker: TaskTracker::new(),
            generation: AtomicU64::new(0),
            closing: CancellationToken::new(),
            hard_stop: CancellationToken::new(),
        };

        Self {
            shared: Arc::new(shared),
            shutdown_grace: config.shutdown_grace,
        }
    }

    /// Arm every enabled task in the store. Returns how many were armed.
    pub fn start(&self) -> Result<usize, ScheduleError> {
        let tasks = self.shared.store.list_enabled_tasks()?;
        let mut armed = 0;

        for task in &tasks {
            match self.schedule_task(task) {
                Ok(()) => armed += 1,
                Err(e) => error!("Failed to schedule task {} ({}): {}", task.id, task.description, e),
            }
        }

        info!("Task scheduler started: {} of {} tasks armed", armed, tasks.len());
        Ok(armed)
    }

    /// Apply commands from [`SchedulerHandle`]s until the scheduler stops
    pub fn listen(&self, mut rx: mpsc::UnboundedReceiver<SchedulerCommand>) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                let command = tokio::select! {
                    _ = scheduler.shared.closing.cancelled() => break,
                    command = rx.recv() => match command {
                        Some(command) => command,
                        None => break,
                    },
                };

                match command {
                    SchedulerCommand::Schedule(task) => {
                        if let Err(e) = scheduler.schedule_task(&task) {
                            error!("Failed to schedule task {}: {}", task.id, e);
                        }
                    }
                    SchedulerCommand::Unschedule(id) => {
                        scheduler.unschedule_task(&id);
                    }
                }
            }
            debug!("Scheduler command loop exited");
        })
    }

    /// Arm a task, replacing any pending firing for the same id
    pub fn schedule_task(&self, task: &ScheduledTask) -> Result<(), ScheduleError> {
        self.shared.schedule(task)
    }

    /// Cancel a pending firing. A firing already running is not interrupted.
    pub fn unschedule_task(&self, task_id: &str) -> bool {
        self.shared.unschedule(task_id)
    }

    pub fn is_scheduled(&self, task_id: &str) -> bool {
        self.shared.pending().contains_key(task_id)
    }

    pub fn scheduled_count(&self) -> usize {
        self.shared.pending().len()
    }

    /// Cancel pending firings, wait for running ones, abort stragglers
    pub async fn stop(&self) {
        self.shared.closing.cancel();

        let cancelled = {
            let mut pending = self.shared.pending();
            let count = pending.len();
            for (_, firing) in pending.drain() {
                firing.token.cancel();
            }
            count
        };
        info!("Scheduler stopping: {} pending firings cancelled", cancelled);

        self.shared.tracker.close();
        if tokio::time::timeout(self.shutdown_grace, self.shared.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "Firings still running after {:?}; aborting them",
                self.shutdown_grace
            );
            self.shared.hard_stop.cancel();
            self.shared.tracker.wait().await;
        }

        info!("Task scheduler stopped");
    }
}
