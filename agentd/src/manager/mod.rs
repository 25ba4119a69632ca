//! Admission, lifecycle, and lookup for every task this process runs (spec
//! §4.10).
//!
//! Grounded on the teacher's `Coordinator`/`StateManager` shape but realized
//! as a plain `Arc<RwLock<HashMap<String, TaskHandle>>>` rather than a second
//! actor hop — the spec calls for "a task map guarded by a single mutex, read
//! lock / write lock" directly, not another mailbox. Admission uses
//! `tokio::sync::Semaphore::try_acquire_owned`, deliberately not the
//! teacher's priority-queue `Scheduler`: spec §4.10 rejects queueing, a full
//! pool must return `Unavailable` immediately rather than backlog callers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::Backend;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::domain::{Platform, Task, TaskMode, TaskStatus};
use crate::error::ServiceError;
use crate::eventbus::{EventBus, Subscription};
use crate::metrics::Metrics;
use crate::planner::Planner;
use crate::reflector::Reflector;
use crate::worker::Worker;
use crate::workspace::Workspace;

/// Request payload for [`TaskManager::submit`]/[`TaskManager::run_streaming`],
/// matching the `RunAgentInstruction` surface (spec §6).
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub instruction: String,
    pub sandbox_id: Option<String>,
    pub destroy_sandbox_on_exit: bool,
    pub mode: TaskMode,
    pub max_steps: Option<u32>,
    pub platform: Platform,
    pub enable_takeover: bool,
    /// If true, seed the new task's conversation from `previous_task_id`'s
    /// final conversation (Open Question #1: an unknown id is a hard
    /// `Validation` error, not a silent fresh start).
    pub continue_context: bool,
    pub previous_task_id: Option<String>,
}

/// Lightweight status projection returned by [`TaskManager::query`]/[`TaskManager::list`].
#[derive(Debug, Clone)]
pub struct TaskSummary {
    pub task_id: String,
    pub status: TaskStatus,
    pub instruction: String,
    pub created_at: i64,
    pub steps: u32,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.task_id.clone(),
            status: task.status,
            instruction: task.instruction.clone(),
            created_at: task.created_at,
            steps: task.stats.steps,
        }
    }
}

/// Everything the manager keeps for a running task beyond what's in the
/// store: the shared mutable `Task`, its event bus, and its cancellation
/// token. Dropped once the Dispatcher exits and the linger window elapses.
struct TaskHandle {
    task: Arc<RwLock<Task>>,
    bus: EventBus,
    cancel: CancellationToken,
}

pub struct TaskManager {
    tasks: Arc<RwLock<HashMap<String, TaskHandle>>>,
    semaphore: Arc<Semaphore>,
    store: Arc<dyn taskstore::StoreBackend<Task>>,
    backend: Arc<dyn Backend>,
    planner: Arc<Planner>,
    worker: Arc<Worker>,
    reflector: Arc<Reflector>,
    config: Config,
    metrics: Arc<Metrics>,
}

impl TaskManager {
    pub fn new(
        store: Arc<dyn taskstore::StoreBackend<Task>>,
        backend: Arc<dyn Backend>,
        planner: Arc<Planner>,
        worker: Arc<Worker>,
        reflector: Arc<Reflector>,
        config: Config,
        metrics: Arc<Metrics>,
    ) -> Self {
        let max_concurrent = config.concurrency.max_concurrent;
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            store,
            backend,
            planner,
            worker,
            reflector,
            config,
            metrics,
        }
    }

    /// Admit `request` if capacity allows, spawn its Dispatcher, and return
    /// the new task's id. Non-blocking: a full pool returns `Unavailable`
    /// immediately rather than queueing (spec §4.10).
    pub async fn submit(&self, request: SubmitRequest) -> Result<String, ServiceError> {
        let permit = self
            .semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| ServiceError::Unavailable("max_concurrent tasks already running".to_string()))?;

        let mut task = Task::new(request.instruction.clone());
        task.sandbox_id = request.sandbox_id.clone();
        task.destroy_sandbox_on_exit = request.destroy_sandbox_on_exit;
        task.mode = request.mode;
        task.platform = request.platform;
        if let Some(max_steps) = request.max_steps {
            task.max_steps = max_steps;
        }

        if request.continue_context {
            let previous_id = request
                .previous_task_id
                .as_deref()
                .ok_or_else(|| ServiceError::Validation("continue_context requires previous_task_id".to_string()))?;
            let previous = self.store.get(previous_id).await.map_err(|_| {
                ServiceError::Validation(format!("continue_context: unknown previous_task_id {previous_id}"))
            })?;
            task.conversation = previous.conversation;
        }

        let task_id = task.task_id.clone();
        self.store.create(task.clone()).await?;

        let workspace = Arc::new(Workspace::create(&self.config.workspace.log_dir, &task_id)?);
        let bus = EventBus::new(
            task_id.clone(),
            self.config.event_bus.replay_history,
            self.config.event_bus.subscriber_buffer,
        );
        let cancel = CancellationToken::new();
        let task_arc = Arc::new(RwLock::new(task));

        self.tasks.write().await.insert(
            task_id.clone(),
            TaskHandle {
                task: task_arc.clone(),
                bus: bus.clone(),
                cancel: cancel.clone(),
            },
        );
        self.metrics.inc_active_tasks();

        let dispatcher = Dispatcher::new(
            task_arc,
            workspace,
            bus.clone(),
            cancel,
            self.backend.clone(),
            self.planner.clone(),
            self.worker.clone(),
            self.reflector.clone(),
            self.store.clone(),
            self.metrics.clone(),
            self.config.screen.clone(),
            request.enable_takeover,
        );

        let tasks = self.tasks.clone();
        let metrics = self.metrics.clone();
        let linger = std::time::Duration::from_secs(self.config.event_bus.linger_seconds);
        let reap_task_id = task_id.clone();
        tokio::spawn(async move {
            let _permit = permit;
            dispatcher.run().await;
            metrics.dec_active_tasks();
            info!(task_id = %reap_task_id, "TaskManager: dispatcher finished, starting bus linger");
            tokio::time::sleep(linger).await;
            if let Some(handle) = tasks.write().await.remove(&reap_task_id) {
                handle.bus.close().await;
            }
        });

        Ok(task_id)
    }

    /// `submit` followed immediately by `subscribe`, for callers that only
    /// want the stream and don't need the id separately (spec §4.10).
    pub async fn run_streaming(&self, request: SubmitRequest) -> Result<(String, Subscription), ServiceError> {
        let task_id = self.submit(request).await?;
        let subscription = self.subscribe(&task_id).await?;
        Ok((task_id, subscription))
    }

    /// Attach to a running or just-finished (lingering) task's event bus.
    pub async fn subscribe(&self, task_id: &str) -> Result<Subscription, ServiceError> {
        let tasks = self.tasks.read().await;
        let handle = tasks
            .get(task_id)
            .ok_or_else(|| ServiceError::NotFound(task_id.to_string()))?;
        Ok(handle.bus.subscribe().await)
    }

    /// Current status, preferring the live in-memory copy for a running
    /// task and falling back to the durable store otherwise.
    pub async fn query(&self, task_id: &str) -> Result<TaskSummary, ServiceError> {
        if let Some(handle) = self.tasks.read().await.get(task_id) {
            return Ok(TaskSummary::from(&*handle.task.read().await));
        }
        let task = self.store.get(task_id).await?;
        Ok(TaskSummary::from(&task))
    }

    /// Idempotent cancellation. Returns `true` only the first time a still
    /// cancellable task is signalled; a second call, or a call against an
    /// already-terminal task, returns `false` with no side effects (spec
    /// §8 invariant).
    pub async fn cancel(&self, task_id: &str) -> Result<bool, ServiceError> {
        let tasks = self.tasks.read().await;
        let Some(handle) = tasks.get(task_id) else {
            return Ok(false);
        };
        if handle.cancel.is_cancelled() {
            return Ok(false);
        }
        let already_terminal = handle.task.read().await.is_terminal();
        if already_terminal {
            return Ok(false);
        }
        handle.cancel.cancel();
        warn!(task_id, "TaskManager: cancellation requested");
        Ok(true)
    }

    /// Reverse-chronological page over the durable store (spec §4.10).
    pub async fn list(&self, limit: usize, offset: usize) -> Result<(Vec<TaskSummary>, usize), ServiceError> {
        let page = self.store.list(limit, offset).await?;
        Ok((page.records.iter().map(TaskSummary::from).collect(), page.total))
    }

    /// Static capability/config description surfaced to CLI/API clients
    /// (concurrency bound and current utilization, not an agent roster —
    /// this process runs exactly one agent configuration at a time).
    pub fn agent_info(&self) -> serde_json::Value {
        serde_json::json!({
            "max_concurrent": self.config.concurrency.max_concurrent,
            "active_tasks": self.metrics.active_tasks(),
            "storage_backend": self.config.storage.backend,
        })
    }

    /// Provision a sandbox up front, outside of `submit`, for callers that
    /// want to reuse one sandbox across several tasks.
    pub async fn create_sandbox(&self, shape: &str) -> Result<String, ServiceError> {
        let sandbox_id = self.backend.create_sandbox(shape).await?;
        self.metrics.record_sandbox_created(shape);
        Ok(sandbox_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::config::ReflectorConfig;
    use crate::tools::ScriptedToolInvoker;
    use crate::tools::ToolInvoker;

    fn test_manager(max_concurrent: usize) -> (TaskManager, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.concurrency.max_concurrent = max_concurrent;
        config.workspace.log_dir = tmp.path().to_path_buf();
        config.event_bus.linger_seconds = 0;

        let store: Arc<dyn taskstore::StoreBackend<Task>> = Arc::new(taskstore::MemoryStore::<Task>::new());
        let backend: Arc<dyn Backend> = Arc::new(MockBackend::always_ok());
        let invoker: Arc<dyn ToolInvoker> = Arc::new(ScriptedToolInvoker::new());
        let planner = Arc::new(Planner::new(invoker.clone()));
        let worker = Arc::new(Worker::new(invoker.clone()));
        let reflector = Arc::new(Reflector::new(invoker, &ReflectorConfig::default()));
        let metrics = Arc::new(Metrics::new(true, max_concurrent));

        let manager = TaskManager::new(store, backend, planner, worker, reflector, config, metrics);
        (manager, tmp)
    }

    fn request(instruction: &str) -> SubmitRequest {
        SubmitRequest {
            instruction: instruction.to_string(),
            max_steps: Some(10),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn submit_and_query_reaches_completed() {
        let (manager, _tmp) = test_manager(2);
        let task_id = manager.submit(request("do the thing")).await.unwrap();

        for _ in 0..50 {
            let summary = manager.query(&task_id).await.unwrap();
            if summary.status.is_terminal() {
                assert_eq!(summary.status, TaskStatus::Completed);
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("task did not reach a terminal state in time");
    }

    #[tokio::test]
    async fn admission_rejects_beyond_max_concurrent() {
        let invoker = Arc::new(ScriptedToolInvoker::new());
        for _ in 0..100 {
            invoker.script(crate::tools::ToolName::ActionGenerator, "wait(1)").await;
        }
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.concurrency.max_concurrent = 2;
        config.workspace.log_dir = tmp.path().to_path_buf();

        let store: Arc<dyn taskstore::StoreBackend<Task>> = Arc::new(taskstore::MemoryStore::<Task>::new());
        let backend: Arc<dyn Backend> = Arc::new(MockBackend::always_ok());
        let invoker: Arc<dyn ToolInvoker> = invoker;
        let planner = Arc::new(Planner::new(invoker.clone()));
        let worker = Arc::new(Worker::new(invoker.clone()));
        let reflector = Arc::new(Reflector::new(invoker, &ReflectorConfig::default()));
        let metrics = Arc::new(Metrics::new(true, 2));
        let manager = TaskManager::new(store, backend, planner, worker, reflector, config, metrics);

        manager.submit(request("first")).await.unwrap();
        manager.submit(request("second")).await.unwrap();
        let third = manager.submit(request("third")).await;
        assert!(matches!(third, Err(ServiceError::Unavailable(_))));
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let invoker = Arc::new(ScriptedToolInvoker::new());
        for _ in 0..100 {
            invoker.script(crate::tools::ToolName::ActionGenerator, "wait(1)").await;
        }
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.workspace.log_dir = tmp.path().to_path_buf();
        let store: Arc<dyn taskstore::StoreBackend<Task>> = Arc::new(taskstore::MemoryStore::<Task>::new());
        let backend: Arc<dyn Backend> = Arc::new(MockBackend::always_ok());
        let invoker: Arc<dyn ToolInvoker> = invoker;
        let planner = Arc::new(Planner::new(invoker.clone()));
        let worker = Arc::new(Worker::new(invoker.clone()));
        let reflector = Arc::new(Reflector::new(invoker, &ReflectorConfig::default()));
        let metrics = Arc::new(Metrics::new(true, 5));
        let manager = TaskManager::new(store, backend, planner, worker, reflector, config, metrics);

        let task_id = manager.submit(request("long running")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(manager.cancel(&task_id).await.unwrap());
        assert!(!manager.cancel(&task_id).await.unwrap());
    }

    #[tokio::test]
    async fn continue_context_with_unknown_previous_task_is_validation_error() {
        let (manager, _tmp) = test_manager(2);
        let req = SubmitRequest {
            continue_context: true,
            previous_task_id: Some("does-not-exist".to_string()),
            ..request("resume")
        };
        let err = manager.submit(req).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn list_reflects_submitted_tasks() {
        let (manager, _tmp) = test_manager(2);
        manager.submit(request("alpha")).await.unwrap();
        manager.submit(request("beta")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let (summaries, total) = manager.list(10, 0).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(summaries.len(), 2);
    }
}
