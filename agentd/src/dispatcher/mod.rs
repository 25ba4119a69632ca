//! The per-task state machine (spec §4.9): `Init -> Planning -> Executing ->
//! (Reflecting?) -> (Executing | Replanning | Terminal)`.
//!
//! Grounded on the teacher's `LoopEngine::run`/`run_iteration` control loop
//! (iterate until a terminal `IterationResult`, polling a cancellation signal
//! every iteration) but driving Planner -> Worker -> Backend -> Reflector
//! instead of an LLM-tool-call loop. One `Dispatcher` is constructed per
//! admitted task and owns that task's mutable state exclusively for the
//! duration of its `run` — the Task Manager only ever reads it, through the
//! same `Arc<RwLock<Task>>`, while this runs.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::config::ScreenConfig;
use crate::domain::{ActionRecord, BackendAction, Plan, Stage, StageEvent, Subtask, Task, TaskStatus};
use crate::error::ServiceError;
use crate::eventbus::EventBus;
use crate::metrics::Metrics;
use crate::planner::Planner;
use crate::reflector::{ReflectContext, Reflector};
use crate::worker::{Worker, WorkerContext};
use crate::workspace::Workspace;

/// Recent-history window fed to the Reflector (spec §4.8: "last 5 actions").
const HISTORY_WINDOW: usize = 5;

pub struct Dispatcher {
    task: Arc<RwLock<Task>>,
    workspace: Arc<Workspace>,
    bus: EventBus,
    cancel: CancellationToken,
    backend: Arc<dyn Backend>,
    planner: Arc<Planner>,
    worker: Arc<Worker>,
    reflector: Arc<Reflector>,
    store: Arc<dyn taskstore::StoreBackend<Task>>,
    metrics: Arc<Metrics>,
    screen: ScreenConfig,
    enable_takeover: bool,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task: Arc<RwLock<Task>>,
        workspace: Arc<Workspace>,
        bus: EventBus,
        cancel: CancellationToken,
        backend: Arc<dyn Backend>,
        planner: Arc<Planner>,
        worker: Arc<Worker>,
        reflector: Arc<Reflector>,
        store: Arc<dyn taskstore::StoreBackend<Task>>,
        metrics: Arc<Metrics>,
        screen: ScreenConfig,
        enable_takeover: bool,
    ) -> Self {
        Self {
            task,
            workspace,
            bus,
            cancel,
            backend,
            planner,
            worker,
            reflector,
            store,
            metrics,
            screen,
            enable_takeover,
        }
    }

    /// Drive the task from `Pending` to a terminal status, publishing one
    /// [`StageEvent`] and mirroring the `Task` to the store at every
    /// transition (spec §4.9). Never panics on a component failure — every
    /// error path ends the task as `Failed` instead.
    pub async fn run(self) {
        if self.cancel.is_cancelled() {
            self.finish(TaskStatus::Cancelled, Stage::Cancelled, "cancelled before execution started")
                .await;
            return;
        }

        {
            let mut guard = self.task.write().await;
            if let Err(e) = guard.transition(TaskStatus::Running) {
                warn!(error = %e, "Dispatcher: unexpected transition failure at start");
                return;
            }
        }
        self.mirror_and_publish(Stage::Starting, "task admitted, entering planning").await;

        let instruction = { self.task.read().await.instruction.clone() };
        let max_steps = { self.task.read().await.max_steps };

        self.publish_stage(Stage::Planning, "generating initial plan").await;
        let observation = self.screenshot_opt().await;
        let mut plan = match self.planner.initial_plan(&instruction, observation, None, &self.cancel).await {
            Ok(result) => {
                if let Some(warning) = &result.warning {
                    self.publish_stage(Stage::Planning, warning.clone()).await;
                }
                Plan::new(result.subtasks)
            }
            Err(e) => {
                self.finish_with_error(e, "initial planning failed").await;
                return;
            }
        };
        let _ = self.workspace.write_state("plan.json", &plan);

        let mut current: Option<Subtask> = None;
        let mut steps_on_current_subtask: u32 = 0;
        let mut step_count: u32 = { self.task.read().await.stats.steps };
        let mut recent_actions: VecDeque<ActionRecord> = VecDeque::with_capacity(HISTORY_WINDOW + 1);
        let mut recent_hashes: VecDeque<blake3::Hash> = VecDeque::with_capacity(HISTORY_WINDOW + 1);

        loop {
            if self.cancel.is_cancelled() {
                self.finish(TaskStatus::Cancelled, Stage::Cancelled, "cancelled mid-execution").await;
                return;
            }

            if current.is_none() {
                current = plan.pop_front();
                let Some(_) = &current else {
                    let _ = self.workspace.write_state("plan.json", &plan);
                    self.finish(TaskStatus::Completed, Stage::Finished, "all subtasks completed").await;
                    return;
                };
                steps_on_current_subtask = 0;
            }
            let subtask = current.clone().expect("checked above");

            self.publish_stage(Stage::Executing, format!("working on '{}'", subtask.name)).await;

            let screenshot = match self.screenshot_bytes().await {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.finish_with_error(e, "screenshot capture failed").await;
                    return;
                }
            };
            push_bounded(&mut recent_hashes, blake3::hash(&screenshot), HISTORY_WINDOW);
            let (width, height) = self.effective_bounds(&screenshot);

            let future_names: Vec<String> = plan.remaining.iter().map(|s| s.name.clone()).collect();
            let completed_names: Vec<String> = plan.completed.iter().map(|s| s.name.clone()).collect();
            let mode = { self.task.read().await.mode };
            let worker_ctx = WorkerContext {
                subtask: &subtask,
                future_subtask_names: &future_names,
                completed_subtask_names: &completed_names,
                instruction: &instruction,
                reflection: None,
                screenshot: screenshot.clone(),
                screenshot_width: width,
                screenshot_height: height,
                mode,
                enable_takeover: self.enable_takeover,
            };

            let step = match self.worker.next_action(&worker_ctx, &self.cancel).await {
                Ok(step) => step,
                Err(e) => {
                    self.finish_with_error(e, "worker failed to produce an action").await;
                    return;
                }
            };
            if step.grounding_failed {
                warn!(subtask = %subtask.name, "Dispatcher: grounding failed this step, worker fell back to wait");
            }

            match step.action {
                BackendAction::Done { return_value } => {
                    plan.mark_completed(subtask.clone());
                    step_count += 1;
                    if let Some(message) = return_value {
                        self.task.write().await.final_message = Some(message);
                    }
                    current = None;
                    let _ = self.workspace.write_state("plan.json", &plan);
                    {
                        let mut guard = self.task.write().await;
                        guard.stats.steps = step_count;
                        guard.updated_at = taskstore::now_ms();
                    }
                    self.metrics.observe_task_steps(step_count);
                    if let Err(e) = self.persist_current().await {
                        warn!(error = %e, "Dispatcher: failed to mirror step progress to store");
                    }
                }
                BackendAction::Fail => {
                    plan.mark_failed(subtask.clone());
                    current = None;
                    self.publish_stage(Stage::Replanning, format!("subtask '{}' failed, replanning", subtask.name))
                        .await;
                    if let Err(e) = self.replan(&mut plan, &instruction, &screenshot).await {
                        self.finish_with_error(e, "replanning failed after subtask failure").await;
                        return;
                    }
                }
                action => {
                    let result = match self.backend.execute(&action, &self.cancel).await {
                        Ok(r) => r,
                        Err(e) => {
                            self.finish_with_error(e.into(), "backend action failed").await;
                            return;
                        }
                    };
                    step_count += 1;
                    steps_on_current_subtask += 1;

                    let record = ActionRecord {
                        step: step_count,
                        timestamp: taskstore::now_ms(),
                        subtask_name: subtask.name.clone(),
                        description: step.description.clone(),
                        action: action.clone(),
                        success: result.success,
                        screenshot_path: self
                            .workspace
                            .save_screenshot(&screenshot)
                            .ok()
                            .map(|p| p.display().to_string()),
                    };
                    let _ = self.workspace.append_jsonl("actions.jsonl", &record);
                    push_bounded(&mut recent_actions, record, HISTORY_WINDOW);

                    {
                        let mut guard = self.task.write().await;
                        guard.stats.steps = step_count;
                        guard.updated_at = taskstore::now_ms();
                    }
                    self.metrics.observe_task_steps(step_count);
                    if let Err(e) = self.persist_current().await {
                        warn!(error = %e, "Dispatcher: failed to mirror step progress to store");
                    }

                    if step_count >= max_steps {
                        self.finish(TaskStatus::Failed, Stage::Failed, "step budget exhausted").await;
                        return;
                    }

                    let actions_vec: Vec<ActionRecord> = recent_actions.iter().cloned().collect();
                    let hashes_vec: Vec<blake3::Hash> = recent_hashes.iter().copied().collect();
                    let reflect_ctx = ReflectContext {
                        subtask_name: &subtask.name,
                        steps_on_current_subtask,
                        recent_actions: &actions_vec,
                        current_screenshot: &screenshot,
                        recent_screenshot_hashes: &hashes_vec,
                        step_count,
                    };
                    let report = match self.reflector.reflect(&reflect_ctx, &self.cancel).await {
                        Ok(report) => report,
                        Err(e) => {
                            self.finish_with_error(e, "reflection failed").await;
                            return;
                        }
                    };
                    let _ = self.workspace.append_jsonl("reflections.jsonl", &report);
                    if report.should_replan() {
                        self.publish_stage(Stage::Reflecting, format!("evaluating progress on '{}'", subtask.name))
                            .await;
                        plan.mark_failed(subtask.clone());
                        current = None;
                        self.publish_stage(Stage::Replanning, report.issues.join("; ")).await;
                        if let Err(e) = self.replan(&mut plan, &instruction, &screenshot).await {
                            self.finish_with_error(e, "replanning failed after reflector recommendation").await;
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn replan(&self, plan: &mut Plan, instruction: &str, observation: &[u8]) -> Result<(), ServiceError> {
        let result = self
            .planner
            .replan(
                instruction,
                Some(observation.to_vec()),
                &plan.completed,
                &plan.failed,
                &plan.remaining,
                &self.cancel,
            )
            .await?;
        if let Some(warning) = &result.warning {
            self.publish_stage(Stage::Replanning, warning.clone()).await;
        }
        plan.replan(result.subtasks);
        let _ = self.workspace.write_state("plan.json", plan);
        Ok(())
    }

    async fn screenshot_bytes(&self) -> Result<Vec<u8>, ServiceError> {
        let result = self.backend.execute(&BackendAction::Screenshot, &self.cancel).await?;
        Ok(result.observation.unwrap_or_default())
    }

    async fn screenshot_opt(&self) -> Option<Vec<u8>> {
        self.screenshot_bytes().await.ok()
    }

    /// Resolves the screenshot's actual pixel bounds if it's a well-formed
    /// PNG, falling back to the declared platform size and, in strict mode,
    /// warning loudly on a mismatch (Open Question #2).
    fn effective_bounds(&self, screenshot: &[u8]) -> (i32, i32) {
        match png_dimensions(screenshot) {
            Some((w, h)) if w != self.screen.declared_width || h != self.screen.declared_height => {
                if self.screen.strict_bounds {
                    warn!(
                        actual_w = w,
                        actual_h = h,
                        declared_w = self.screen.declared_width,
                        declared_h = self.screen.declared_height,
                        "Dispatcher: screenshot dimensions mismatch declared platform size"
                    );
                } else {
                    debug!(actual_w = w, actual_h = h, "Dispatcher: using actual screenshot dimensions for grounding bounds");
                }
                (w, h)
            }
            Some((w, h)) => (w, h),
            None => (self.screen.declared_width, self.screen.declared_height),
        }
    }

    async fn publish_stage(&self, stage: Stage, message: impl Into<String>) {
        let task_id = self.task.read().await.task_id.clone();
        self.bus.publish(StageEvent::new(task_id, stage, message)).await;
    }

    async fn persist_current(&self) -> Result<(), ServiceError> {
        let snapshot = self.task.read().await.clone();
        self.store.update(snapshot).await?;
        Ok(())
    }

    async fn mirror_and_publish(&self, stage: Stage, message: impl Into<String>) {
        if let Err(e) = self.persist_current().await {
            warn!(error = %e, "Dispatcher: failed to mirror task state to store");
        }
        self.publish_stage(stage, message).await;
    }

    /// Transition to a terminal status, release the sandbox if requested,
    /// write `termination.json`, record metrics, and publish/persist the
    /// final state. A no-op if the task already reached a terminal status
    /// (idempotent against a racing cancel that lands after completion).
    async fn finish(&self, status: TaskStatus, stage: Stage, message: impl Into<String>) {
        let message = message.into();
        let (sandbox_id, destroy_sandbox_on_exit) = {
            let mut guard = self.task.write().await;
            if guard.transition(status).is_err() {
                return;
            }
            (guard.sandbox_id.clone(), guard.destroy_sandbox_on_exit)
        };

        if destroy_sandbox_on_exit {
            if let Some(sandbox_id) = sandbox_id {
                if let Err(e) = self.backend.release_sandbox(&sandbox_id).await {
                    warn!(sandbox_id, error = %e, "Dispatcher: release_sandbox failed");
                }
            }
        }

        let _ = self.workspace.write_state(
            "termination.json",
            &serde_json::json!({ "status": status.to_string(), "message": message }),
        );
        self.metrics.record_task_created(&status.to_string());
        self.publish_stage(stage, message).await;
        if let Err(e) = self.persist_current().await {
            warn!(error = %e, "Dispatcher: failed to persist terminal task state");
        }
    }

    async fn finish_with_error(&self, err: ServiceError, context: &str) {
        warn!(error = %err, context, "Dispatcher: task ending in failure");
        let message = format!("{context}: {err}");
        self.finish(TaskStatus::Failed, Stage::Failed, message).await;
    }
}

fn push_bounded<T>(deque: &mut VecDeque<T>, value: T, cap: usize) {
    deque.push_back(value);
    while deque.len() > cap {
        deque.pop_front();
    }
}

/// Reads `width`/`height` out of a PNG's `IHDR` chunk. Returns `None` for
/// anything that isn't a well-formed PNG header (the synthetic/mock
/// backends in tests don't always bother producing valid image bytes).
fn png_dimensions(bytes: &[u8]) -> Option<(i32, i32)> {
    const SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
    if bytes.len() < 24 || bytes[0..8] != SIGNATURE || &bytes[12..16] != b"IHDR" {
        return None;
    }
    let width = i32::from_be_bytes(bytes[16..20].try_into().ok()?);
    let height = i32::from_be_bytes(bytes[20..24].try_into().ok()?);
    Some((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::config::ReflectorConfig;
    use crate::tools::{ScriptedToolInvoker, ToolInvoker, ToolName};

    fn test_task(max_steps: u32) -> Task {
        let mut task = Task::new("open the calculator and compute 2+2");
        task.max_steps = max_steps;
        task
    }

    struct Harness {
        task: Arc<RwLock<Task>>,
        store: Arc<taskstore::MemoryStore<Task>>,
        bus: EventBus,
        _tmp: tempfile::TempDir,
    }

    fn build(
        task: Task,
        backend: Arc<dyn Backend>,
        invoker: Arc<dyn ToolInvoker>,
        cancel: CancellationToken,
    ) -> (Dispatcher, Harness) {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = Arc::new(Workspace::create(tmp.path(), &task.task_id).unwrap());
        let store = Arc::new(taskstore::MemoryStore::<Task>::new());
        let bus = EventBus::new(task.task_id.clone(), 32, 64);
        let planner = Arc::new(Planner::new(invoker.clone()));
        let worker = Arc::new(Worker::new(invoker.clone()));
        let reflector = Arc::new(Reflector::new(invoker, &ReflectorConfig::default()));
        let metrics = Arc::new(Metrics::disabled());
        let task_arc = Arc::new(RwLock::new(task.clone()));
        futures::executor::block_on(store.create(task.clone())).unwrap();
        let dispatcher = Dispatcher::new(
            task_arc.clone(),
            workspace,
            bus.clone(),
            cancel,
            backend,
            planner,
            worker,
            reflector,
            store.clone(),
            metrics,
            ScreenConfig::default(),
            false,
        );
        (
            dispatcher,
            Harness {
                task: task_arc,
                bus,
                store,
                _tmp: tmp,
            },
        )
    }

    #[tokio::test]
    async fn happy_path_completes_task() {
        let invoker: Arc<dyn ToolInvoker> = Arc::new(ScriptedToolInvoker::new());
        let backend: Arc<dyn Backend> = Arc::new(MockBackend::always_ok());
        let (dispatcher, harness) = build(test_task(10), backend, invoker, CancellationToken::new());
        dispatcher.run().await;

        let task = harness.task.read().await.clone();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.final_message.as_deref(), Some("finished"));

        let stored = harness.store.get(&task.task_id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
    }

    /// Spec §8 S1: one subtask, `click(...)` then `done()`. Exactly the
    /// five listed stages in order (no `reflecting` — nothing here ever
    /// recommends a replan) and `stats.steps = 2` (one step per
    /// worker-produced action, `done()` included).
    #[tokio::test]
    async fn s1_happy_path_single_subtask_matches_spec_event_sequence() {
        let invoker = Arc::new(ScriptedToolInvoker::new());
        invoker
            .script(ToolName::SubtaskPlanner, "1. OpenCalculator: click dock icon")
            .await;
        invoker
            .script(ToolName::DagTranslator, r#"{"nodes":["OpenCalculator"],"edges":[]}"#)
            .await;
        invoker.script(ToolName::ActionGenerator, "click(\"the dock icon\", 1, \"left\")").await;
        invoker.script(ToolName::ActionGenerator, "done(\"finished\")").await;
        let invoker: Arc<dyn ToolInvoker> = invoker;
        let backend: Arc<dyn Backend> = Arc::new(MockBackend::always_ok());
        let (dispatcher, harness) = build(test_task(10), backend, invoker, CancellationToken::new());

        let subscription = harness.bus.subscribe().await;
        let handle = tokio::spawn(dispatcher.run());

        let mut stages = Vec::new();
        while let Some(event) = subscription.recv().await {
            let terminal = event.stage.is_terminal();
            stages.push(event.stage);
            if terminal {
                break;
            }
        }
        handle.await.unwrap();

        assert_eq!(
            stages,
            vec![Stage::Starting, Stage::Planning, Stage::Executing, Stage::Executing, Stage::Finished]
        );

        let task = harness.task.read().await.clone();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.stats.steps, 2);
    }

    #[tokio::test]
    async fn cancellation_before_start_skips_running() {
        let invoker: Arc<dyn ToolInvoker> = Arc::new(ScriptedToolInvoker::new());
        let backend: Arc<dyn Backend> = Arc::new(MockBackend::always_ok());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (dispatcher, harness) = build(test_task(10), backend, invoker, cancel);
        dispatcher.run().await;

        let task = harness.task.read().await.clone();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.started_at.is_none());
    }

    #[tokio::test]
    async fn cancellation_mid_execution_stops_the_loop() {
        let invoker = Arc::new(ScriptedToolInvoker::new());
        // Worker never finishes the subtask, so the loop would otherwise
        // run until the step budget; the cancel flips between iterations.
        for _ in 0..5 {
            invoker.script(ToolName::ActionGenerator, "wait(1)").await;
        }
        let invoker: Arc<dyn ToolInvoker> = invoker;
        let backend: Arc<dyn Backend> = Arc::new(MockBackend::always_ok());
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            cancel_clone.cancel();
        });
        let (dispatcher, harness) = build(test_task(1000), backend, invoker, cancel);
        dispatcher.run().await;

        let task = harness.task.read().await.clone();
        assert_eq!(task.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn step_budget_exhaustion_fails_the_task() {
        let invoker = Arc::new(ScriptedToolInvoker::new());
        for _ in 0..10 {
            invoker.script(ToolName::ActionGenerator, "wait(1)").await;
        }
        let invoker: Arc<dyn ToolInvoker> = invoker;
        let backend: Arc<dyn Backend> = Arc::new(MockBackend::always_ok());
        let (dispatcher, harness) = build(test_task(2), backend, invoker, CancellationToken::new());
        dispatcher.run().await;

        let task = harness.task.read().await.clone();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.stats.steps, 2);
    }

    #[tokio::test]
    async fn worker_fail_triggers_replan_and_eventual_completion() {
        let invoker = Arc::new(ScriptedToolInvoker::new());
        invoker.script(ToolName::SubtaskPlanner, "1. step_one: try the first approach").await;
        invoker
            .script(ToolName::DagTranslator, r#"{"nodes":["step_one"],"edges":[]}"#)
            .await;
        invoker.script(ToolName::ActionGenerator, "fail()").await;
        invoker.script(ToolName::SubtaskPlanner, "1. step_two: recover and finish").await;
        invoker
            .script(ToolName::DagTranslator, r#"{"nodes":["step_two"],"edges":[]}"#)
            .await;
        invoker.script(ToolName::ActionGenerator, "done(\"recovered\")").await;
        let invoker: Arc<dyn ToolInvoker> = invoker;
        let backend: Arc<dyn Backend> = Arc::new(MockBackend::always_ok());
        let (dispatcher, harness) = build(test_task(20), backend, invoker, CancellationToken::new());
        dispatcher.run().await;

        let task = harness.task.read().await.clone();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.final_message.as_deref(), Some("recovered"));
    }

    #[test]
    fn png_dimensions_reads_ihdr_width_and_height() {
        // Synthetic 1x1 PNG matching `LocalNullBackend::SYNTHETIC_PNG`.
        let bytes: &[u8] = &[
            0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52, 0x00,
            0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x02, 0x00, 0x00, 0x00, 0x90, 0x77, 0x53, 0xDE,
        ];
        assert_eq!(png_dimensions(bytes), Some((1, 1)));
    }

    #[test]
    fn png_dimensions_rejects_non_png_bytes() {
        assert_eq!(png_dimensions(b"not a png"), None);
    }
}
