//! The `Task` record: the root entity the rest of the engine revolves
//! around. Persisted through [`taskstore::StoreBackend`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use taskstore::{IndexValue, Record, now_ms};
use uuid::Uuid;

/// Lifecycle status. Transitions are enforced by [`Task::transition`], not by
/// callers mutating `status` directly — see the invariant in spec §3: no
/// reverse transition, no skip of `Running` except `Pending -> Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Execution speed/quality tradeoff requested for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    #[default]
    Normal,
    Fast,
}

/// Target platform the backend drives actions against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Linux,
    Windows,
    Macos,
    Android,
}

/// Token/cost accounting accumulated over a task's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskStats {
    pub steps: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub currency: String,
}

/// An error attempting an invalid [`TaskStatus`] transition.
#[derive(Debug, thiserror::Error)]
#[error("cannot transition task {task_id} from {from} to {to}")]
pub struct InvalidTransition {
    pub task_id: String,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// The root entity: one natural-language instruction, its admission
/// parameters, and the accumulated outcome of running it.
///
/// `task_id` is the canonical UUID v4 string. It's stored as `String` rather
/// than `Uuid` so [`Record::id`] can hand back a plain borrow — the store
/// layer is generic over any `Record` and only ever needs the id as text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub instruction: String,
    pub status: TaskStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub sandbox_id: Option<String>,
    pub destroy_sandbox_on_exit: bool,
    pub mode: TaskMode,
    pub max_steps: u32,
    pub platform: Platform,
    pub stats: TaskStats,
    pub final_message: Option<String>,
    /// Opaque LLM message history, minus images (spec §3). Appended to via
    /// `append_conversation`, never interpreted by this crate.
    pub conversation: serde_json::Value,
    pub updated_at: i64,
}

impl Task {
    pub fn new(instruction: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            task_id: Uuid::new_v4().to_string(),
            instruction: instruction.into(),
            status: TaskStatus::Pending,
            created_at: now,
            started_at: None,
            ended_at: None,
            sandbox_id: None,
            destroy_sandbox_on_exit: false,
            mode: TaskMode::Normal,
            max_steps: 50,
            platform: Platform::Linux,
            stats: TaskStats {
                currency: "USD".to_string(),
                ..Default::default()
            },
            final_message: None,
            conversation: serde_json::Value::Array(Vec::new()),
            updated_at: now,
        }
    }

    /// Validate and apply a status transition, stamping `started_at`/
    /// `ended_at` as the invariants in spec §3 require.
    pub fn transition(&mut self, to: TaskStatus) -> Result<(), InvalidTransition> {
        let allowed = match (self.status, to) {
            (TaskStatus::Pending, TaskStatus::Running) => true,
            (TaskStatus::Pending, TaskStatus::Cancelled) => true,
            (TaskStatus::Running, TaskStatus::Completed) => true,
            (TaskStatus::Running, TaskStatus::Failed) => true,
            (TaskStatus::Running, TaskStatus::Cancelled) => true,
            _ => false,
        };
        if !allowed {
            return Err(InvalidTransition {
                task_id: self.task_id.clone(),
                from: self.status,
                to,
            });
        }
        let now = now_ms();
        if to == TaskStatus::Running {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.ended_at = Some(now);
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl Record for Task {
    fn id(&self) -> &str {
        &self.task_id
    }

    fn created_at(&self) -> i64 {
        self.created_at
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "agent_tasks"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields.insert("mode".to_string(), IndexValue::String(format!("{:?}", self.mode)));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_is_pending() {
        let task = Task::new("open calculator");
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.started_at.is_none());
        assert!(task.ended_at.is_none());
    }

    #[test]
    fn pending_to_running_sets_started_at() {
        let mut task = Task::new("x");
        task.transition(TaskStatus::Running).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.started_at.is_some());
        assert!(task.ended_at.is_none());
    }

    #[test]
    fn running_to_completed_sets_ended_at() {
        let mut task = Task::new("x");
        task.transition(TaskStatus::Running).unwrap();
        task.transition(TaskStatus::Completed).unwrap();
        assert!(task.ended_at.is_some());
        assert!(task.ended_at.unwrap() >= task.started_at.unwrap());
    }

    #[test]
    fn pending_can_cancel_directly() {
        let mut task = Task::new("x");
        task.transition(TaskStatus::Cancelled).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.started_at.is_none());
        assert!(task.ended_at.is_some());
    }

    #[test]
    fn no_reverse_transition() {
        let mut task = Task::new("x");
        task.transition(TaskStatus::Running).unwrap();
        task.transition(TaskStatus::Completed).unwrap();
        let err = task.transition(TaskStatus::Running).unwrap_err();
        assert_eq!(err.from, TaskStatus::Completed);
    }

    #[test]
    fn no_skip_of_running() {
        let mut task = Task::new("x");
        let err = task.transition(TaskStatus::Completed).unwrap_err();
        assert_eq!(err.from, TaskStatus::Pending);
        assert_eq!(err.to, TaskStatus::Completed);
    }

    #[test]
    fn terminal_states_cannot_transition_again() {
        let mut task = Task::new("x");
        task.transition(TaskStatus::Cancelled).unwrap();
        assert!(task.transition(TaskStatus::Running).is_err());
        assert!(task.transition(TaskStatus::Failed).is_err());
    }

    #[test]
    fn serde_roundtrip() {
        let task = Task::new("do the thing");
        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(task.task_id, back.task_id);
        assert_eq!(task.instruction, back.instruction);
    }
}
