//! `StageEvent`: the streaming message the Event Bus fans out (spec §3/§4.3).

use serde::{Deserialize, Serialize};

/// Stage a [`StageEvent`] announces. The Dispatcher's state machine (spec
/// §4.9) emits one of these at every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Starting,
    Planning,
    Executing,
    Reflecting,
    Replanning,
    AwaitingUser,
    Finished,
    Failed,
    Cancelled,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Starting => "starting",
            Stage::Planning => "planning",
            Stage::Executing => "executing",
            Stage::Reflecting => "reflecting",
            Stage::Replanning => "replanning",
            Stage::AwaitingUser => "awaiting_user",
            Stage::Finished => "finished",
            Stage::Failed => "failed",
            Stage::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Finished | Stage::Failed | Stage::Cancelled)
    }
}

/// One message on a task's event stream. `seq` is assigned by the
/// [`crate::eventbus::EventBus`] and is strictly monotonic per task (spec §8
/// invariant 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    pub task_id: String,
    pub seq: u64,
    pub stage: Stage,
    pub message: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl StageEvent {
    pub fn new(task_id: impl Into<String>, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            seq: 0,
            stage,
            message: message.into(),
            timestamp: taskstore::now_ms(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}
