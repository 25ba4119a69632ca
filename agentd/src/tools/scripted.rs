//! Scriptable [`ToolInvoker`] for dispatcher/task-manager tests (spec §8
//! S1-S6), mirroring [`crate::backend::MockBackend`]'s scripted-queue shape.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{ToolError, ToolInvocation, ToolInvoker, ToolName};

/// Replays a scripted queue of text responses per [`ToolName`]. Once a
/// tool's queue is drained, falls back to a small built-in default so tests
/// don't need to script every remaining call.
#[derive(Default)]
pub struct ScriptedToolInvoker {
    responses: Mutex<HashMap<ToolName, VecDeque<String>>>,
}

impl ScriptedToolInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one response for `tool`; calls to that tool consume the queue
    /// in FIFO order before falling back to [`default_response`].
    pub async fn script(&self, tool: ToolName, text: impl Into<String>) {
        self.responses.lock().await.entry(tool).or_default().push_back(text.into());
    }
}

#[async_trait]
impl ToolInvoker for ScriptedToolInvoker {
    async fn invoke(
        &self,
        tool: ToolName,
        _text: &str,
        _image: Option<Vec<u8>>,
        _cancel: &CancellationToken,
    ) -> Result<ToolInvocation, ToolError> {
        let mut map = self.responses.lock().await;
        let text = map
            .get_mut(&tool)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| default_response(tool));
        Ok(ToolInvocation {
            text,
            input_tokens: 10,
            output_tokens: 5,
            cost: 0.0,
        })
    }
}

/// A harmless default per tool, so an unscripted call still lets a test's
/// happy path (a single subtask that completes immediately) run to
/// completion instead of hanging on an empty queue.
fn default_response(tool: ToolName) -> String {
    match tool {
        ToolName::SubtaskPlanner => "1. do_the_thing: complete the instruction".to_string(),
        ToolName::DagTranslator => r#"{"nodes":["do_the_thing"],"edges":[]}"#.to_string(),
        ToolName::ActionGenerator
        | ToolName::ActionGeneratorWithTakeover
        | ToolName::FastActionGenerator
        | ToolName::FastActionGeneratorWithTakeover => "done(\"finished\")".to_string(),
        ToolName::Grounding => "(100, 100)".to_string(),
        ToolName::TrajReflector => "progress looks on track".to_string(),
        _ => String::new(),
    }
}
