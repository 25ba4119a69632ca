//! Single-call interface that executes a named "tool" (spec §4.5): planner,
//! actor, grounder, reflector, etc. Grounded on the teacher's `LlmClient`
//! trait + `AnthropicClient` (`async_trait`, `reqwest`, retry-on-transient).

mod anthropic;
mod prompts;
mod ratelimit;
mod scripted;

pub use anthropic::AnthropicToolInvoker;
pub use prompts::PromptLoader;
pub use ratelimit::RateLimiter;
pub use scripted::ScriptedToolInvoker;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// The closed set of tool names (spec §6). `ToolInvoker::invoke` dispatches
/// on this rather than an open string so unknown tool names are a compile
/// error, not a runtime surprise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    WebSearch,
    ContextFusion,
    SubtaskPlanner,
    TrajReflector,
    MemoryRetrieval,
    Grounding,
    Evaluator,
    ActionGenerator,
    ActionGeneratorWithTakeover,
    FastActionGenerator,
    FastActionGeneratorWithTakeover,
    DagTranslator,
    Embedding,
    QueryFormulator,
    NarrativeSummarization,
    TextSpan,
    EpisodeSummarization,
}

impl ToolName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::WebSearch => "web_search",
            ToolName::ContextFusion => "context_fusion",
            ToolName::SubtaskPlanner => "subtask_planner",
            ToolName::TrajReflector => "traj_reflector",
            ToolName::MemoryRetrieval => "memory_retrieval",
            ToolName::Grounding => "grounding",
            ToolName::Evaluator => "evaluator",
            ToolName::ActionGenerator => "action_generator",
            ToolName::ActionGeneratorWithTakeover => "action_generator_with_takeover",
            ToolName::FastActionGenerator => "fast_action_generator",
            ToolName::FastActionGeneratorWithTakeover => "fast_action_generator_with_takeover",
            ToolName::DagTranslator => "dag_translator",
            ToolName::Embedding => "embedding",
            ToolName::QueryFormulator => "query_formulator",
            ToolName::NarrativeSummarization => "narrative_summarization",
            ToolName::TextSpan => "text_span",
            ToolName::EpisodeSummarization => "episode_summarization",
        }
    }
}

impl std::fmt::Display for ToolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error kind carried by [`ToolError`]; callers branch on `retryable`
/// rather than the kind directly (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolErrorKind {
    RateLimited,
    Network,
    InvalidResponse,
    Timeout,
    BudgetExhausted,
}

#[derive(Debug, Error)]
#[error("tool error ({kind:?}): {message}")]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
        }
    }
}

/// One invocation's outcome: text plus the token/cost accounting the
/// calling Dispatcher feeds into [`crate::metrics::Metrics`] and
/// `Task.stats`.
#[derive(Debug, Clone, Default)]
pub struct ToolInvocation {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

/// Max retries for a retryable [`ToolError`] (spec §4.5: "up to 2x").
pub const MAX_TOOL_RETRIES: u32 = 2;
pub const TOOL_RETRY_BACKOFFS: [Duration; 2] = [Duration::from_millis(500), Duration::from_secs(2)];

/// Per-call timeout for tool invocations (spec §5: 120s default).
pub const TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(120);

#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Invoke `tool` with `text` plus optional image bytes, honoring
    /// `cancel`. Implementations enforce per-tool rate limiting (sleeping
    /// the caller, not erroring) and record token/cost metrics themselves.
    async fn invoke(
        &self,
        tool: ToolName,
        text: &str,
        image: Option<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> Result<ToolInvocation, ToolError>;
}

/// Retries `f` up to [`MAX_TOOL_RETRIES`] times on a retryable
/// [`ToolError`], backing off per [`TOOL_RETRY_BACKOFFS`]. Callers (Planner,
/// Worker, Reflector) share this instead of re-implementing the loop.
pub async fn invoke_with_retry<F, Fut>(mut f: F) -> Result<ToolInvocation, ToolError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<ToolInvocation, ToolError>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(invocation) => return Ok(invocation),
            Err(err) if err.retryable && (attempt as usize) < TOOL_RETRY_BACKOFFS.len() => {
                tokio::time::sleep(TOOL_RETRY_BACKOFFS[attempt as usize]).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_name_round_trips_through_str() {
        assert_eq!(ToolName::Grounding.as_str(), "grounding");
        assert_eq!(ToolName::DagTranslator.to_string(), "dag_translator");
    }

    #[tokio::test]
    async fn invoke_with_retry_stops_on_non_retryable() {
        let mut calls = 0;
        let result = invoke_with_retry(|| {
            calls += 1;
            async { Err::<ToolInvocation, _>(ToolError::new(ToolErrorKind::InvalidResponse, "bad", false)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn invoke_with_retry_exhausts_then_fails() {
        let mut calls = 0;
        let result = invoke_with_retry(|| {
            calls += 1;
            async { Err::<ToolInvocation, _>(ToolError::new(ToolErrorKind::Network, "down", true)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }
}
