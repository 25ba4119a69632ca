//! Evaluates in-progress execution quality (spec §4.8). A rule-based fast
//! path precedes any LLM call, mirroring the teacher's layered-checks style
//! (`coordinator`'s health checks run fast local checks before escalating to
//! a remote call). Screenshot similarity uses `blake3` (not a teacher
//! dependency — grounded in the pack's `ck` chunk-hashing example, which
//! reaches for the same crate for the same "cheap content fingerprint"
//! role) rather than `std::hash`, which isn't guaranteed stable across
//! process runs for byte content of this size.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ReflectorConfig;
use crate::domain::{ActionRecord, QualityRecommendation, QualityReport};
use crate::error::ServiceError;
use crate::tools::{ToolInvoker, ToolName, invoke_with_retry};

pub struct ReflectContext<'a> {
    pub subtask_name: &'a str,
    pub steps_on_current_subtask: u32,
    pub recent_actions: &'a [ActionRecord],
    pub current_screenshot: &'a [u8],
    pub recent_screenshot_hashes: &'a [blake3::Hash],
    pub step_count: u32,
}

pub struct Reflector {
    tool_invoker: Arc<dyn ToolInvoker>,
    every_k_steps: u32,
    identical_action_threshold: u32,
    stalled_subtask_threshold: u32,
    unchanged_screenshot_threshold: u32,
}

impl Reflector {
    pub fn new(tool_invoker: Arc<dyn ToolInvoker>, config: &ReflectorConfig) -> Self {
        Self {
            tool_invoker,
            every_k_steps: config.every_k_steps,
            identical_action_threshold: config.identical_action_threshold,
            stalled_subtask_threshold: config.stalled_subtask_threshold,
            unchanged_screenshot_threshold: config.unchanged_screenshot_threshold,
        }
    }

    pub async fn reflect(
        &self,
        ctx: &ReflectContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<QualityReport, ServiceError> {
        if let Some(report) = self.rule_based_fast_path(ctx) {
            debug!(subtask = ctx.subtask_name, "Reflector: rule-based fast path fired");
            return Ok(report);
        }

        if self.every_k_steps > 0 && ctx.step_count % self.every_k_steps == 0 {
            return self.llm_judgment(ctx, cancel).await;
        }

        Ok(QualityReport::good())
    }

    fn rule_based_fast_path(&self, ctx: &ReflectContext<'_>) -> Option<QualityReport> {
        if identical_tail(ctx.recent_actions, self.identical_action_threshold) {
            return Some(QualityReport::concerning(
                QualityRecommendation::Adjust,
                format!(
                    "last {} actions were identical",
                    self.identical_action_threshold
                ),
            ));
        }

        if ctx.steps_on_current_subtask > self.stalled_subtask_threshold {
            return Some(QualityReport::concerning(
                QualityRecommendation::Replan,
                format!(
                    "{} steps spent on subtask '{}' without completion",
                    ctx.steps_on_current_subtask, ctx.subtask_name
                ),
            ));
        }

        if unchanged_tail(ctx.recent_screenshot_hashes, self.unchanged_screenshot_threshold) {
            return Some(QualityReport::concerning(
                QualityRecommendation::Adjust,
                format!(
                    "screenshot unchanged for {} consecutive steps",
                    self.unchanged_screenshot_threshold
                ),
            ));
        }

        None
    }

    async fn llm_judgment(
        &self,
        ctx: &ReflectContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<QualityReport, ServiceError> {
        let summary = ctx
            .recent_actions
            .iter()
            .map(|a| format!("step {}: {} ({})", a.step, a.action.verb(), a.description))
            .collect::<Vec<_>>()
            .join("\n");
        let message = format!(
            "Subtask: {}\nRecent actions:\n{}",
            ctx.subtask_name, summary
        );

        let invocation = invoke_with_retry(|| {
            self.tool_invoker
                .invoke(ToolName::TrajReflector, &message, Some(ctx.current_screenshot.to_vec()), cancel)
        })
        .await?;

        Ok(parse_quality_report(&invocation.text))
    }
}

/// Compares the last `threshold` actions by their serialized form; returns
/// true only if there are at least `threshold` and they're all identical.
fn identical_tail(actions: &[ActionRecord], threshold: u32) -> bool {
    let threshold = threshold as usize;
    if threshold == 0 || actions.len() < threshold {
        return false;
    }
    let tail = &actions[actions.len() - threshold..];
    let first = serde_json::to_string(&tail[0].action).unwrap_or_default();
    tail.iter()
        .all(|a| serde_json::to_string(&a.action).unwrap_or_default() == first)
}

fn unchanged_tail(hashes: &[blake3::Hash], threshold: u32) -> bool {
    let threshold = threshold as usize;
    if threshold == 0 || hashes.len() < threshold {
        return false;
    }
    let tail = &hashes[hashes.len() - threshold..];
    tail.windows(2).all(|pair| pair[0] == pair[1])
}

/// Best-effort parse of the trajectory reflector's free-form judgment.
/// Falls back to `good` if the tool didn't signal a problem explicitly —
/// erring toward letting the dispatcher continue rather than replanning on
/// an ambiguous LLM response.
fn parse_quality_report(text: &str) -> QualityReport {
    let lower = text.to_ascii_lowercase();
    if lower.contains("replan") {
        QualityReport::concerning(QualityRecommendation::Replan, text.to_string())
    } else if lower.contains("adjust") || lower.contains("concerning") || lower.contains("stuck") {
        QualityReport::concerning(QualityRecommendation::Adjust, text.to_string())
    } else {
        QualityReport::good()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BackendAction;

    fn action(step: u32, action: BackendAction) -> ActionRecord {
        ActionRecord {
            step,
            timestamp: 0,
            subtask_name: "s".to_string(),
            description: "d".to_string(),
            action,
            success: true,
            screenshot_path: None,
        }
    }

    #[test]
    fn identical_tail_detects_three_repeats() {
        let actions = vec![
            action(1, BackendAction::Wait { seconds: 1.0 }),
            action(2, BackendAction::Wait { seconds: 1.0 }),
            action(3, BackendAction::Wait { seconds: 1.0 }),
        ];
        assert!(identical_tail(&actions, 3));
    }

    #[test]
    fn identical_tail_ignores_distinct_actions() {
        let actions = vec![
            action(1, BackendAction::Wait { seconds: 1.0 }),
            action(2, BackendAction::Wait { seconds: 2.0 }),
            action(3, BackendAction::Wait { seconds: 1.0 }),
        ];
        assert!(!identical_tail(&actions, 3));
    }

    #[test]
    fn unchanged_tail_detects_stable_hash_run() {
        let h = blake3::hash(b"same");
        let hashes = vec![h, h, h];
        assert!(unchanged_tail(&hashes, 3));
    }

    #[test]
    fn unchanged_tail_rejects_changing_hashes() {
        let hashes = vec![blake3::hash(b"a"), blake3::hash(b"b"), blake3::hash(b"c")];
        assert!(!unchanged_tail(&hashes, 3));
    }

    #[test]
    fn parse_quality_report_detects_replan_keyword() {
        let report = parse_quality_report("The agent seems stuck; recommend replan.");
        assert!(report.should_replan());
    }

    #[test]
    fn parse_quality_report_defaults_to_good() {
        let report = parse_quality_report("Progress looks on track.");
        assert_eq!(report.status, crate::domain::QualityStatus::Good);
    }
}
