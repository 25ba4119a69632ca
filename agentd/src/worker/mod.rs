//! Produces the next concrete action for the current subtask (spec §4.7).
//! Grounded on the teacher's `LoopEngine::run_iteration` shape (compose
//! prompt → call model → parse → act), with "render a handlebars prompt and
//! run a tool-call loop against file tools" replaced by "compose one
//! action-generator message, parse its pseudocode action, call the
//! grounding tool for coordinates."

mod parser;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{BackendAction, MouseButton, Subtask, TaskMode};
use crate::error::ServiceError;
use crate::tools::{ToolInvoker, ToolName, invoke_with_retry};

use parser::{ArgValue, ParsedAction};

/// Everything the Worker needs to compose its action-generator message; the
/// Dispatcher assembles this fresh each step.
pub struct WorkerContext<'a> {
    pub subtask: &'a Subtask,
    pub future_subtask_names: &'a [String],
    pub completed_subtask_names: &'a [String],
    pub instruction: &'a str,
    pub reflection: Option<&'a str>,
    pub screenshot: Vec<u8>,
    pub screenshot_width: i32,
    pub screenshot_height: i32,
    pub mode: TaskMode,
    pub enable_takeover: bool,
}

#[derive(Debug, Clone)]
pub struct WorkerStep {
    pub action: BackendAction,
    pub description: String,
    /// Set when the grounding tool returned unparseable or out-of-bounds
    /// coordinates; fed to the Reflector (spec §4.7 step 3).
    pub grounding_failed: bool,
}

pub struct Worker {
    tool_invoker: Arc<dyn ToolInvoker>,
}

impl Worker {
    pub fn new(tool_invoker: Arc<dyn ToolInvoker>) -> Self {
        Self { tool_invoker }
    }

    pub async fn next_action(
        &self,
        ctx: &WorkerContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<WorkerStep, ServiceError> {
        let action_tool = match (ctx.mode, ctx.enable_takeover) {
            (TaskMode::Normal, false) => ToolName::ActionGenerator,
            (TaskMode::Normal, true) => ToolName::ActionGeneratorWithTakeover,
            (TaskMode::Fast, false) => ToolName::FastActionGenerator,
            (TaskMode::Fast, true) => ToolName::FastActionGeneratorWithTakeover,
        };

        let message = compose_action_message(ctx);
        let invocation = invoke_with_retry(|| {
            self.tool_invoker
                .invoke(action_tool, &message, Some(ctx.screenshot.clone()), cancel)
        })
        .await?;

        match parser::parse_pseudocode(&invocation.text) {
            Some(ParsedAction::Done { return_value }) => Ok(WorkerStep {
                action: BackendAction::Done { return_value },
                description: invocation.text,
                grounding_failed: false,
            }),
            Some(ParsedAction::Fail) => Ok(WorkerStep {
                action: BackendAction::Fail,
                description: invocation.text,
                grounding_failed: false,
            }),
            Some(ParsedAction::DeviceIntent { verb, args }) => {
                self.ground_and_build(&verb, &args, ctx, invocation.text, cancel).await
            }
            None => {
                warn!("Worker: action generator output had no parseable pseudocode call");
                Ok(WorkerStep {
                    action: BackendAction::Wait { seconds: 1.0 },
                    description: invocation.text,
                    grounding_failed: true,
                })
            }
        }
    }

    async fn ground_and_build(
        &self,
        verb: &str,
        args: &[parser::Arg],
        ctx: &WorkerContext<'_>,
        description: String,
        cancel: &CancellationToken,
    ) -> Result<WorkerStep, ServiceError> {
        let needs_grounding = matches!(verb, "click" | "drag" | "scroll" | "type");
        if !needs_grounding {
            return Ok(WorkerStep {
                action: build_ungrounded_action(verb, args),
                description,
                grounding_failed: false,
            });
        }

        let element_description = args
            .first()
            .and_then(|a| match &a.value {
                ArgValue::Str(s) => Some(s.clone()),
                _ => None,
            })
            .unwrap_or_default();

        let grounding_invocation = invoke_with_retry(|| {
            self.tool_invoker.invoke(
                ToolName::Grounding,
                &element_description,
                Some(ctx.screenshot.clone()),
                cancel,
            )
        })
        .await?;

        match parse_coordinates(&grounding_invocation.text, ctx.screenshot_width, ctx.screenshot_height) {
            Some(xy) => Ok(WorkerStep {
                action: build_grounded_action(verb, args, xy),
                description,
                grounding_failed: false,
            }),
            None => {
                debug!(verb, text = %grounding_invocation.text, "Worker: grounding failure, falling back to wait(1s)");
                Ok(WorkerStep {
                    action: BackendAction::Wait { seconds: 1.0 },
                    description,
                    grounding_failed: true,
                })
            }
        }
    }
}

fn compose_action_message(ctx: &WorkerContext<'_>) -> String {
    let mut message = format!(
        "Instruction: {}\nCurrent subtask: {} ({})\nFuture subtasks: {}\nCompleted subtasks: {}",
        ctx.instruction,
        ctx.subtask.name,
        ctx.subtask.info,
        ctx.future_subtask_names.join(", "),
        ctx.completed_subtask_names.join(", "),
    );
    if let Some(reflection) = ctx.reflection {
        message.push_str(&format!("\nReflection from previous step: {reflection}"));
    }
    message
}

fn build_ungrounded_action(verb: &str, args: &[parser::Arg]) -> BackendAction {
    match verb {
        "hotkey" => BackendAction::Hotkey {
            keys: args.iter().filter_map(arg_as_string).collect(),
        },
        "hold_and_press" => {
            let mid = args.len() / 2;
            BackendAction::HoldAndPress {
                hold_keys: args[..mid].iter().filter_map(arg_as_string).collect(),
                press_keys: args[mid..].iter().filter_map(arg_as_string).collect(),
            }
        }
        "open" => BackendAction::Open {
            app_or_filename: args.first().and_then(arg_as_string).unwrap_or_default(),
        },
        "switch_app" => BackendAction::SwitchApp {
            app_code: args.first().and_then(arg_as_string).unwrap_or_default(),
        },
        "wait" => BackendAction::Wait {
            seconds: args.first().and_then(arg_as_num).unwrap_or(1.0),
        },
        _ => BackendAction::Wait { seconds: 1.0 },
    }
}

fn build_grounded_action(verb: &str, args: &[parser::Arg], xy: (i32, i32)) -> BackendAction {
    match verb {
        "click" => BackendAction::Click {
            xy,
            button: args
                .get(2)
                .and_then(arg_as_string)
                .and_then(|s| parse_mouse_button(&s))
                .unwrap_or(MouseButton::Left),
            count: args.get(1).and_then(arg_as_num).map(|n| n as u8).unwrap_or(1),
            hold_keys: Vec::new(),
        },
        "drag" => BackendAction::Drag {
            start: xy,
            end: xy,
            hold_keys: Vec::new(),
        },
        "scroll" => BackendAction::Scroll {
            xy,
            clicks: args.get(1).and_then(arg_as_num).map(|n| n as i32).unwrap_or(3),
            vertical: args.iter().any(|a| a.keyword.as_deref() == Some("vertical")),
        },
        "type" => BackendAction::Type {
            text: args.first().and_then(arg_as_string).unwrap_or_default(),
            xy: Some(xy),
            overwrite: named_bool(args, "overwrite"),
            press_enter: named_bool(args, "enter") || named_bool(args, "press_enter"),
        },
        _ => BackendAction::Wait { seconds: 1.0 },
    }
}

fn named_bool(args: &[parser::Arg], keyword: &str) -> bool {
    args.iter()
        .find(|a| a.keyword.as_deref() == Some(keyword))
        .is_some_and(|a| matches!(a.value, ArgValue::Bool(true)))
}

fn arg_as_string(arg: &parser::Arg) -> Option<String> {
    match &arg.value {
        ArgValue::Str(s) => Some(s.clone()),
        _ => None,
    }
}

fn arg_as_num(arg: &parser::Arg) -> Option<f64> {
    match arg.value {
        ArgValue::Num(n) => Some(n),
        _ => None,
    }
}

fn parse_mouse_button(raw: &str) -> Option<MouseButton> {
    match raw {
        "left" => Some(MouseButton::Left),
        "middle" => Some(MouseButton::Middle),
        "right" => Some(MouseButton::Right),
        _ => None,
    }
}

/// Parses the first two integers out of the grounding tool's free-form
/// response and validates them against the screenshot's pixel bounds
/// (spec §4.7 step 3).
fn parse_coordinates(text: &str, width: i32, height: i32) -> Option<(i32, i32)> {
    let numbers: Vec<i32> = text
        .split(|c: char| !c.is_ascii_digit() && c != '-')
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i32>().ok())
        .collect();
    if numbers.len() < 2 {
        return None;
    }
    let (x, y) = (numbers[0], numbers[1]);
    if x < 0 || y < 0 || x > width || y > height {
        return None;
    }
    Some((x, y))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_coordinates_accepts_in_bounds_pair() {
        assert_eq!(parse_coordinates("(120, 340)", 1920, 1080), Some((120, 340)));
    }

    #[test]
    fn parse_coordinates_rejects_out_of_bounds() {
        assert_eq!(parse_coordinates("(5000, 340)", 1920, 1080), None);
    }

    #[test]
    fn parse_coordinates_rejects_unparseable_text() {
        assert_eq!(parse_coordinates("I could not locate the element", 1920, 1080), None);
    }

    #[test]
    fn build_grounded_click_uses_count_and_button_args() {
        let args = vec![
            parser::Arg {
                keyword: None,
                value: ArgValue::Str("the File menu".to_string()),
            },
            parser::Arg {
                keyword: None,
                value: ArgValue::Num(2.0),
            },
            parser::Arg {
                keyword: None,
                value: ArgValue::Str("right".to_string()),
            },
        ];
        let action = build_grounded_action("click", &args, (10, 20));
        match action {
            BackendAction::Click { xy, button, count, .. } => {
                assert_eq!(xy, (10, 20));
                assert_eq!(button, MouseButton::Right);
                assert_eq!(count, 2);
            }
            other => panic!("expected Click, got {other:?}"),
        }
    }
}
