//! The neutral action schema (spec §4.4) and the durable record of one
//! executed action (spec §3 `ActionRecord`).

use serde::{Deserialize, Serialize};

/// Mouse button for `click`/`drag`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Middle,
    Right,
}

/// A neutral, device-independent action. The [`crate::backend::Backend`]
/// trait turns this into concrete device/API calls; the Worker is the only
/// component that constructs one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendAction {
    Screenshot,
    Click {
        xy: (i32, i32),
        button: MouseButton,
        count: u8,
        #[serde(default)]
        hold_keys: Vec<String>,
    },
    Type {
        text: String,
        #[serde(default)]
        xy: Option<(i32, i32)>,
        #[serde(default)]
        overwrite: bool,
        #[serde(default)]
        press_enter: bool,
    },
    Drag {
        start: (i32, i32),
        end: (i32, i32),
        #[serde(default)]
        hold_keys: Vec<String>,
    },
    Scroll {
        xy: (i32, i32),
        clicks: i32,
        vertical: bool,
    },
    Hotkey {
        keys: Vec<String>,
    },
    HoldAndPress {
        hold_keys: Vec<String>,
        press_keys: Vec<String>,
    },
    Open {
        app_or_filename: String,
    },
    SwitchApp {
        app_code: String,
    },
    Wait {
        seconds: f64,
    },
    Done {
        return_value: Option<String>,
    },
    Fail,
}

impl BackendAction {
    /// Short verb for logging/events, independent of parameters.
    pub fn verb(&self) -> &'static str {
        match self {
            BackendAction::Screenshot => "screenshot",
            BackendAction::Click { .. } => "click",
            BackendAction::Type { .. } => "type",
            BackendAction::Drag { .. } => "drag",
            BackendAction::Scroll { .. } => "scroll",
            BackendAction::Hotkey { .. } => "hotkey",
            BackendAction::HoldAndPress { .. } => "hold_and_press",
            BackendAction::Open { .. } => "open",
            BackendAction::SwitchApp { .. } => "switch_app",
            BackendAction::Wait { .. } => "wait",
            BackendAction::Done { .. } => "done",
            BackendAction::Fail => "fail",
        }
    }
}

/// One executed action, as mirrored to `state/actions.jsonl` (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub step: u32,
    pub timestamp: i64,
    pub subtask_name: String,
    pub description: String,
    pub action: BackendAction,
    pub success: bool,
    pub screenshot_path: Option<String>,
}
