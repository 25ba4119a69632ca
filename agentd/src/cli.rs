//! CLI surface (spec §6): a thin subcommand layer over [`crate::manager::TaskManager`].
//! Grounded on the teacher's `Cli`/`Command` (`clap` derive, global `--config`/
//! `--log-level` flags, one variant per operation).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::domain::{Platform, TaskMode};

#[derive(Parser)]
#[command(name = "agentd", about = "Task execution service core for autonomous GUI-agent runs", version)]
pub struct Cli {
    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Submit an instruction and stream its progress to stdout until terminal.
    Run {
        instruction: String,

        /// Neutral action backend: `lybic`, `lybic_mobile`, `local_gui`, `vm`, `adb`. Only
        /// `local_gui` (a no-op stub) ships with this crate; the rest are out of scope.
        #[arg(long, default_value = "local_gui")]
        backend: String,

        #[arg(long)]
        max_steps: Option<u32>,

        #[arg(long, value_enum, default_value = "normal")]
        mode: CliMode,

        #[arg(long, value_enum, default_value = "linux")]
        platform: CliPlatform,

        #[arg(long)]
        enable_takeover: bool,

        /// Accepted for spec §6 flag-surface parity; web_search tool calls are
        /// out of scope for this crate (Non-goals), so this is a no-op.
        #[arg(long)]
        disable_search: bool,
    },

    /// Poll a previously submitted task's status.
    Query { task_id: String },

    /// Request cancellation of a running task.
    Cancel { task_id: String },

    /// List recent tasks.
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Print this process's capability/config summary.
    Info,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum CliMode {
    Normal,
    Fast,
}

impl From<CliMode> for TaskMode {
    fn from(mode: CliMode) -> Self {
        match mode {
            CliMode::Normal => TaskMode::Normal,
            CliMode::Fast => TaskMode::Fast,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum CliPlatform {
    Linux,
    Windows,
    Macos,
    Android,
}

impl From<CliPlatform> for Platform {
    fn from(platform: CliPlatform) -> Self {
        match platform {
            CliPlatform::Linux => Platform::Linux,
            CliPlatform::Windows => Platform::Windows,
            CliPlatform::Macos => Platform::Macos,
            CliPlatform::Android => Platform::Android,
        }
    }
}
