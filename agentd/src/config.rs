//! Configuration loading: fallback chain (explicit path -> project-local
//! file -> user config dir -> defaults), mirroring the teacher's
//! `Config::load`. Environment variables from spec §6 override file config.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub concurrency: ConcurrencyConfig,
    pub storage: StorageConfig,
    pub workspace: WorkspaceConfig,
    pub event_bus: EventBusConfig,
    pub reflector: ReflectorConfig,
    pub metrics: MetricsConfig,
    pub screen: ScreenConfig,
}

impl Config {
    /// Load configuration with the fallback chain: explicit path, then
    /// `.agentd.yml` in the current directory, then the user config dir,
    /// then built-in defaults. Env vars (spec §6) are applied last and
    /// always win, matching the teacher's config layering.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = config_path {
            Self::load_from_file(path).context(format!("failed to load config from {}", path.display()))?
        } else if let Some(config) = Self::try_local_and_user_config() {
            config
        } else {
            tracing::info!("no config file found, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn try_local_and_user_config() -> Option<Self> {
        let local = PathBuf::from(".agentd.yml");
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => return Some(config),
                Err(e) => tracing::warn!("failed to load config from {}: {e}", local.display()),
            }
        }
        if let Some(dir) = dirs::config_dir() {
            let user_config = dir.join("agentd").join("agentd.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Some(config),
                    Err(e) => tracing::warn!("failed to load config from {}: {e}", user_config.display()),
                }
            }
        }
        None
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("failed to parse config file")?;
        tracing::info!("loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Apply the environment variables recognized by spec §6. These
    /// override whatever the file/default config set.
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("LOG_DIR") {
            self.workspace.log_dir = PathBuf::from(dir);
        }
        if let Ok(max) = std::env::var("TASK_MAX_TASKS") {
            if let Ok(max) = max.parse() {
                self.concurrency.max_concurrent = max;
            }
        }
        if let Ok(backend) = std::env::var("TASK_STORAGE_BACKEND") {
            self.storage.backend = backend;
        }
        if let Ok(conn) = std::env::var("SQL_CONNECTION_STRING") {
            self.storage.connection_string = Some(conn);
        }
        if let Ok(enabled) = std::env::var("ENABLE_METRICS") {
            self.metrics.enabled = matches!(enabled.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(port) = std::env::var("METRICS_PORT") {
            if let Ok(port) = port.parse() {
                self.metrics.port = port;
            }
        }
    }
}

/// LLM provider configuration, plus per-tool overrides (spec §6
/// Configuration object: `per_tool_overrides`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,
    #[serde(rename = "base-url")]
    pub base_url: String,
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
    #[serde(rename = "per-tool-overrides")]
    pub per_tool_overrides: HashMap<String, ToolOverride>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 4096,
            timeout_ms: 120_000,
            per_tool_overrides: HashMap::new(),
        }
    }
}

/// Per-tool config override (spec §6: `{provider?, model_name?, api_key?,
/// api_endpoint?}`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolOverride {
    pub provider: Option<String>,
    pub model_name: Option<String>,
    pub api_key: Option<String>,
    pub api_endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    #[serde(rename = "max-concurrent")]
    pub max_concurrent: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { max_concurrent: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `memory` or `sql`.
    pub backend: String,
    pub connection_string: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            connection_string: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub log_dir: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("/tmp/agentd"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    pub replay_history: usize,
    pub subscriber_buffer: usize,
    pub linger_seconds: u64,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            replay_history: 32,
            subscriber_buffer: 64,
            linger_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectorConfig {
    pub every_k_steps: u32,
    pub identical_action_threshold: u32,
    pub stalled_subtask_threshold: u32,
    pub unchanged_screenshot_threshold: u32,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            every_k_steps: 5,
            identical_action_threshold: 3,
            stalled_subtask_threshold: 10,
            unchanged_screenshot_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9090,
        }
    }
}

/// Declared screenshot dimensions and how strictly the Worker enforces them
/// against what the backend actually returns (Open Question #2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenConfig {
    pub declared_width: i32,
    pub declared_height: i32,
    /// When true, a screenshot whose real dimensions differ from
    /// `declared_width`/`declared_height` logs a louder warning; either way
    /// the dispatcher grounds against the screenshot's actual dimensions
    /// rather than aborting the task (Open Question #2 decision).
    pub strict_bounds: bool,
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            declared_width: 1920,
            declared_height: 1080,
            strict_bounds: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn default_config_has_sane_values() {
        let config = Config::default();
        assert_eq!(config.llm.provider, "anthropic");
        assert_eq!(config.concurrency.max_concurrent, 5);
        assert_eq!(config.storage.backend, "memory");
    }

    #[test]
    fn partial_yaml_falls_back_to_defaults() {
        let yaml = "llm:\n  model: claude-haiku\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.llm.model, "claude-haiku");
        assert_eq!(config.llm.provider, "anthropic");
        assert_eq!(config.concurrency.max_concurrent, 5);
    }

    #[test]
    #[serial]
    fn env_overrides_win_over_defaults() {
        // SAFETY: serialized by `serial_test` so no other test observes a
        // racing mutation of the process environment.
        unsafe {
            std::env::set_var("TASK_MAX_TASKS", "17");
        }
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.concurrency.max_concurrent, 17);
        unsafe {
            std::env::remove_var("TASK_MAX_TASKS");
        }
    }
}
