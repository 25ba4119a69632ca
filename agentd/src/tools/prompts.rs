//! Prompt templates are opaque strings per spec §1 — their *content* is out
//! of scope for this core. This loader only carries the *mechanism*: load a
//! handlebars template per [`super::ToolName`] from disk if present, else
//! fall back to a minimal embedded default, mirroring the teacher's
//! `prompts::loader`/`prompts::embedded` split.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use handlebars::Handlebars;
use serde::Serialize;
use tracing::{debug, warn};

use super::ToolName;

fn embedded_default(tool: ToolName) -> &'static str {
    match tool {
        ToolName::SubtaskPlanner => "Produce an ordered plan for: {{instruction}}",
        ToolName::DagTranslator => "Translate this plan into a dependency graph: {{plan_text}}",
        ToolName::ActionGenerator | ToolName::FastActionGenerator => {
            "Given subtask {{subtask}} and instruction {{instruction}}, produce the next action."
        }
        ToolName::ActionGeneratorWithTakeover | ToolName::FastActionGeneratorWithTakeover => {
            "Given subtask {{subtask}}, produce the next action (user takeover enabled)."
        }
        ToolName::Grounding => "Locate \"{{description}}\" in the screenshot and return pixel coordinates.",
        ToolName::TrajReflector => "Judge progress on subtask {{subtask}} given the last {{window}} actions.",
        _ => "{{instruction}}",
    }
}

/// Loads a template for `tool` from `<dir>/<tool_name>.hbs` if `dir` is
/// set and the file exists, else returns the embedded default.
pub struct PromptLoader {
    dir: Option<PathBuf>,
    registry: Handlebars<'static>,
}

impl PromptLoader {
    pub fn new(dir: Option<PathBuf>) -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(false);
        Self { dir, registry }
    }

    fn template_source(&self, tool: ToolName) -> String {
        if let Some(dir) = &self.dir {
            let path = dir.join(format!("{}.hbs", tool.as_str()));
            if let Ok(contents) = std::fs::read_to_string(&path) {
                debug!(tool = %tool, path = %path.display(), "PromptLoader: loaded from disk");
                return contents;
            }
        }
        embedded_default(tool).to_string()
    }

    pub fn render<T: Serialize>(&self, tool: ToolName, context: &T) -> String {
        let template = self.template_source(tool);
        self.registry.render_template(&template, context).unwrap_or_else(|e| {
            warn!(tool = %tool, error = %e, "PromptLoader: render failed, using raw template");
            template
        })
    }
}

impl Default for PromptLoader {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_default_renders_without_a_directory() {
        let loader = PromptLoader::default();
        let rendered = loader.render(ToolName::SubtaskPlanner, &HashMap::from([("instruction", "open calculator")]));
        assert!(rendered.contains("open calculator"));
    }

    #[test]
    fn disk_template_overrides_embedded_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("grounding.hbs"), "WHERE IS {{description}}?").unwrap();
        let loader = PromptLoader::new(Some(dir.path().to_path_buf()));
        let rendered = loader.render(ToolName::Grounding, &HashMap::from([("description", "File menu")]));
        assert_eq!(rendered, "WHERE IS File menu?");
    }
}
