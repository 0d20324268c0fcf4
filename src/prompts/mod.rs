//! Prompt templates
//!
//! Built-in templates are compiled into the binary and rendered with
//! handlebars in strict mode, so a template that references a variable
//! the caller did not supply fails instead of rendering an empty string.

use handlebars::Handlebars;
use serde_json::Value;
use std::path::Path;
use tracing::debug;

pub const COORDINATOR: &str = "coordinator";
pub const PLANNER: &str = "planner";
pub const RESEARCHER: &str = "researcher";
pub const REPORTER: &str = "reporter";
pub const SYNTHESIS: &str = "synthesis";
pub const COMPRESS: &str = "compress";

const BUILTIN_TEMPLATES: &[(&str, &str)] = &[
    (COORDINATOR, include_str!("templates/coordinator.md")),
    (PLANNER, include_str!("templates/planner.md")),
    (RESEARCHER, include_str!("templates/researcher.md")),
    (REPORTER, include_str!("templates/reporter.md")),
    (SYNTHESIS, include_str!("templates/synthesis.md")),
    (COMPRESS, include_str!("templates/compress.md")),
];

/// Prompt rendering errors
#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("Unknown template: {0}")]
    UnknownTemplate(String),

    #[error("Template registration failed: {0}")]
    Register(String),

    #[error("Template render error: {0}")]
    Render(String),
}

/// Render a named template with variables
pub trait PromptRenderer: Send + Sync {
    fn render(&self, name: &str, vars: &Value) -> Result<String, PromptError>;
}

/// Handlebars-backed template registry
pub struct TemplateRegistry {
    handlebars: Handlebars<'static>,
}

impl TemplateRegistry {
    /// Registry with the built-in templates
    pub fn new() -> Result<Self, PromptError> {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(true);
        handlebars.register_escape_fn(handlebars::no_escape);

        let mut registry = Self { handlebars };
        for (name, source) in BUILTIN_TEMPLATES {
            registry.register(name, source)?;
        }
        Ok(registry)
    }

    /// Add or replace a template
    pub fn register(&mut self, name: &str, source: &str) -> Result<(), PromptError> {
        self.handlebars
            .register_template_string(name, source)
            .map_err(|e| PromptError::Register(format!("{}: {}", name, e)))
    }

    /// Override built-ins with `<name>.md` files found in `dir`
    pub fn with_overrides(mut self, dir: &Path) -> Result<Self, PromptError> {
        for (name, _) in BUILTIN_TEMPLATES {
            let path = dir.join(format!("{}.md", name));
            if let Ok(source) = std::fs::read_to_string(&path) {
                debug!("Loaded template override {}", path.display());
                self.register(name, &source)?;
            }
        }
        Ok(self)
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.handlebars.has_template(name)
    }
}

impl PromptRenderer for TemplateRegistry {
    fn render(&self, name: &str, vars: &Value) -> Result<String, PromptError> {
        if !self.handlebars.has_template(name) {
            return Err(PromptError::UnknownTemplate(name.to_string()));
        }
        self.handlebars
            .render(name, vars)
            .map_err(|e| PromptError::Render(format!("{}: {}", name, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtins_registered() {
        let registry = TemplateRegistry::new().unwrap();
        for (name, _) in BUILTIN_TEMPLATES {
            assert!(registry.has_template(name), "missing {}", name);
        }
    }

    #[test]
    fn test_render_planner() {
        let registry = TemplateRegistry::new().unwrap();
        let prompt = registry
            .render(
                PLANNER,
                &json!({
                    "CURRENT_TIME": "2025-10-01 10:00:00",
                    "research_topic": "2025 年 token2049 大会的内容和愿景",
                    "locale": "zh-CN",
                    "max_step_num": 3,
                }),
            )
            .unwrap();

        assert!(prompt.contains("token2049"));
        assert!(prompt.contains("between 1 and 3 steps"));
    }

    #[test]
    fn test_no_html_escaping() {
        let registry = TemplateRegistry::new().unwrap();
        let prompt = registry
            .render(COMPRESS, &json!({"dialogue": "user: a < b & \"c\""}))
            .unwrap();
        assert!(prompt.contains("user: a < b & \"c\""));
    }

    #[test]
    fn test_missing_variable_is_error() {
        let registry = TemplateRegistry::new().unwrap();
        let result = registry.render(COMPRESS, &json!({}));
        assert!(matches!(result, Err(PromptError::Render(_))));
    }

    #[test]
    fn test_unknown_template() {
        let registry = TemplateRegistry::new().unwrap();
        let result = registry.render("nope", &json!({}));
        assert!(matches!(result, Err(PromptError::UnknownTemplate(_))));
    }

    #[test]
    fn test_register_replaces_builtin() {
        let mut registry = TemplateRegistry::new().unwrap();
        registry.register(COMPRESS, "Summarize: {{dialogue}}").unwrap();
        let prompt = registry.render(COMPRESS, &json!({"dialogue": "x"})).unwrap();
        assert_eq!(prompt, "Summarize: x");
    }
}
