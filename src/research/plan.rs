//! Structured research plan

use crate::llm::OutputSchema;
use serde::{Deserialize, Serialize};

/// One information-gathering step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub title: String,
    /// Exactly what data to collect
    pub description: String,
}

/// Research plan produced by the planner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// e.g. "en-US" or "zh-CN"
    pub locale: String,
    /// Whether the topic can already be answered without research
    pub has_enough_context: bool,
    pub thought: String,
    pub title: String,
    pub steps: Vec<Step>,
}

impl Plan {
    /// A plan that still needs context must say how to get it
    pub fn validate(&self) -> Result<(), String> {
        if !self.has_enough_context && self.steps.is_empty() {
            return Err("plan needs more context but has no steps".to_string());
        }
        if let Some(idx) = self.steps.iter().position(|s| s.title.trim().is_empty()) {
            return Err(format!("step {} has an empty title", idx + 1));
        }
        Ok(())
    }

    /// JSON schema the planner output must follow
    pub fn output_schema() -> OutputSchema {
        OutputSchema {
            name: "plan".to_string(),
            schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "locale": {
                        "type": "string",
                        "description": "e.g. \"en-US\" or \"zh-CN\", based on the user's language or specific request"
                    },
                    "has_enough_context": {
                        "type": "boolean",
                        "description": "Whether the user input already contains enough context to answer the question"
                    },
                    "thought": {
                        "type": "string",
                        "description": "A brief thought process or reasoning behind the plan"
                    },
                    "title": {
                        "type": "string",
                        "description": "A concise title or summary of the plan"
                    },
                    "steps": {
                        "type": "array",
                        "description": "Research and processing steps to get more context",
                        "items": {
                            "type": "object",
                            "properties": {
                                "title": {"type": "string"},
                                "description": {
                                    "type": "string",
                                    "description": "Exactly what data to collect"
                                }
                            },
                            "required": ["title", "description"],
                            "additionalProperties": false
                        }
                    }
                },
                "required": ["locale", "has_enough_context", "thought", "title", "steps"],
                "additionalProperties": false
            }),
        }
    }

    /// Markdown outline shown to the user for confirmation
    pub fn outline(&self) -> String {
        let mut out = format!("# {}\n\n{}\n", self.title, self.thought);
        for (idx, step) in self.steps.iter().enumerate() {
            out.push_str(&format!("\n{}. **{}**: {}", idx + 1, step.title, step.description));
        }
        out
    }

    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}
