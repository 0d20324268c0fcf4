//! Conversation data model

use serde::{Deserialize, Serialize};
use std::fmt;

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    /// Tag used on the wire and in cost estimation
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    /// Cost multiplier; assistant and tool turns carry structure the estimator undercounts
    pub fn weight(&self) -> f64 {
        match self {
            Role::Assistant => 1.2,
            Role::Tool => 1.5,
            Role::System | Role::User => 1.0,
        }
    }

    /// User and assistant messages are the only ones grouped into dialogue blocks
    pub fn is_dialogue(&self) -> bool {
        matches!(self, Role::User | Role::Assistant)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A capability invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }

    /// String argument by name
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(|v| v.as_str())
    }
}

/// Structured side data attached to a message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Pending tool calls on an assistant turn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Number of messages a compression summary replaced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_block_size: Option<usize>,
}

impl MessageMetadata {
    pub fn is_empty(&self) -> bool {
        self.tool_calls.is_empty() && self.original_block_size.is_none()
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// A unit of conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Optional display name (e.g. "feedback" for plan revisions)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "MessageMetadata::is_empty")]
    pub metadata: MessageMetadata,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            name: None,
            metadata: MessageMetadata::default(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Result of a tool call, linked back by id
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.metadata.tool_calls = tool_calls;
        self
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.metadata.tool_calls
    }

    /// Copy of this message with content cut to the first `max_chars` characters
    pub fn truncated(&self, max_chars: usize) -> Self {
        let mut copy = self.clone();
        copy.content = self.content.chars().take(max_chars).collect();
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_weights() {
        assert_eq!(Role::User.weight(), 1.0);
        assert_eq!(Role::System.weight(), 1.0);
        assert_eq!(Role::Assistant.weight(), 1.2);
        assert_eq!(Role::Tool.weight(), 1.5);
    }

    #[test]
    fn test_truncated_counts_characters() {
        let msg = Message::user("你好世界hello");
        let truncated = msg.truncated(3);
        assert_eq!(truncated.content, "你好世");
        assert_eq!(truncated.role, Role::User);
        assert_eq!(msg.content, "你好世界hello");
    }

    #[test]
    fn test_metadata_skipped_when_empty() {
        let json = serde_json::to_value(Message::user("hi")).unwrap();
        assert!(json.get("metadata").is_none());
        assert!(json.get("tool_call_id").is_none());

        let msg = Message::assistant("")
            .with_tool_calls(vec![ToolCall::new("call_1", "web_search", serde_json::json!({"query": "rust"}))]);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["metadata"]["tool_calls"][0]["name"], "web_search");
    }

    #[test]
    fn test_tool_call_arg_str() {
        let call = ToolCall::new("1", "handoff_to_planner", serde_json::json!({"locale": "en-US"}));
        assert_eq!(call.arg_str("locale"), Some("en-US"));
        assert_eq!(call.arg_str("research_topic"), None);
    }
}
