//! Conversation history types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a message in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    ToolUse,
    ToolResult,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::ToolUse => "tool_use",
            Role::ToolResult => "tool_result",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in the conversation history.
///
/// A `tool_use` message carries the JSON encoded tool input as its content
/// and a `tool_result` message carries the tool output. Both reference the
/// tool call through `tool_use_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    /// Role of the message sender.
    pub role: Role,
    /// Textual content.
    pub content: String,
    /// Tool call ID (for tool use and tool result messages).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    /// Tool name (for tool use messages).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_name: Option<String>,
    /// The tool result content describes a failure.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
    /// The model refused to answer and the content is the refusal.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_refusal: bool,
}

impl ConversationMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_use_id: None,
            tool_use_name: None,
            is_error: false,
            is_refusal: false,
        }
    }

    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create an assistant message holding a refusal.
    pub fn refusal(content: impl Into<String>) -> Self {
        Self {
            is_refusal: true,
            ..Self::new(Role::Assistant, content)
        }
    }

    /// Create a tool use message from a model requested tool call.
    pub fn tool_use(call: &ToolCall) -> Self {
        Self {
            tool_use_id: Some(call.id.clone()),
            tool_use_name: Some(call.name.clone()),
            ..Self::new(Role::ToolUse, call.input.to_string())
        }
    }

    /// Create a tool result message.
    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_use_id: Some(tool_use_id.into()),
            ..Self::new(Role::ToolResult, content)
        }
    }

    /// Create a tool result message describing a failed tool call.
    pub fn tool_error(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::tool_result(tool_use_id, content)
        }
    }

    /// Number of characters used for budget estimation.
    pub fn char_count(&self) -> usize {
        self.content.chars().count()
            + self.tool_use_name.as_deref().map_or(0, |n| n.chars().count())
            + self.tool_use_id.as_deref().map_or(0, |n| n.chars().count())
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Backend assigned call ID.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Tool input as JSON.
    pub input: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

/// Tool definition advertised to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the tool input.
    pub input_schema: Value,
}
