//! Anthropic Messages API wire format.

use std::collections::HashMap;

use chrono::Utc;
use llmfn_protocol::{ConversationMessage, ProviderKind, Role, ToolCall, UsedTime, UsedTokens};
use llmfn_ratelimits::{HeaderWindows, WindowLimit, parse_anthropic_headers};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::{Backend, StopReason, Turn, WireRequest, listed_model_active};
use crate::error::{FunError, Result};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Backend for `POST {base_url}/v1/messages`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnthropicBackend;

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(rename = "type")]
    kind: String,
    role: String,
    content: Vec<Value>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
}

impl Usage {
    /// Cached prompt tokens are billed separately but still count towards
    /// the prompt.
    fn tokens(&self) -> Result<UsedTokens> {
        let overflow = || FunError::UnexpectedTokenCount {
            message: format!(
                "token counts overflow: input {}, output {}, cache creation {:?}, cache read {:?}",
                self.input_tokens,
                self.output_tokens,
                self.cache_creation_input_tokens,
                self.cache_read_input_tokens
            ),
        };
        let prompt = self
            .input_tokens
            .checked_add(self.cache_creation_input_tokens.unwrap_or(0))
            .and_then(|n| n.checked_add(self.cache_read_input_tokens.unwrap_or(0)))
            .ok_or_else(overflow)?;
        let total = prompt.checked_add(self.output_tokens).ok_or_else(overflow)?;
        Ok(UsedTokens {
            prompt,
            response: self.output_tokens,
            total,
            cache_creation_input_tokens: self.cache_creation_input_tokens,
            cache_read_input_tokens: self.cache_read_input_tokens,
            ..UsedTokens::default()
        })
    }
}

fn text_block(text: &str) -> Value {
    json!({"type": "text", "text": text})
}

/// Append `block` to the last message if it has `role` and `merge` holds,
/// otherwise open a new message.
fn push_block(wire: &mut Vec<Value>, role: &str, block: Value, merge: bool) {
    if merge {
        if let Some(Value::Array(content)) = wire
            .last_mut()
            .filter(|last| last["role"] == role)
            .and_then(|last| last.get_mut("content"))
        {
            content.push(block);
            return;
        }
    }
    wire.push(json!({"role": role, "content": [block]}));
}

/// Map conversation messages to Messages API messages. The system message
/// is returned separately. Tool uses join the assistant turn they belong
/// to and consecutive tool results share one user message.
fn wire_messages(messages: &[ConversationMessage]) -> (Option<String>, Vec<Value>) {
    let mut system = None;
    let mut wire = Vec::with_capacity(messages.len());
    let mut previous: Option<Role> = None;

    for message in messages {
        match message.role {
            Role::System => system = Some(message.content.clone()),
            Role::User => push_block(&mut wire, "user", text_block(&message.content), false),
            Role::Assistant => {
                push_block(&mut wire, "assistant", text_block(&message.content), false)
            }
            Role::ToolUse => {
                let input = serde_json::from_str::<Value>(&message.content)
                    .ok()
                    .filter(Value::is_object)
                    .unwrap_or_else(|| Value::Object(Map::new()));
                let block = json!({
                    "type": "tool_use",
                    "id": message.tool_use_id,
                    "name": message.tool_use_name,
                    "input": input,
                });
                let merge = matches!(previous, Some(Role::Assistant | Role::ToolUse));
                push_block(&mut wire, "assistant", block, merge);
            }
            Role::ToolResult => {
                let mut block = json!({
                    "type": "tool_result",
                    "tool_use_id": message.tool_use_id,
                    "content": message.content,
                });
                if message.is_error {
                    block["is_error"] = Value::Bool(true);
                }
                let merge = previous == Some(Role::ToolResult);
                push_block(&mut wire, "user", block, merge);
            }
        }
        previous = Some(message.role);
    }

    (system, wire)
}

impl Backend for AnthropicBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn endpoint(&self, base_url: &str) -> String {
        format!("{base_url}/v1/messages")
    }

    fn models_endpoint(&self, base_url: &str) -> String {
        format!("{base_url}/v1/models?limit=1000")
    }

    fn headers(&self, api_key: Option<&str>) -> Vec<(&'static str, String)> {
        let mut headers = vec![("anthropic-version", ANTHROPIC_VERSION.to_string())];
        if let Some(key) = api_key {
            headers.push(("x-api-key", key.to_string()));
        }
        headers
    }

    fn build_body(&self, request: &WireRequest<'_>) -> Result<Value> {
        let descriptor = request.descriptor;
        let (system, messages) = wire_messages(request.messages);
        let mut body = json!({
            "model": descriptor.model,
            "max_tokens": descriptor.max_response_length,
            "messages": messages,
        });
        if let Some(system) = system {
            body["system"] = Value::String(system);
        }
        if let Some(temperature) = descriptor.temperature {
            body["temperature"] = json!(temperature);
        }
        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "input_schema": tool.input_schema,
                    })
                })
                .collect();
        }
        Ok(body)
    }

    fn parse_turn(&self, body: &str) -> Result<Turn> {
        let response: MessagesResponse = serde_json::from_str(body)
            .map_err(|e| FunError::malformed(format!("invalid message: {e}"), body))?;

        if response.kind != "message" {
            return Err(FunError::unexpected_message(format!(
                "expected message, got {}",
                response.kind
            )));
        }
        if response.role != "assistant" {
            return Err(FunError::unexpected_role("assistant", response.role));
        }

        let mut texts = Vec::new();
        let mut tool_calls = Vec::new();
        for block in &response.content {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    texts.push(block.get("text").and_then(Value::as_str).unwrap_or_default())
                }
                Some("tool_use") => {
                    let field = |name: &str| {
                        block
                            .get(name)
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .ok_or_else(|| {
                                FunError::malformed(format!("tool_use block without {name}"), body)
                            })
                    };
                    let input = block.get("input").cloned().unwrap_or(Value::Null);
                    tool_calls.push(ToolCall::new(field("id")?, field("name")?, input));
                }
                Some("thinking" | "redacted_thinking") => {}
                other => {
                    return Err(FunError::unexpected_message(format!(
                        "unsupported content block {}",
                        other.unwrap_or("without type")
                    )));
                }
            }
        }

        let stop = match response.stop_reason.as_deref() {
            Some("end_turn" | "stop_sequence") => StopReason::EndTurn,
            Some("tool_use") => StopReason::ToolUse,
            Some("max_tokens") => StopReason::MaxTokens,
            Some("refusal") => StopReason::Refusal,
            other => {
                return Err(FunError::UnexpectedStop {
                    reason: other.unwrap_or("none").to_string(),
                });
            }
        };
        if stop == StopReason::EndTurn {
            if !tool_calls.is_empty() {
                return Err(FunError::unexpected_message(
                    "tool_use block in a final answer",
                ));
            }
            if texts.len() > 1 {
                return Err(FunError::UnexpectedNumberOfMessages {
                    expected: 1,
                    got: texts.len(),
                });
            }
        }

        let content = texts.concat();
        Ok(Turn {
            stop,
            refusal: (stop == StopReason::Refusal).then(|| content.clone()),
            content,
            tool_calls,
            usage: response.usage.tokens()?,
            time: UsedTime::default(),
        })
    }

    fn request_id(&self, headers: &HashMap<String, String>) -> Option<String> {
        headers.get("request-id").filter(|id| !id.is_empty()).cloned()
    }

    fn rate_limits(
        &self,
        headers: &HashMap<String, String>,
        windows: &HeaderWindows,
    ) -> HashMap<String, WindowLimit> {
        parse_anthropic_headers(headers, windows, Utc::now())
    }

    fn model_active(&self, body: &str, model: &str) -> Result<bool> {
        listed_model_active(body, model)
    }
}
