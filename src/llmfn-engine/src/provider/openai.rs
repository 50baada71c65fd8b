//! OpenAI chat completions wire format, also spoken by Groq and other
//! compatible servers.

use std::collections::HashMap;
use std::time::Duration;

use llmfn_protocol::{ConversationMessage, ProviderKind, Role, ToolCall, UsedTime, UsedTokens};
use llmfn_ratelimits::{HeaderWindows, WindowLimit, parse_openai_headers};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::{Backend, StopReason, Turn, WireRequest, listed_model_active};
use crate::error::{FunError, Result};

/// Backend for `POST {base_url}/chat/completions`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiBackend;

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    object: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    kind: String,
    function: WireFunction,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
    /// Groq reports timings in seconds.
    #[serde(default)]
    prompt_time: Option<f64>,
    #[serde(default)]
    completion_time: Option<f64>,
    #[serde(default)]
    total_time: Option<f64>,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: Option<u64>,
}

impl Usage {
    fn tokens(&self) -> UsedTokens {
        UsedTokens {
            prompt: self.prompt_tokens,
            response: self.completion_tokens,
            total: self.total_tokens,
            cache_read_input_tokens: self
                .prompt_tokens_details
                .as_ref()
                .and_then(|d| d.cached_tokens),
            ..UsedTokens::default()
        }
    }

    fn time(&self) -> UsedTime {
        UsedTime {
            prompt: self.prompt_time.and_then(seconds),
            response: self.completion_time.and_then(seconds),
            total: self.total_time.and_then(seconds),
        }
    }
}

fn seconds(value: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(value).ok()
}

/// Tool arguments the model produced. Text that is not JSON is kept as a
/// string so input validation reports it.
fn parse_arguments(arguments: &str) -> Value {
    if arguments.trim().is_empty() {
        return Value::Object(Map::new());
    }
    serde_json::from_str(arguments).unwrap_or_else(|_| Value::String(arguments.to_string()))
}

/// Map conversation messages to chat messages. Consecutive tool use
/// messages become the `tool_calls` of one assistant message.
fn wire_messages(messages: &[ConversationMessage]) -> Vec<Value> {
    let mut wire: Vec<Value> = Vec::with_capacity(messages.len());
    let mut previous: Option<Role> = None;

    for message in messages {
        match message.role {
            Role::System | Role::User | Role::Assistant => {
                wire.push(json!({"role": message.role.as_str(), "content": message.content}));
            }
            Role::ToolUse => {
                let call = json!({
                    "id": message.tool_use_id,
                    "type": "function",
                    "function": {
                        "name": message.tool_use_name,
                        "arguments": message.content,
                    }
                });
                let continues_turn = matches!(previous, Some(Role::Assistant | Role::ToolUse));
                match wire.last_mut().filter(|_| continues_turn) {
                    Some(last) => {
                        let calls = last
                            .as_object_mut()
                            .map(|m| m.entry("tool_calls").or_insert_with(|| json!([])));
                        if let Some(Value::Array(calls)) = calls {
                            calls.push(call);
                        }
                    }
                    None => wire.push(json!({
                        "role": "assistant",
                        "content": Value::Null,
                        "tool_calls": [call],
                    })),
                }
            }
            Role::ToolResult => {
                wire.push(json!({
                    "role": "tool",
                    "tool_call_id": message.tool_use_id,
                    "content": message.content,
                }));
            }
        }
        previous = Some(message.role);
    }

    wire
}

impl Backend for OpenAiBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn supports_output_schema(&self) -> bool {
        true
    }

    fn endpoint(&self, base_url: &str) -> String {
        format!("{base_url}/chat/completions")
    }

    fn models_endpoint(&self, base_url: &str) -> String {
        format!("{base_url}/models")
    }

    fn headers(&self, api_key: Option<&str>) -> Vec<(&'static str, String)> {
        api_key
            .map(|key| vec![("authorization", format!("Bearer {key}"))])
            .unwrap_or_default()
    }

    fn build_body(&self, request: &WireRequest<'_>) -> Result<Value> {
        let descriptor = request.descriptor;
        let mut body = json!({
            "model": descriptor.model,
            "messages": wire_messages(request.messages),
            "max_completion_tokens": descriptor.max_response_length,
        });
        if let Some(temperature) = descriptor.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(seed) = descriptor.seed {
            body["seed"] = json!(seed);
        }
        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.input_schema,
                        }
                    })
                })
                .collect();
        }
        if let Some(schema) = request.output_schema {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {"name": "output", "strict": true, "schema": schema},
            });
        }
        Ok(body)
    }

    fn parse_turn(&self, body: &str) -> Result<Turn> {
        let response: ChatResponse = serde_json::from_str(body)
            .map_err(|e| FunError::malformed(format!("invalid chat completion: {e}"), body))?;

        if let Some(object) = response.object.as_deref().filter(|o| *o != "chat.completion") {
            return Err(FunError::unexpected_message(format!(
                "expected chat.completion, got {object}"
            )));
        }
        let usage = response.usage.ok_or_else(|| FunError::UnexpectedTokenCount {
            message: "response without usage".to_string(),
        })?;
        let got = response.choices.len();
        let Some(choice) = response.choices.into_iter().next().filter(|_| got == 1) else {
            return Err(FunError::UnexpectedNumberOfMessages { expected: 1, got });
        };

        let message = choice.message;
        if message.role != "assistant" {
            return Err(FunError::unexpected_role("assistant", message.role));
        }

        let mut tool_calls = Vec::with_capacity(message.tool_calls.len());
        for call in message.tool_calls {
            if call.kind != "function" {
                return Err(FunError::unexpected_message(format!(
                    "unsupported tool call type {}",
                    call.kind
                )));
            }
            let input = parse_arguments(&call.function.arguments);
            tool_calls.push(ToolCall::new(call.id, call.function.name, input));
        }

        let stop = match choice.finish_reason.as_deref() {
            Some("stop") if message.refusal.is_some() => StopReason::Refusal,
            // Some compatible servers report tool calls with a plain stop.
            Some("stop") if !tool_calls.is_empty() => StopReason::ToolUse,
            Some("stop") => StopReason::EndTurn,
            Some("tool_calls") => StopReason::ToolUse,
            Some("length") => StopReason::MaxTokens,
            Some("content_filter") => StopReason::Refusal,
            other => {
                return Err(FunError::UnexpectedStop {
                    reason: other.unwrap_or("none").to_string(),
                });
            }
        };

        Ok(Turn {
            stop,
            content: message.content.unwrap_or_default(),
            refusal: message.refusal,
            tool_calls,
            usage: usage.tokens(),
            time: usage.time(),
        })
    }

    fn request_id(&self, headers: &HashMap<String, String>) -> Option<String> {
        headers.get("x-request-id").filter(|id| !id.is_empty()).cloned()
    }

    fn rate_limits(
        &self,
        headers: &HashMap<String, String>,
        windows: &HeaderWindows,
    ) -> HashMap<String, WindowLimit> {
        parse_openai_headers(headers, windows)
    }

    fn model_active(&self, body: &str, model: &str) -> Result<bool> {
        listed_model_active(body, model)
    }
}
