//! Model providers.
//!
//! [`ProviderAdapter`] implements the request/response protocol once:
//! budgeting, rate-limit admission, retries, response checks, tool call
//! loops and accounting. A [`Backend`] only maps conversations to a vendor's
//! wire format and back.

mod adapter;
pub mod anthropic;
pub mod openai;

pub use adapter::ProviderAdapter;
pub use anthropic::AnthropicBackend;
pub use openai::OpenAiBackend;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use llmfn_protocol::{
    ConversationMessage, ProviderDescriptor, ProviderKind, ToolCall, ToolSpec, UsedTime,
    UsedTokens,
};
use llmfn_ratelimits::{HeaderWindows, RateLimiter, WindowLimit};
use serde_json::Value;

use crate::config::ProviderConfig;
use crate::context::CallContext;
use crate::error::Result;
use crate::tools::ToolSet;

/// A model backend that can hold a conversation.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Configuration snapshot recorded with every call.
    fn descriptor(&self) -> &ProviderDescriptor;

    /// Set the conversation every exchange starts from: an optional system
    /// message followed by example turns. Can only be called once.
    async fn init(&self, cx: &CallContext, seed: Vec<ConversationMessage>) -> Result<()>;

    /// Send `message` after the seed and drive the conversation to a final
    /// answer, running tools the model asks for.
    async fn exchange(&self, cx: &CallContext, message: ConversationMessage) -> Result<String>;

    /// Tool support, if the backend has it.
    fn tools(&self) -> Option<&dyn SupportsTools> {
        None
    }

    /// Server-side structured output, if the backend has it.
    fn output_schema(&self) -> Option<&dyn SupportsOutputSchema> {
        None
    }
}

/// Providers that can offer tools to the model.
#[async_trait]
pub trait SupportsTools: Send + Sync {
    async fn init_tools(&self, cx: &CallContext, tools: ToolSet) -> Result<()>;
}

/// Providers that can constrain output to a JSON Schema.
#[async_trait]
pub trait SupportsOutputSchema: Send + Sync {
    async fn init_output_schema(&self, cx: &CallContext, schema: Value) -> Result<()>;
}

/// Why the model stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Final answer.
    EndTurn,
    /// The model wants tool results.
    ToolUse,
    /// The response hit the length limit.
    MaxTokens,
    /// The model refused or the content was filtered.
    Refusal,
}

/// One model turn decoded from a response.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub stop: StopReason,
    /// Text content, empty if there was none.
    pub content: String,
    pub refusal: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    /// Usage as reported. `max_total` and `max_response` are filled in by the adapter.
    pub usage: UsedTokens,
    /// Timing reported by the backend, if any.
    pub time: UsedTime,
}

/// Everything a backend needs to build a request body.
#[derive(Debug, Clone, Copy)]
pub struct WireRequest<'a> {
    pub descriptor: &'a ProviderDescriptor,
    pub messages: &'a [ConversationMessage],
    pub tools: &'a [ToolSpec],
    pub output_schema: Option<&'a Value>,
}

/// Vendor specific wire mapping.
pub trait Backend: Send + Sync + 'static {
    fn kind(&self) -> ProviderKind;

    fn supports_tools(&self) -> bool {
        true
    }

    fn supports_output_schema(&self) -> bool {
        false
    }

    /// URL of the completion endpoint.
    fn endpoint(&self, base_url: &str) -> String;

    /// URL listing available models.
    fn models_endpoint(&self, base_url: &str) -> String;

    /// Authentication and versioning headers.
    fn headers(&self, api_key: Option<&str>) -> Vec<(&'static str, String)>;

    fn build_body(&self, request: &WireRequest<'_>) -> Result<Value>;

    /// Decode and check a successful response body. Undecodable bodies are
    /// [`crate::FunError::MalformedResponse`]; contract violations are
    /// protocol errors.
    fn parse_turn(&self, body: &str) -> Result<Turn>;

    /// Request ID from the lowercase response headers.
    fn request_id(&self, headers: &HashMap<String, String>) -> Option<String>;

    /// Rate limit state from the lowercase response headers.
    fn rate_limits(
        &self,
        headers: &HashMap<String, String>,
        windows: &HeaderWindows,
    ) -> HashMap<String, WindowLimit>;

    /// Whether `model` is listed as available in a models listing.
    fn model_active(&self, body: &str, model: &str) -> Result<bool>;
}

/// Build the provider described by `config`.
pub fn from_config(config: &ProviderConfig, limiter: Arc<RateLimiter>) -> Result<Arc<dyn Provider>> {
    let provider: Arc<dyn Provider> = match config.kind {
        ProviderKind::OpenAi => Arc::new(ProviderAdapter::new(OpenAiBackend, config, limiter)?),
        ProviderKind::Anthropic => {
            Arc::new(ProviderAdapter::new(AnthropicBackend, config, limiter)?)
        }
    };
    Ok(provider)
}

/// Decode a models listing of the form `{"data": [{"id": ...}]}`. An entry
/// with `"active": false` counts as not available.
pub(crate) fn listed_model_active(body: &str, model: &str) -> Result<bool> {
    let listing: Value = serde_json::from_str(body)
        .map_err(|e| crate::FunError::malformed(format!("invalid models listing: {e}"), body))?;
    let Some(models) = listing.get("data").and_then(Value::as_array) else {
        return Err(crate::FunError::malformed("models listing without data", body));
    };
    Ok(models.iter().any(|m| {
        m.get("id").and_then(Value::as_str) == Some(model)
            && m.get("active").and_then(Value::as_bool).unwrap_or(true)
    }))
}
