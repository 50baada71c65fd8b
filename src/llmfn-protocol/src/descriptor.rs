//! Provider descriptor stored with every recorded call.

use serde::{Deserialize, Serialize};

/// Wire format spoken by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI chat completions and compatible servers (Groq, Ollama, ...).
    OpenAi,
    /// Anthropic messages API.
    Anthropic,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the provider configuration a call was made with.
///
/// Contains no credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub kind: ProviderKind,
    pub model: String,
    pub base_url: String,
    /// Maximum number of tokens in prompt plus response.
    pub max_context_length: u64,
    /// Maximum number of tokens in a response.
    pub max_response_length: u64,
    /// Maximum number of request/response cycles in one call.
    pub max_exchanges: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl ProviderDescriptor {
    /// Rate limiter key for this provider: one per endpoint and model.
    pub fn rate_limit_key(&self) -> String {
        format!("{}|{}|{}", self.kind, self.base_url, self.model)
    }
}
