//! Token and time accounting for a single backend request.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tokens used by one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsedTokens {
    /// Token estimate used for admission (prompt estimate plus response margin).
    pub max_total: u64,
    /// Maximum response length requested from the backend.
    pub max_response: u64,
    /// Prompt tokens reported by the backend.
    pub prompt: u64,
    /// Response tokens reported by the backend.
    pub response: u64,
    /// Total tokens reported by the backend.
    pub total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
}

impl UsedTokens {
    /// Whether the reported total is consistent with its parts.
    pub fn is_consistent(&self) -> bool {
        self.prompt.checked_add(self.response) == Some(self.total)
    }
}

/// Time spent on one request.
///
/// Prompt and response times are only known when the backend reports them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsedTime {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<Duration>,
}

impl UsedTime {
    pub fn with_total(total: Duration) -> Self {
        Self {
            total: Some(total),
            ..Self::default()
        }
    }
}
