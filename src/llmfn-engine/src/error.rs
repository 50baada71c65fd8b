//! Error types for llmfn engine.

use llmfn_ratelimits::RateLimitError;
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, FunError>;

/// Main error type for llmfn engine.
#[derive(Debug, Error)]
pub enum FunError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Already initialized")]
    AlreadyInitialized,

    #[error("Not initialized")]
    NotInitialized,

    #[error("Multiple system messages")]
    MultipleSystemMessages,

    #[error("Model not active: {model}")]
    ModelNotActive { model: String },

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Transport errors
    #[error("API request failed: {0}")]
    ApiRequestFailed(#[from] reqwest::Error),

    #[error("API response error: status {status}: {body}")]
    ApiResponseError { status: u16, body: String },

    #[error("Malformed response: {message}")]
    MalformedResponse { message: String, body: String },

    #[error("Missing request ID")]
    MissingRequestId,

    #[error("Gave up retrying after {attempts} attempts: {message}")]
    GaveUpRetrying {
        attempts: u32,
        status: Option<u16>,
        body: String,
        message: String,
    },

    // Rate errors
    #[error("Rate limit: {0}")]
    RateLimit(#[from] RateLimitError),

    // Protocol errors
    #[error("Unexpected role: expected {expected}, got {got}")]
    UnexpectedRole { expected: String, got: String },

    #[error("Unexpected stop reason: {reason}")]
    UnexpectedStop { reason: String },

    #[error("Unexpected message type: {message}")]
    UnexpectedMessageType { message: String },

    #[error("Unexpected number of messages: expected {expected}, got {got}")]
    UnexpectedNumberOfMessages { expected: usize, got: usize },

    #[error("Unexpected token count: {message}")]
    UnexpectedTokenCount { message: String },

    #[error("Tool calls requested without calls")]
    ToolCallsWithoutCalls,

    #[error("Refused: {refusal}")]
    Refused { refusal: String },

    // Tool errors
    #[error("Tool not found: {name}")]
    ToolNotFound { name: String },

    #[error("Tool {tool} failed: {message}")]
    ToolFailed { tool: String, message: String },

    // Validation errors
    #[error("Schema validation failed: {message}")]
    SchemaValidationFailed { message: String },

    #[error("Invalid JSON schema: {message}")]
    InvalidSchema { message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Budget errors
    #[error("Max context length exceeded: {used} > {limit} tokens")]
    MaxContextLengthExceeded { used: u64, limit: u64 },

    #[error("Max response length exceeded: {limit} tokens")]
    MaxResponseLengthExceeded { limit: u64 },

    #[error("Reached max exchanges: {max}")]
    ReachedMaxExchanges { max: u32 },

    #[error("Operation cancelled")]
    Cancelled,
}

/// Broad class of an error, for callers deciding how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Programmer errors. Never retried.
    Configuration,
    /// Network failures and malformed responses. Retried with backoff.
    Transport,
    /// The request can never fit the rate limit.
    Rate,
    /// The backend broke its contract. Never retried.
    Protocol,
    Tool,
    /// The caller may retry, skip or quarantine the input.
    Validation,
    /// The model ran out of context, response length or exchanges.
    Budget,
    Cancelled,
}

impl FunError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a malformed response error.
    pub fn malformed(message: impl Into<String>, body: impl Into<String>) -> Self {
        Self::MalformedResponse {
            message: message.into(),
            body: body.into(),
        }
    }

    /// Create an unexpected message type error.
    pub fn unexpected_message(message: impl Into<String>) -> Self {
        Self::UnexpectedMessageType {
            message: message.into(),
        }
    }

    /// Create an unexpected role error.
    pub fn unexpected_role(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::UnexpectedRole {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create a tool failure.
    pub fn tool_failed(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolFailed {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Config(_)
            | Self::AlreadyInitialized
            | Self::NotInitialized
            | Self::MultipleSystemMessages
            | Self::ModelNotActive { .. }
            | Self::TomlParse(_)
            | Self::Io(_) => ErrorClass::Configuration,
            Self::ApiRequestFailed(_)
            | Self::ApiResponseError { .. }
            | Self::MalformedResponse { .. }
            | Self::MissingRequestId
            | Self::GaveUpRetrying { .. } => ErrorClass::Transport,
            Self::RateLimit(RateLimitError::Cancelled) | Self::Cancelled => ErrorClass::Cancelled,
            Self::RateLimit(_) => ErrorClass::Rate,
            Self::UnexpectedRole { .. }
            | Self::UnexpectedStop { .. }
            | Self::UnexpectedMessageType { .. }
            | Self::UnexpectedNumberOfMessages { .. }
            | Self::UnexpectedTokenCount { .. }
            | Self::ToolCallsWithoutCalls
            | Self::Refused { .. } => ErrorClass::Protocol,
            Self::ToolNotFound { .. } | Self::ToolFailed { .. } => ErrorClass::Tool,
            Self::SchemaValidationFailed { .. } | Self::InvalidSchema { .. } | Self::Json(_) => {
                ErrorClass::Validation
            }
            Self::MaxContextLengthExceeded { .. }
            | Self::MaxResponseLengthExceeded { .. }
            | Self::ReachedMaxExchanges { .. } => ErrorClass::Budget,
        }
    }

    /// Check if a single request failing with this error may be retried.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::ApiRequestFailed(_) | Self::MalformedResponse { .. } | Self::MissingRequestId => {
                true
            }
            Self::ApiResponseError { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Check if this error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.class() == ErrorClass::Cancelled
    }
}
