//! llmfn engine.
//!
//! Functions whose behavior is supplied by a model backend: a
//! [`TextFunction`] is described by a prompt and examples, may offer tools
//! to the model, and validates its inputs and outputs with JSON Schema.
//!
//! The [`provider::ProviderAdapter`] drives the request/response protocol
//! shared by all backends: token budgeting, admission through a shared
//! [`RateLimiter`], retries, response checks, concurrent tool calls and
//! accounting into a [`CallRecorder`].

pub mod config;
pub mod context;
pub mod error;
pub mod function;
pub mod logging;
pub mod provider;
pub mod retry;
pub mod tools;
pub mod validation;

#[cfg(test)]
mod tests;

pub use config::{EngineConfig, LoggingConfig, ProviderConfig, RetryConfig, StaticWindowConfig};
pub use context::CallContext;
pub use error::{ErrorClass, FunError, Result};
pub use function::{Example, FunctionTool, TextFunction};
pub use logging::init_logging;
pub use provider::{Provider, SupportsOutputSchema, SupportsTools, from_config};
pub use tools::{FnTool, Tool, ToolInvoker, ToolSet};
pub use validation::{JsonSchemaValidator, Validator};

pub use llmfn_protocol::{ConversationMessage, ProviderDescriptor, ProviderKind, Role, ToolCall};
pub use llmfn_ratelimits::RateLimiter;
pub use llmfn_recorder::{CallRecord, CallRecorder, RecordedMessage};
