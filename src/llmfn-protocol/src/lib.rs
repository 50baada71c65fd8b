//! llmfn Protocol - data types shared between the rate limiter, the call
//! recorder and the provider engine.
//!
//! Nothing in this crate performs I/O. The types describe conversation
//! history, token and time accounting, and the provider configuration
//! snapshot stored with every recorded call.

pub mod descriptor;
pub mod messages;
pub mod usage;

pub use descriptor::{ProviderDescriptor, ProviderKind};
pub use messages::{ConversationMessage, Role, ToolCall, ToolSpec};
pub use usage::{UsedTime, UsedTokens};

/// Rate limiter window counting requests.
pub const REQUESTS_WINDOW: &str = "requests";

/// Rate limiter window counting tokens.
pub const TOKENS_WINDOW: &str = "tokens";
