//! llmfn rate limits.
//!
//! Keyed, multi-window admission control for outgoing model requests.
//! Each key (one per credential and endpoint) owns a set of named windows,
//! either resetting windows learned from response headers or static token
//! buckets. [`RateLimiter::take`] blocks until every window can afford its
//! cost at once; [`RateLimiter::set`] refreshes state and wakes waiters.

pub mod display;
pub mod error;
pub mod headers;
pub mod limiter;
pub mod window;

pub use display::{WindowStatus, format_status, format_status_compact};
pub use error::{RateLimitError, Result};
pub use headers::{HeaderWindows, parse_anthropic_headers, parse_openai_headers, retry_after};
pub use limiter::RateLimiter;
pub use window::WindowLimit;
