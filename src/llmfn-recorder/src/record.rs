//! Immutable snapshots handed to observers.

use std::time::Duration;

use indexmap::IndexMap;
use llmfn_protocol::{ConversationMessage, ProviderDescriptor, UsedTime, UsedTokens};
use serde::{Deserialize, Serialize};

/// Snapshot of one logical call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: String,
    pub provider: ProviderDescriptor,
    pub messages: Vec<RecordedMessage>,
    /// Token usage per backend request ID.
    pub used_tokens: IndexMap<String, UsedTokens>,
    /// Time spent per backend request ID.
    pub used_time: IndexMap<String, UsedTime>,
    /// End-to-end duration, or time elapsed so far for a call in flight.
    pub duration: Duration,
    /// The call has returned and this record will not change anymore.
    pub finished: bool,
}

impl CallRecord {
    /// Sum of reported usage over all requests of this call, nested calls excluded.
    pub fn total_used_tokens(&self) -> UsedTokens {
        self.used_tokens
            .values()
            .fold(UsedTokens::default(), |mut acc, t| {
                acc.max_total = acc.max_total.saturating_add(t.max_total);
                acc.max_response = acc.max_response.saturating_add(t.max_response);
                acc.prompt = acc.prompt.saturating_add(t.prompt);
                acc.response = acc.response.saturating_add(t.response);
                acc.total = acc.total.saturating_add(t.total);
                if let Some(n) = t.cache_creation_input_tokens {
                    let sum = acc.cache_creation_input_tokens.get_or_insert(0);
                    *sum = sum.saturating_add(n);
                }
                if let Some(n) = t.cache_read_input_tokens {
                    let sum = acc.cache_read_input_tokens.get_or_insert(0);
                    *sum = sum.saturating_add(n);
                }
                acc
            })
    }

    /// Number of nested calls at any depth.
    pub fn nested_calls(&self) -> usize {
        self.messages
            .iter()
            .flat_map(|m| &m.calls)
            .map(|c| 1 + c.nested_calls())
            .sum()
    }
}

/// Snapshot of one message in a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedMessage {
    #[serde(flatten)]
    pub message: ConversationMessage,
    /// How long the tool ran (tool result messages only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_duration: Option<Duration>,
    /// Calls made by the tool while producing this result.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub calls: Vec<CallRecord>,
}
