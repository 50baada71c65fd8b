//! Explicit call scope threaded through every operation.

use llmfn_recorder::{CallRecorder, RecorderScope};
use tokio_util::sync::CancellationToken;

/// Cancellation and recording scope of a call.
///
/// Cancelling `cancel` aborts every blocking wait below it: rate limiter
/// admission, HTTP requests, retries and tool calls.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub cancel: CancellationToken,
    /// Where calls are recorded. `None` disables recording.
    pub recorder: Option<RecorderScope>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Record top-level calls made in this context with `recorder`.
    pub fn with_recorder(mut self, recorder: &CallRecorder) -> Self {
        self.recorder = Some(recorder.scope());
        self
    }
}
