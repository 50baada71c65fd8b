//! Concurrent dispatch of the tool calls requested in one model turn.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use llmfn_protocol::{ConversationMessage, ToolCall};
use llmfn_recorder::{CallHandle, CallRecorder, MessageHandle};
use serde_json::Value;
use tokio::task::JoinError;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Tool, ToolSet};
use crate::context::CallContext;
use crate::error::{FunError, Result};
use crate::validation::{JsonSchemaValidator, Validator};

/// Runs tool calls and turns their outcomes into tool result messages.
#[derive(Clone)]
pub struct ToolInvoker {
    tools: ToolSet,
    validator: Arc<dyn Validator>,
}

impl std::fmt::Debug for ToolInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolInvoker")
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}

impl ToolInvoker {
    pub fn new(tools: ToolSet) -> Self {
        Self {
            tools,
            validator: Arc::new(JsonSchemaValidator),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn tools(&self) -> &ToolSet {
        &self.tools
    }

    /// Run `calls` concurrently and return one tool result message per call,
    /// in the order of `calls`.
    ///
    /// A failing, unknown or panicking tool never fails the exchange; its
    /// result is error content for the model. When `recording` is given, a
    /// tool result message is started for every call before any tool runs,
    /// and calls made by a tool are recorded under its message.
    pub async fn invoke(
        &self,
        cx: &CallContext,
        recording: Option<(&CallRecorder, CallHandle)>,
        calls: &[ToolCall],
    ) -> Result<Vec<ConversationMessage>> {
        // Siblings are cancelled together when the caller is cancelled or
        // this future is dropped.
        let fanout = cx.cancel.child_token();
        let _guard = fanout.clone().drop_guard();

        let mut pending = Vec::with_capacity(calls.len());
        for call in calls {
            let (scope, message) = match recording {
                Some((recorder, handle)) => {
                    let (scope, message) = recorder.start_tool_message(handle, call.id.clone());
                    (Some(scope), Some(message))
                }
                None => (None, None),
            };
            let tool_cx = CallContext {
                cancel: fanout.child_token(),
                recorder: scope,
            };
            let tool = self.tools.get(&call.name);
            let validator = Arc::clone(&self.validator);
            let call = call.clone();

            debug!(tool = %call.name, tool_use_id = %call.id, "Dispatching tool call");
            let task = tokio::spawn(async move {
                let started = Instant::now();
                let result = run_tool(tool, validator.as_ref(), &tool_cx, &call).await;
                (result, started.elapsed())
            });
            pending.push((message, task));
        }

        let finished = join_all(
            pending
                .into_iter()
                .map(|(message, task)| async move { (message, task.await) }),
        )
        .await;

        let mut results = Vec::with_capacity(calls.len());
        for (call, (message, joined)) in calls.iter().zip(finished) {
            let (content, is_error, duration) = outcome(call, joined);
            if let (Some((recorder, _)), Some(message)) = (recording, message) {
                record_outcome(recorder, message, &content, is_error, duration);
            }
            results.push(if is_error {
                ConversationMessage::tool_error(call.id.clone(), content)
            } else {
                ConversationMessage::tool_result(call.id.clone(), content)
            });
        }

        if cx.cancel.is_cancelled() {
            return Err(FunError::Cancelled);
        }
        Ok(results)
    }
}

async fn run_tool(
    tool: Option<Arc<dyn Tool>>,
    validator: &dyn Validator,
    cx: &CallContext,
    call: &ToolCall,
) -> Result<Value> {
    let tool = tool.ok_or_else(|| FunError::ToolNotFound {
        name: call.name.clone(),
    })?;
    validator.validate(&tool.input_schema(), &call.input)?;

    tokio::select! {
        result = tool.call(cx, call.input.clone()) => result,
        _ = cx.cancel.cancelled() => Err(FunError::Cancelled),
    }
}

fn outcome(
    call: &ToolCall,
    joined: std::result::Result<(Result<Value>, Duration), JoinError>,
) -> (String, bool, Option<Duration>) {
    match joined {
        Ok((Ok(output), duration)) => (render_output(output), false, Some(duration)),
        Ok((Err(error), duration)) => {
            warn!(tool = %call.name, tool_use_id = %call.id, error = %error, "Tool call failed");
            (format!("Error: {error}"), true, Some(duration))
        }
        Err(join_error) => {
            let message = if join_error.is_panic() {
                format!("tool panicked: {}", panic_message(join_error.into_panic()))
            } else {
                "tool task was aborted".to_string()
            };
            warn!(tool = %call.name, tool_use_id = %call.id, error = %message, "Tool call failed");
            (format!("Error: {message}"), true, None)
        }
    }
}

fn record_outcome(
    recorder: &CallRecorder,
    message: MessageHandle,
    content: &str,
    is_error: bool,
    duration: Option<Duration>,
) {
    recorder.set_content(message, content, is_error);
    if let Some(duration) = duration {
        recorder.set_tool_duration(message, duration);
    }
}

/// Strings are passed to the model as they are, other values as JSON.
fn render_output(output: Value) -> String {
    match output {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
