//! The provider protocol, shared by every backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use llmfn_protocol::{
    ConversationMessage, ProviderDescriptor, REQUESTS_WINDOW, Role, TOKENS_WINDOW, ToolSpec,
    UsedTime, UsedTokens,
};
use llmfn_ratelimits::{HeaderWindows, RateLimiter, WindowLimit, retry_after};
use llmfn_recorder::{CallHandle, CallRecorder};
use parking_lot::RwLock;
use reqwest::header::{CONTENT_TYPE, HeaderMap};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Backend, Provider, StopReason, SupportsOutputSchema, SupportsTools, Turn, WireRequest};
use crate::config::ProviderConfig;
use crate::context::CallContext;
use crate::error::{FunError, Result};
use crate::retry::{AttemptError, Retry};
use crate::tools::{ToolInvoker, ToolSet};

/// Characters per token assumed when estimating prompt size.
const CHARS_PER_TOKEN: u64 = 4;

/// A [`Provider`] speaking the wire format of `B`.
pub struct ProviderAdapter<B> {
    backend: B,
    descriptor: ProviderDescriptor,
    api_key: Option<String>,
    rate_limit_key: String,
    static_limits: HashMap<String, WindowLimit>,
    header_windows: HeaderWindows,
    check_model: bool,
    retry: Retry,
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    state: RwLock<AdapterState>,
}

#[derive(Default)]
struct AdapterState {
    seed: Option<Vec<ConversationMessage>>,
    invoker: Option<ToolInvoker>,
    tool_specs: Vec<ToolSpec>,
    output_schema: Option<Value>,
}

/// A successful, decoded response.
struct Reply {
    turn: Turn,
    request_id: String,
    elapsed: Duration,
}

/// A response before its status is interpreted.
struct RawResponse {
    status: StatusCode,
    headers: HashMap<String, String>,
    body: String,
    elapsed: Duration,
}

impl<B: Backend> ProviderAdapter<B> {
    pub fn new(backend: B, config: &ProviderConfig, limiter: Arc<RateLimiter>) -> Result<Self> {
        config.validate().map_err(FunError::Config)?;
        if config.kind != backend.kind() {
            return Err(FunError::config(format!(
                "{} config given to a {} backend",
                config.kind,
                backend.kind()
            )));
        }

        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;

        Ok(Self {
            backend,
            descriptor: config.descriptor(),
            api_key: config.resolve_api_key(),
            rate_limit_key: config.rate_limit_key(),
            static_limits: config.static_limits(),
            header_windows: config.header_windows(),
            check_model: config.check_model,
            retry: Retry::new(config.retry.clone()),
            client,
            limiter,
            state: RwLock::new(AdapterState::default()),
        })
    }

    /// Key under which this provider's requests are rate limited.
    pub fn rate_limit_key(&self) -> &str {
        &self.rate_limit_key
    }

    /// Token estimate for a request payload: the payload size in tokens plus
    /// room for two full responses.
    fn estimate_tokens(&self, payload: &str) -> u64 {
        payload.chars().count() as u64 / CHARS_PER_TOKEN
            + 2 * self.descriptor.max_response_length
    }

    async fn run(
        &self,
        cx: &CallContext,
        mut conversation: Vec<ConversationMessage>,
        recording: Option<(&CallRecorder, CallHandle)>,
    ) -> Result<String> {
        let (invoker, tool_specs, output_schema) = {
            let state = self.state.read();
            (
                state.invoker.clone(),
                state.tool_specs.clone(),
                state.output_schema.clone(),
            )
        };
        let record = |message: &ConversationMessage| {
            if let Some((recorder, call)) = recording {
                recorder.add_message(call, message.clone());
            }
        };

        let max_exchanges = self.descriptor.max_exchanges;
        for exchange in 1..=max_exchanges {
            let body = self.backend.build_body(&WireRequest {
                descriptor: &self.descriptor,
                messages: &conversation,
                tools: &tool_specs,
                output_schema: output_schema.as_ref(),
            })?;
            let payload = serde_json::to_string(&body)?;

            let estimate = self.estimate_tokens(&payload);
            if estimate > self.descriptor.max_context_length {
                return Err(FunError::MaxContextLengthExceeded {
                    used: estimate,
                    limit: self.descriptor.max_context_length,
                });
            }

            self.limiter
                .take(
                    &cx.cancel,
                    &self.rate_limit_key,
                    &[(REQUESTS_WINDOW, 1), (TOKENS_WINDOW, estimate)],
                )
                .await?;

            debug!(
                model = %self.descriptor.model,
                exchange,
                max_exchanges,
                estimate,
                "Sending exchange"
            );
            let reply = self.send(cx, &payload).await?;
            let turn = reply.turn;

            let tokens = UsedTokens {
                max_total: estimate,
                max_response: self.descriptor.max_response_length,
                ..turn.usage
            };
            let time = if turn.time.total.is_some() {
                turn.time
            } else {
                UsedTime {
                    total: Some(reply.elapsed),
                    ..turn.time
                }
            };
            if let Some((recorder, call)) = recording {
                recorder.record_usage(call, reply.request_id.as_str(), tokens, time);
            }
            self.check_usage(&tokens)?;

            match turn.stop {
                StopReason::EndTurn => {
                    record(&ConversationMessage::assistant(turn.content.as_str()));
                    return Ok(turn.content);
                }
                StopReason::Refusal => {
                    let refusal = turn.refusal.unwrap_or(turn.content);
                    record(&ConversationMessage::refusal(refusal.as_str()));
                    return Err(FunError::Refused { refusal });
                }
                StopReason::MaxTokens => {
                    return Err(FunError::MaxResponseLengthExceeded {
                        limit: self.descriptor.max_response_length,
                    });
                }
                StopReason::ToolUse => {
                    if turn.tool_calls.is_empty() {
                        return Err(FunError::ToolCallsWithoutCalls);
                    }
                    if !turn.content.is_empty() {
                        let message = ConversationMessage::assistant(turn.content);
                        record(&message);
                        conversation.push(message);
                    }
                    for call in &turn.tool_calls {
                        let message = ConversationMessage::tool_use(call);
                        record(&message);
                        conversation.push(message);
                    }

                    // Calls to tools that were never offered are answered
                    // with error content like any other unknown tool.
                    let invoker = invoker
                        .clone()
                        .unwrap_or_else(|| ToolInvoker::new(ToolSet::new()));
                    let results = invoker.invoke(cx, recording, &turn.tool_calls).await?;
                    conversation.extend(results);
                }
            }
        }

        Err(FunError::ReachedMaxExchanges { max: max_exchanges })
    }

    fn check_usage(&self, tokens: &UsedTokens) -> Result<()> {
        if !tokens.is_consistent() {
            return Err(FunError::UnexpectedTokenCount {
                message: format!(
                    "total {} is not prompt {} plus response {}",
                    tokens.total, tokens.prompt, tokens.response
                ),
            });
        }
        if tokens.response > tokens.max_response {
            return Err(FunError::UnexpectedTokenCount {
                message: format!(
                    "response {} exceeds max response length {}",
                    tokens.response, tokens.max_response
                ),
            });
        }
        if tokens.total > self.descriptor.max_context_length {
            return Err(FunError::MaxContextLengthExceeded {
                used: tokens.total,
                limit: self.descriptor.max_context_length,
            });
        }
        Ok(())
    }

    async fn send(&self, cx: &CallContext, payload: &str) -> Result<Reply> {
        let url = self.backend.endpoint(&self.descriptor.base_url);
        self.retry
            .execute(&cx.cancel, |attempt| {
                let url = url.as_str();
                async move {
                    let raw = self.request(cx, Method::POST, url, Some(payload), attempt).await?;
                    let Some(request_id) = self.backend.request_id(&raw.headers) else {
                        return Err(AttemptError::response(
                            FunError::MissingRequestId,
                            raw.status.as_u16(),
                            raw.body,
                            None,
                        ));
                    };
                    let turn = match self.backend.parse_turn(&raw.body) {
                        Ok(turn) => turn,
                        Err(e) if e.is_retriable() => {
                            return Err(AttemptError::response(
                                e,
                                raw.status.as_u16(),
                                raw.body,
                                None,
                            ));
                        }
                        Err(e) => return Err(e.into()),
                    };
                    Ok(Reply {
                        turn,
                        request_id,
                        elapsed: raw.elapsed,
                    })
                }
            })
            .await
    }

    /// One HTTP round trip. Rate limit headers are applied from every
    /// response; 429 and 5xx responses are retried.
    async fn request(
        &self,
        cx: &CallContext,
        method: Method,
        url: &str,
        payload: Option<&str>,
        attempt: u32,
    ) -> std::result::Result<RawResponse, AttemptError> {
        let started = Instant::now();
        let mut request = self.client.request(method, url);
        for (name, value) in self.backend.headers(self.api_key.as_deref()) {
            request = request.header(name, value);
        }
        if let Some(payload) = payload {
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(payload.to_string());
        }

        debug!(url, attempt, "Sending request");
        let response = tokio::select! {
            response = request.send() => response.map_err(|e| AttemptError::retry(e.into()))?,
            _ = cx.cancel.cancelled() => return Err(FunError::Cancelled.into()),
        };

        let status = response.status();
        let headers = lowercase_headers(response.headers());
        let limits = self.backend.rate_limits(&headers, &self.header_windows);
        if !limits.is_empty() {
            self.limiter.set(&self.rate_limit_key, &limits);
        }

        let body = tokio::select! {
            body = response.text() => body.map_err(|e| AttemptError::retry(e.into()))?,
            _ = cx.cancel.cancelled() => return Err(FunError::Cancelled.into()),
        };
        let elapsed = started.elapsed();
        debug!(status = %status, elapsed_ms = elapsed.as_millis(), "Response received");

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            let error = FunError::ApiResponseError {
                status: status.as_u16(),
                body: body.clone(),
            };
            return Err(AttemptError::response(
                error,
                status.as_u16(),
                body,
                retry_after(&headers),
            ));
        }
        if !status.is_success() {
            warn!(status = %status, url, body = %body, "API request failed");
            return Err(FunError::ApiResponseError {
                status: status.as_u16(),
                body,
            }
            .into());
        }

        Ok(RawResponse {
            status,
            headers,
            body,
            elapsed,
        })
    }

    async fn check_model_active(&self, cx: &CallContext) -> Result<()> {
        let url = self.backend.models_endpoint(&self.descriptor.base_url);
        let raw = self
            .retry
            .execute(&cx.cancel, |attempt| {
                let url = url.as_str();
                async move { self.request(cx, Method::GET, url, None, attempt).await }
            })
            .await?;
        if self.backend.model_active(&raw.body, &self.descriptor.model)? {
            Ok(())
        } else {
            Err(FunError::ModelNotActive {
                model: self.descriptor.model.clone(),
            })
        }
    }
}

/// A seed holds at most one system message, and only in first position.
/// Tool messages belong to exchanges, not seeds.
fn validate_seed(seed: &[ConversationMessage]) -> Result<()> {
    for (i, message) in seed.iter().enumerate() {
        match message.role {
            Role::System if i > 0 => return Err(FunError::MultipleSystemMessages),
            Role::System | Role::User | Role::Assistant => {}
            Role::ToolUse | Role::ToolResult => {
                return Err(FunError::unexpected_role(
                    "system, user or assistant",
                    message.role.as_str(),
                ));
            }
        }
    }
    Ok(())
}

/// Header names in a `HeaderMap` are already lowercase.
fn lowercase_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

#[async_trait]
impl<B: Backend> Provider for ProviderAdapter<B> {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn init(&self, cx: &CallContext, seed: Vec<ConversationMessage>) -> Result<()> {
        if self.state.read().seed.is_some() {
            return Err(FunError::AlreadyInitialized);
        }
        validate_seed(&seed)?;

        if !self.static_limits.is_empty() {
            self.limiter.ensure(&self.rate_limit_key, &self.static_limits);
        }
        if self.check_model {
            self.check_model_active(cx).await?;
        }

        let mut state = self.state.write();
        if state.seed.is_some() {
            return Err(FunError::AlreadyInitialized);
        }
        debug!(model = %self.descriptor.model, messages = seed.len(), "Provider initialized");
        state.seed = Some(seed);
        Ok(())
    }

    async fn exchange(&self, cx: &CallContext, message: ConversationMessage) -> Result<String> {
        let mut conversation = self
            .state
            .read()
            .seed
            .clone()
            .ok_or(FunError::NotInitialized)?;
        conversation.push(message);

        let recording = cx.recorder.as_ref().map(|scope| {
            let call = scope.new_call(Uuid::new_v4().to_string(), self.descriptor.clone());
            (scope.recorder().clone(), call)
        });
        let recording = recording.as_ref().map(|(recorder, call)| (recorder, *call));
        if let Some((recorder, call)) = recording {
            for message in &conversation {
                recorder.add_message(call, message.clone());
            }
        }

        let started = Instant::now();
        let result = self.run(cx, conversation, recording).await;
        if let Some((recorder, call)) = recording {
            recorder.record_call(call);
        }

        match &result {
            Ok(_) => info!(
                model = %self.descriptor.model,
                duration_ms = started.elapsed().as_millis(),
                "Exchange completed"
            ),
            Err(e) => warn!(model = %self.descriptor.model, error = %e, "Exchange failed"),
        }
        result
    }

    fn tools(&self) -> Option<&dyn SupportsTools> {
        self.backend.supports_tools().then_some(self as &dyn SupportsTools)
    }

    fn output_schema(&self) -> Option<&dyn SupportsOutputSchema> {
        self.backend
            .supports_output_schema()
            .then_some(self as &dyn SupportsOutputSchema)
    }
}

#[async_trait]
impl<B: Backend> SupportsTools for ProviderAdapter<B> {
    async fn init_tools(&self, _cx: &CallContext, tools: ToolSet) -> Result<()> {
        let mut state = self.state.write();
        if state.invoker.is_some() {
            return Err(FunError::AlreadyInitialized);
        }
        state.tool_specs = tools.specs();
        state.invoker = Some(ToolInvoker::new(tools));
        Ok(())
    }
}

#[async_trait]
impl<B: Backend> SupportsOutputSchema for ProviderAdapter<B> {
    async fn init_output_schema(&self, _cx: &CallContext, schema: Value) -> Result<()> {
        let mut state = self.state.write();
        if state.output_schema.is_some() {
            return Err(FunError::AlreadyInitialized);
        }
        state.output_schema = Some(schema);
        Ok(())
    }
}
