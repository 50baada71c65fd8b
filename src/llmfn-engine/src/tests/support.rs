//! Scripted backends for protocol tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use crate::config::{ProviderConfig, RetryConfig};
use crate::provider::{Provider, from_config};
use crate::{ProviderKind, RateLimiter};

/// Serves a fixed sequence of responses; the last one repeats.
pub struct Scripted {
    responses: Vec<ResponseTemplate>,
    next: AtomicUsize,
}

impl Scripted {
    pub fn new(responses: Vec<ResponseTemplate>) -> Self {
        assert!(!responses.is_empty());
        Self {
            responses,
            next: AtomicUsize::new(0),
        }
    }
}

impl Respond for Scripted {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let i = self.next.fetch_add(1, Ordering::SeqCst);
        self.responses[i.min(self.responses.len() - 1)].clone()
    }
}

/// Mount a scripted chat completions endpoint.
pub async fn mount_openai(server: &MockServer, responses: Vec<ResponseTemplate>) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(Scripted::new(responses))
        .mount(server)
        .await;
}

/// Mount a scripted messages endpoint.
pub async fn mount_anthropic(server: &MockServer, responses: Vec<ResponseTemplate>) {
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(Scripted::new(responses))
        .mount(server)
        .await;
}

pub fn config(kind: ProviderKind, server: &MockServer) -> ProviderConfig {
    let mut config = ProviderConfig::new(kind, "test-model", 8192, 256);
    config.base_url = Some(server.uri());
    config.api_key = Some("test-key".to_string());
    config.max_exchanges = 5;
    config.timeout_seconds = 10;
    config.retry = RetryConfig {
        max_attempts: 3,
        min_wait_ms: 1,
        max_wait_ms: 20,
        multiplier: 2.0,
        jitter: 0.0,
    };
    config
}

pub fn provider(config: &ProviderConfig) -> Arc<dyn Provider> {
    provider_with(config, Arc::new(RateLimiter::new()))
}

pub fn provider_with(config: &ProviderConfig, limiter: Arc<RateLimiter>) -> Arc<dyn Provider> {
    match from_config(config, limiter) {
        Ok(provider) => provider,
        Err(e) => panic!("invalid test config: {e}"),
    }
}

/// A successful response carrying a request ID.
pub fn ok(request_id: &str, body: Value) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("x-request-id", request_id)
        .insert_header("request-id", request_id)
        .set_body_json(body)
}

pub fn completion(finish_reason: &str, message: Value) -> Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "model": "test-model",
        "choices": [{"index": 0, "message": message, "finish_reason": finish_reason}],
        "usage": {"prompt_tokens": 50, "completion_tokens": 10, "total_tokens": 60}
    })
}

pub fn final_answer(text: &str) -> Value {
    completion("stop", json!({"role": "assistant", "content": text}))
}

pub fn tool_calls(calls: &[(&str, &str, Value)]) -> Value {
    let calls: Vec<Value> = calls
        .iter()
        .map(|(id, name, input)| {
            json!({
                "id": id,
                "type": "function",
                "function": {"name": name, "arguments": input.to_string()}
            })
        })
        .collect();
    completion(
        "tool_calls",
        json!({"role": "assistant", "content": null, "tool_calls": calls}),
    )
}

pub fn anthropic_message(stop_reason: &str, content: Value) -> Value {
    json!({
        "id": "msg_test",
        "type": "message",
        "role": "assistant",
        "model": "test-model",
        "content": content,
        "stop_reason": stop_reason,
        "usage": {"input_tokens": 40, "output_tokens": 8}
    })
}

/// JSON bodies of the requests a server received, in order.
pub async fn request_bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.as_str() == "POST")
        .map(|r| serde_json::from_slice(&r.body).unwrap_or(Value::Null))
        .collect()
}
