//! Call tree recorder.
//!
//! Calls live in an arena addressed by [`CallHandle`]. Every call node and
//! every message node has its own lock; snapshots walk the tree top-down and
//! hold each lock only while copying that node.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use llmfn_protocol::{ConversationMessage, ProviderDescriptor, UsedTime, UsedTokens};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tracing::trace;

use crate::record::{CallRecord, RecordedMessage};

/// Handle of a call in the recorder arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallHandle(usize);

/// Handle of a message within a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageHandle {
    call: CallHandle,
    index: usize,
}

impl MessageHandle {
    pub fn call(&self) -> CallHandle {
        self.call
    }
}

#[derive(Debug)]
struct MessageNode {
    message: ConversationMessage,
    tool_duration: Option<Duration>,
    calls: Vec<CallHandle>,
}

#[derive(Debug)]
struct CallState {
    id: String,
    provider: ProviderDescriptor,
    messages: Vec<Arc<Mutex<MessageNode>>>,
    used_tokens: IndexMap<String, UsedTokens>,
    used_time: IndexMap<String, UsedTime>,
    started: Instant,
    /// Set once the call is recorded.
    frozen: Option<Arc<CallRecord>>,
}

#[derive(Debug)]
struct CallNode {
    parent: Option<MessageHandle>,
    state: Mutex<CallState>,
}

#[derive(Debug, Default)]
struct Inner {
    arena: RwLock<Vec<Arc<CallNode>>>,
    top_level: Mutex<Vec<CallHandle>>,
    observers: Mutex<Vec<UnboundedSender<Vec<CallRecord>>>>,
}

/// Which calls a snapshot includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Everything, with elapsed durations for calls in flight.
    Live,
    /// Recorded calls only.
    Final,
}

/// Records a tree of calls. Cheap to clone; clones share the same tree.
#[derive(Debug, Clone, Default)]
pub struct CallRecorder {
    inner: Arc<Inner>,
}

impl CallRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope recording top-level calls.
    pub fn scope(&self) -> RecorderScope {
        RecorderScope {
            recorder: self.clone(),
            parent: None,
        }
    }

    /// Register an observer. It receives a snapshot of all top-level calls,
    /// including calls in flight, after every change. Observers whose
    /// receiver is dropped are removed.
    pub fn notify(&self, observer: UnboundedSender<Vec<CallRecord>>) {
        self.inner.observers.lock().push(observer);
    }

    /// Recorded top-level calls in the order they started.
    pub fn calls(&self) -> Vec<CallRecord> {
        self.top_level(Mode::Final)
    }

    /// All top-level calls in their current state.
    pub fn snapshot(&self) -> Vec<CallRecord> {
        self.top_level(Mode::Live)
    }

    fn node(&self, call: CallHandle) -> Arc<CallNode> {
        Arc::clone(&self.inner.arena.read()[call.0])
    }

    fn message(&self, handle: MessageHandle) -> Arc<Mutex<MessageNode>> {
        let node = self.node(handle.call);
        let state = node.state.lock();
        let message = Arc::clone(&state.messages[handle.index]);
        message
    }

    fn new_call(
        &self,
        parent: Option<MessageHandle>,
        id: String,
        provider: ProviderDescriptor,
    ) -> CallHandle {
        let node = Arc::new(CallNode {
            parent,
            state: Mutex::new(CallState {
                id,
                provider,
                messages: Vec::new(),
                used_tokens: IndexMap::new(),
                used_time: IndexMap::new(),
                started: Instant::now(),
                frozen: None,
            }),
        });
        let handle = {
            let mut arena = self.inner.arena.write();
            arena.push(node);
            CallHandle(arena.len() - 1)
        };

        match parent {
            Some(parent) => self.message(parent).lock().calls.push(handle),
            None => self.inner.top_level.lock().push(handle),
        }
        self.changed();
        handle
    }

    /// Append a message to a call.
    pub fn add_message(&self, call: CallHandle, message: ConversationMessage) -> MessageHandle {
        let index = {
            let node = self.node(call);
            let mut state = node.state.lock();
            state.messages.push(Arc::new(Mutex::new(MessageNode {
                message,
                tool_duration: None,
                calls: Vec::new(),
            })));
            state.messages.len() - 1
        };
        self.changed();
        MessageHandle { call, index }
    }

    /// Append a pending tool result message and return a scope recording
    /// calls made by the tool as children of that message.
    pub fn start_tool_message(
        &self,
        call: CallHandle,
        tool_use_id: impl Into<String>,
    ) -> (RecorderScope, MessageHandle) {
        let handle = self.add_message(call, ConversationMessage::tool_result(tool_use_id, ""));
        let scope = RecorderScope {
            recorder: self.clone(),
            parent: Some(handle),
        };
        (scope, handle)
    }

    /// Set the content of a tool result message.
    pub fn set_content(&self, handle: MessageHandle, content: impl Into<String>, is_error: bool) {
        {
            let message = self.message(handle);
            let mut message = message.lock();
            message.message.content = content.into();
            message.message.is_error = is_error;
        }
        self.changed();
    }

    /// Set how long the tool behind a tool result message ran.
    pub fn set_tool_duration(&self, handle: MessageHandle, duration: Duration) {
        self.message(handle).lock().tool_duration = Some(duration);
        self.changed();
    }

    /// Record usage and timing of one backend request.
    pub fn record_usage(
        &self,
        call: CallHandle,
        request_id: impl Into<String>,
        tokens: UsedTokens,
        time: UsedTime,
    ) {
        let request_id = request_id.into();
        {
            let node = self.node(call);
            let mut state = node.state.lock();
            state.used_tokens.insert(request_id.clone(), tokens);
            state.used_time.insert(request_id, time);
        }
        self.changed();
    }

    /// Finalize a call. Its snapshot is frozen and further changes to it are
    /// not observed.
    pub fn record_call(&self, call: CallHandle) {
        let node = self.node(call);
        if node.state.lock().frozen.is_some() {
            return;
        }
        let mut record = self.snapshot_call(&node, Mode::Live);
        record.finished = true;
        trace!(call_id = %record.id, duration_ms = record.duration.as_millis(), "Call recorded");
        node.state.lock().frozen = Some(Arc::new(record));
        self.changed();
    }

    /// Parent message of a call, if it was made by a tool.
    pub fn parent(&self, call: CallHandle) -> Option<MessageHandle> {
        self.node(call).parent
    }

    fn top_level(&self, mode: Mode) -> Vec<CallRecord> {
        let handles = self.inner.top_level.lock().clone();
        self.snapshot_calls(&handles, mode)
    }

    fn snapshot_calls(&self, handles: &[CallHandle], mode: Mode) -> Vec<CallRecord> {
        handles
            .iter()
            .filter_map(|handle| {
                let node = self.node(*handle);
                if mode == Mode::Final && node.state.lock().frozen.is_none() {
                    return None;
                }
                Some(self.snapshot_call(&node, mode))
            })
            .collect()
    }

    fn snapshot_call(&self, node: &CallNode, mode: Mode) -> CallRecord {
        let (mut record, messages) = {
            let state = node.state.lock();
            if let Some(frozen) = &state.frozen {
                return CallRecord::clone(frozen);
            }
            let record = CallRecord {
                id: state.id.clone(),
                provider: state.provider.clone(),
                messages: Vec::with_capacity(state.messages.len()),
                used_tokens: state.used_tokens.clone(),
                used_time: state.used_time.clone(),
                duration: state.started.elapsed(),
                finished: false,
            };
            (record, state.messages.clone())
        };

        for message in messages {
            let (snapshot, children) = {
                let message = message.lock();
                (
                    RecordedMessage {
                        message: message.message.clone(),
                        tool_duration: message.tool_duration,
                        calls: Vec::new(),
                    },
                    message.calls.clone(),
                )
            };
            record.messages.push(RecordedMessage {
                calls: self.snapshot_calls(&children, mode),
                ..snapshot
            });
        }
        record
    }

    /// Send a fresh snapshot to every observer. The observer lock is held
    /// while the snapshot is taken so snapshots are delivered in the order
    /// they were taken.
    fn changed(&self) {
        let mut observers = self.inner.observers.lock();
        if observers.is_empty() {
            return;
        }
        let snapshot = self.snapshot();
        observers.retain(|observer| observer.send(snapshot.clone()).is_ok());
    }
}

/// Where new calls are recorded: top level, or under a tool result message.
#[derive(Debug, Clone)]
pub struct RecorderScope {
    recorder: CallRecorder,
    parent: Option<MessageHandle>,
}

impl RecorderScope {
    /// Begin recording a call in this scope.
    pub fn new_call(&self, id: impl Into<String>, provider: ProviderDescriptor) -> CallHandle {
        self.recorder.new_call(self.parent, id.into(), provider)
    }

    pub fn recorder(&self) -> &CallRecorder {
        &self.recorder
    }

    pub fn parent(&self) -> Option<MessageHandle> {
        self.parent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmfn_protocol::{ProviderKind, Role, ToolCall};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn provider() -> ProviderDescriptor {
        ProviderDescriptor {
            kind: ProviderKind::OpenAi,
            model: "gpt-test".to_string(),
            base_url: "http://localhost".to_string(),
            max_context_length: 1000,
            max_response_length: 100,
            max_exchanges: 10,
            temperature: Some(0.0),
            seed: Some(42),
        }
    }

    #[test]
    fn test_calls_only_returns_recorded() {
        let recorder = CallRecorder::new();
        let scope = recorder.scope();

        let first = scope.new_call("a", provider());
        let _second = scope.new_call("b", provider());
        recorder.add_message(first, ConversationMessage::user("hi"));
        recorder.record_call(first);

        let calls = recorder.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "a");
        assert!(calls[0].finished);

        let live = recorder.snapshot();
        assert_eq!(live.len(), 2);
        assert!(!live[1].finished);
    }

    #[test]
    fn test_nested_tool_call_tree() {
        let recorder = CallRecorder::new();
        let outer = recorder.scope().new_call("outer", provider());
        recorder.add_message(outer, ConversationMessage::system("prompt"));
        recorder.add_message(outer, ConversationMessage::user("question"));
        let call = ToolCall::new("t1", "lookup", json!({"q": 1}));
        recorder.add_message(outer, ConversationMessage::tool_use(&call));

        let (child_scope, tool_message) = recorder.start_tool_message(outer, "t1");
        let inner = child_scope.new_call("inner", provider());
        recorder.add_message(inner, ConversationMessage::user("nested"));
        recorder.add_message(inner, ConversationMessage::assistant("nested answer"));
        recorder.record_call(inner);
        recorder.set_content(tool_message, "nested answer", false);
        recorder.set_tool_duration(tool_message, Duration::from_millis(5));

        recorder.add_message(outer, ConversationMessage::assistant("done"));
        recorder.record_call(outer);

        assert_eq!(recorder.parent(inner), Some(tool_message));
        let calls = recorder.calls();
        assert_eq!(calls.len(), 1);
        let roles: Vec<Role> = calls[0].messages.iter().map(|m| m.message.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::ToolUse, Role::ToolResult, Role::Assistant]
        );

        let tool_results: Vec<&RecordedMessage> = calls[0]
            .messages
            .iter()
            .filter(|m| m.message.role == Role::ToolResult)
            .collect();
        assert_eq!(tool_results.len(), 1);
        assert_eq!(tool_results[0].calls.len(), 1);
        assert_eq!(tool_results[0].calls[0].id, "inner");
        assert_eq!(tool_results[0].message.content, "nested answer");
        assert_eq!(tool_results[0].message.tool_use_id.as_deref(), Some("t1"));
        assert_eq!(tool_results[0].tool_duration, Some(Duration::from_millis(5)));
        assert_eq!(calls[0].nested_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_duration_grows_final_is_fixed() {
        let recorder = CallRecorder::new();
        let call = recorder.scope().new_call("a", provider());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(recorder.snapshot()[0].duration, Duration::from_secs(3));

        recorder.record_call(call);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(recorder.calls()[0].duration, Duration::from_secs(3));
        assert_eq!(recorder.snapshot()[0].duration, Duration::from_secs(3));
    }

    #[test]
    fn test_frozen_call_ignores_later_changes() {
        let recorder = CallRecorder::new();
        let call = recorder.scope().new_call("a", provider());
        recorder.add_message(call, ConversationMessage::user("hi"));
        recorder.record_call(call);
        recorder.add_message(call, ConversationMessage::assistant("late"));

        assert_eq!(recorder.calls()[0].messages.len(), 1);
    }

    #[test]
    fn test_record_usage_keyed_by_request_id() {
        let recorder = CallRecorder::new();
        let call = recorder.scope().new_call("a", provider());
        let tokens = UsedTokens {
            prompt: 10,
            response: 2,
            total: 12,
            ..Default::default()
        };
        recorder.record_usage(call, "req_2", tokens, UsedTime::default());
        recorder.record_usage(call, "req_1", tokens, UsedTime::with_total(Duration::from_secs(1)));
        recorder.record_call(call);

        let record = &recorder.calls()[0];
        assert_eq!(
            record.used_tokens.keys().collect::<Vec<_>>(),
            vec!["req_2", "req_1"]
        );
        assert_eq!(record.total_used_tokens().total, 24);
        assert_eq!(record.used_time["req_1"].total, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_total_used_tokens_saturates() {
        let recorder = CallRecorder::new();
        let call = recorder.scope().new_call("a", provider());
        let huge = UsedTokens {
            prompt: u64::MAX,
            total: u64::MAX,
            cache_read_input_tokens: Some(u64::MAX),
            ..Default::default()
        };
        recorder.record_usage(call, "req_1", huge, UsedTime::default());
        recorder.record_usage(call, "req_2", huge, UsedTime::default());
        recorder.record_call(call);

        let total = recorder.calls()[0].total_used_tokens();
        assert_eq!(total.total, u64::MAX);
        assert_eq!(total.cache_read_input_tokens, Some(u64::MAX));
    }

    #[test]
    fn test_notify_receives_nested_changes() {
        let recorder = CallRecorder::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        recorder.notify(tx);

        let outer = recorder.scope().new_call("outer", provider());
        let (child_scope, _) = recorder.start_tool_message(outer, "t1");
        let inner = child_scope.new_call("inner", provider());
        recorder.add_message(inner, ConversationMessage::user("nested"));

        let mut last = None;
        let mut count = 0;
        while let Ok(snapshot) = rx.try_recv() {
            count += 1;
            last = Some(snapshot);
        }
        assert_eq!(count, 4);

        let last = last.unwrap();
        assert_eq!(last.len(), 1);
        let inner_record = &last[0].messages[0].calls[0];
        assert_eq!(inner_record.id, "inner");
        assert!(!inner_record.finished);
        assert_eq!(inner_record.messages[0].message.content, "nested");
    }

    #[test]
    fn test_closed_observer_is_dropped() {
        let recorder = CallRecorder::new();
        let (tx, rx) = mpsc::unbounded_channel();
        recorder.notify(tx);
        drop(rx);

        recorder.scope().new_call("a", provider());
        assert!(recorder.inner.observers.lock().is_empty());
    }

    #[test]
    fn test_concurrent_tool_messages() {
        let recorder = CallRecorder::new();
        let outer = recorder.scope().new_call("outer", provider());
        let handles: Vec<_> = (0..8)
            .map(|i| recorder.start_tool_message(outer, format!("t{i}")))
            .collect();

        std::thread::scope(|s| {
            for (i, (scope, message)) in handles.iter().enumerate() {
                let recorder = &recorder;
                s.spawn(move || {
                    let inner = scope.new_call(format!("inner{i}"), provider());
                    recorder.record_call(inner);
                    recorder.set_content(*message, format!("result {i}"), false);
                });
            }
        });
        recorder.record_call(outer);

        let record = &recorder.calls()[0];
        for (i, message) in record.messages.iter().enumerate() {
            assert_eq!(message.message.tool_use_id, Some(format!("t{i}")));
            assert_eq!(message.message.content, format!("result {i}"));
            assert_eq!(message.calls.len(), 1);
            assert_eq!(message.calls[0].id, format!("inner{i}"));
        }
    }

    #[test]
    fn test_concurrent_changes_deliver_latest_snapshot_last() {
        let recorder = CallRecorder::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        recorder.notify(tx);

        std::thread::scope(|s| {
            for i in 0..8 {
                let recorder = &recorder;
                s.spawn(move || {
                    let call = recorder.scope().new_call(format!("call{i}"), provider());
                    for j in 0..5 {
                        recorder.add_message(call, ConversationMessage::user(format!("{i}.{j}")));
                    }
                    recorder.record_call(call);
                });
            }
        });

        let mut last = None;
        while let Ok(snapshot) = rx.try_recv() {
            last = Some(snapshot);
        }
        let last = last.unwrap();
        assert_eq!(last.len(), 8);
        assert!(last.iter().all(|call| call.finished && call.messages.len() == 5));
        assert_eq!(last, recorder.snapshot());
    }

    #[test]
    fn test_snapshot_serializes() {
        let recorder = CallRecorder::new();
        let call = recorder.scope().new_call("a", provider());
        recorder.add_message(call, ConversationMessage::user("hi"));
        recorder.record_call(call);

        let json = serde_json::to_value(&recorder.calls()[0]).unwrap();
        assert_eq!(json["messages"][0], json!({"role": "user", "content": "hi"}));
        assert_eq!(json["finished"], json!(true));
    }
}
