//! Caller-supplied tools the model may call.

mod invoker;

pub use invoker::ToolInvoker;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use llmfn_protocol::ToolSpec;
use serde_json::Value;

use crate::context::CallContext;
use crate::error::Result;

/// A function the model may call.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Prepare the tool before it is advertised. Called again when the
    /// owning function's `init` is retried.
    async fn init(&self, _cx: &CallContext) -> Result<()> {
        Ok(())
    }

    /// Execute the tool. Errors are reported to the model, not to the caller.
    async fn call(&self, cx: &CallContext, input: Value) -> Result<Value>;

    /// Description shown to the model.
    fn description(&self) -> String;

    /// JSON Schema of the input.
    fn input_schema(&self) -> Value;
}

/// Tools by name, in registration order.
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: IndexMap<String, Arc<dyn Tool>>,
}

impl std::fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.tools.keys()).finish()
    }
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool. A tool with the same name is replaced.
    pub fn with(mut self, name: impl Into<String>, tool: impl Tool + 'static) -> Self {
        self.insert(name, Arc::new(tool));
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, tool: Arc<dyn Tool>) {
        self.tools.insert(name.into(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    /// Initialize every tool.
    pub async fn init(&self, cx: &CallContext) -> Result<()> {
        for tool in self.tools.values() {
            tool.init(cx).await?;
        }
        Ok(())
    }

    /// Definitions advertised to the backend.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|(name, tool)| ToolSpec {
                name: name.clone(),
                description: tool.description(),
                input_schema: tool.input_schema(),
            })
            .collect()
    }
}

type ToolFn = dyn Fn(CallContext, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync;

/// Tool backed by an async closure.
pub struct FnTool {
    description: String,
    input_schema: Value,
    f: Box<ToolFn>,
}

impl FnTool {
    pub fn new<F, Fut>(description: impl Into<String>, input_schema: Value, f: F) -> Self
    where
        F: Fn(CallContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            description: description.into(),
            input_schema,
            f: Box::new(move |cx, input| Box::pin(f(cx, input))),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    async fn call(&self, cx: &CallContext, input: Value) -> Result<Value> {
        (self.f)(cx.clone(), input).await
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn input_schema(&self) -> Value {
        self.input_schema.clone()
    }
}
