//! Text functions: a function whose behavior is given by a prompt and
//! examples and computed by a model.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use llmfn_protocol::ConversationMessage;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use crate::context::CallContext;
use crate::error::{FunError, Result};
use crate::provider::Provider;
use crate::tools::{Tool, ToolSet};
use crate::validation::{JsonSchemaValidator, Validator};

/// A labeled example: the inputs of a call and the expected output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub input: Vec<Value>,
    pub output: Value,
}

impl Example {
    pub fn new(input: Vec<Value>, output: Value) -> Self {
        Self { input, output }
    }
}

/// A function computed by a model.
///
/// Configure it with the builder methods, call [`TextFunction::init`] once,
/// then [`TextFunction::call`] any number of times, concurrently if needed.
pub struct TextFunction {
    provider: Arc<dyn Provider>,
    prompt: Option<String>,
    description: Option<String>,
    examples: Vec<Example>,
    input_schemas: Vec<Value>,
    output_schema: Option<Value>,
    tools: ToolSet,
    validator: Arc<dyn Validator>,
    initialized: AtomicBool,
}

impl std::fmt::Debug for TextFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextFunction")
            .field("provider", self.provider.descriptor())
            .field("prompt", &self.prompt)
            .field("examples", &self.examples.len())
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}

impl TextFunction {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            prompt: None,
            description: None,
            examples: Vec::new(),
            input_schemas: Vec::new(),
            output_schema: None,
            tools: ToolSet::new(),
            validator: Arc::new(JsonSchemaValidator),
            initialized: AtomicBool::new(false),
        }
    }

    /// Natural language description of what the function computes, sent
    /// as the system message.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    /// Short description used when the function is offered as a tool.
    /// Defaults to the prompt.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_example(mut self, example: Example) -> Self {
        self.examples.push(example);
        self
    }

    pub fn with_examples(mut self, examples: impl IntoIterator<Item = Example>) -> Self {
        self.examples.extend(examples);
        self
    }

    /// Schemas of the positional inputs, one per input.
    pub fn with_input_schemas(mut self, schemas: Vec<Value>) -> Self {
        self.input_schemas = schemas;
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_tools(mut self, tools: ToolSet) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn description(&self) -> String {
        self.description
            .clone()
            .or_else(|| self.prompt.clone())
            .unwrap_or_default()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Check the examples, seed the provider with the prompt and examples,
    /// and register tools and the output schema.
    ///
    /// Tools are initialized before the provider is seeded, so a failed
    /// `init` leaves the provider untouched and can be retried.
    pub async fn init(&self, cx: &CallContext) -> Result<()> {
        if self.is_initialized() {
            return Err(FunError::AlreadyInitialized);
        }
        if self.prompt.is_none() && self.examples.is_empty() {
            return Err(FunError::config("a function needs a prompt, examples or both"));
        }

        for example in &self.examples {
            self.validate_inputs(&example.input)?;
            if let Some(schema) = &self.output_schema {
                self.validator.validate(schema, &example.output)?;
            }
        }

        let tool_support = if self.tools.is_empty() {
            None
        } else {
            let Some(supports) = self.provider.tools() else {
                return Err(FunError::config(format!(
                    "{} provider does not support tools",
                    self.provider.descriptor().kind
                )));
            };
            self.tools.init(cx).await?;
            Some(supports)
        };

        self.provider.init(cx, self.seed()).await?;

        if let Some(supports) = tool_support {
            supports.init_tools(cx, self.tools.clone()).await?;
        }

        if let (Some(schema), Some(supports)) = (&self.output_schema, self.provider.output_schema()) {
            supports.init_output_schema(cx, schema.clone()).await?;
        }

        self.initialized.store(true, Ordering::Release);
        debug!(
            model = %self.provider.descriptor().model,
            examples = self.examples.len(),
            tools = self.tools.len(),
            "Function initialized"
        );
        Ok(())
    }

    /// Compute the function for `inputs`.
    ///
    /// Output that parses as JSON is returned as that value, anything else
    /// as a JSON string.
    pub async fn call(&self, cx: &CallContext, inputs: &[Value]) -> Result<Value> {
        if !self.is_initialized() {
            return Err(FunError::NotInitialized);
        }
        self.validate_inputs(inputs)?;

        let text = self
            .provider
            .exchange(cx, ConversationMessage::user(render_inputs(inputs)))
            .await?;
        self.parse_output(text)
    }

    /// Typed [`TextFunction::call`] with a single input.
    pub async fn call_typed<I, O>(&self, cx: &CallContext, input: &I) -> Result<O>
    where
        I: Serialize + Sync,
        O: DeserializeOwned,
    {
        let input = serde_json::to_value(input)?;
        let output = self.call(cx, std::slice::from_ref(&input)).await?;
        Ok(serde_json::from_value(output)?)
    }

    fn seed(&self) -> Vec<ConversationMessage> {
        let mut seed = Vec::with_capacity(1 + 2 * self.examples.len());
        if let Some(prompt) = &self.prompt {
            seed.push(ConversationMessage::system(prompt.as_str()));
        }
        for example in &self.examples {
            seed.push(ConversationMessage::user(render_inputs(&example.input)));
            seed.push(ConversationMessage::assistant(render_value(&example.output)));
        }
        seed
    }

    fn validate_inputs(&self, inputs: &[Value]) -> Result<()> {
        if self.input_schemas.is_empty() {
            return Ok(());
        }
        if self.input_schemas.len() != inputs.len() {
            return Err(FunError::SchemaValidationFailed {
                message: format!(
                    "expected {} inputs, got {}",
                    self.input_schemas.len(),
                    inputs.len()
                ),
            });
        }
        for (schema, input) in self.input_schemas.iter().zip(inputs) {
            self.validator.validate(schema, input)?;
        }
        Ok(())
    }

    /// A string schema accepts output that happens to parse as JSON.
    fn parse_output(&self, text: String) -> Result<Value> {
        let Ok(parsed) = serde_json::from_str::<Value>(&text) else {
            let output = Value::String(text);
            if let Some(schema) = &self.output_schema {
                self.validator.validate(schema, &output)?;
            }
            return Ok(output);
        };

        let Some(schema) = &self.output_schema else {
            return Ok(parsed);
        };
        match self.validator.validate(schema, &parsed) {
            Ok(()) => Ok(parsed),
            Err(error) => {
                let raw = Value::String(text);
                if self.validator.validate(schema, &raw).is_ok() {
                    Ok(raw)
                } else {
                    Err(error)
                }
            }
        }
    }
}

/// Strings as they are, other values as compact JSON.
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_inputs(inputs: &[Value]) -> String {
    inputs.iter().map(render_value).collect::<Vec<_>>().join("\n\n")
}

/// Offers a [`TextFunction`] to another model as a tool. The tool input is
/// passed as the function's single input.
#[derive(Debug, Clone)]
pub struct FunctionTool {
    function: Arc<TextFunction>,
}

impl FunctionTool {
    pub fn new(function: Arc<TextFunction>) -> Self {
        Self { function }
    }
}

#[async_trait]
impl Tool for FunctionTool {
    async fn init(&self, cx: &CallContext) -> Result<()> {
        if self.function.is_initialized() {
            return Ok(());
        }
        self.function.init(cx).await
    }

    async fn call(&self, cx: &CallContext, input: Value) -> Result<Value> {
        self.function.call(cx, std::slice::from_ref(&input)).await
    }

    fn description(&self) -> String {
        self.function.description()
    }

    fn input_schema(&self) -> Value {
        match self.function.input_schemas.as_slice() {
            [schema] => schema.clone(),
            _ => json!({"type": "object"}),
        }
    }
}
