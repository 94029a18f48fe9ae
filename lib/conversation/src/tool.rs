//! Tool registry for conversations.
//!
//! Tools are written against typed inputs and outputs through the `Tool`
//! trait. The registry stores them behind the object-safe `DynTool` trait,
//! which handles JSON decoding and encoding, and dispatches by name.

use crate::error::ToolError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Definition of a tool as advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON schema for input parameters.
    pub input_schema: JsonValue,
}

impl ToolDefinition {
    /// Creates a new tool definition.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: serde_json::json!({ "type": "object" }),
        }
    }

    /// Sets the input schema.
    #[must_use]
    pub fn with_input_schema(mut self, schema: JsonValue) -> Self {
        self.input_schema = schema;
        self
    }
}

/// A tool with statically typed input and output.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Input decoded from the model's arguments.
    type Input: DeserializeOwned + Send;
    /// Output encoded into the tool response.
    type Output: Serialize + Send;

    /// Returns the tool's definition.
    fn definition(&self) -> ToolDefinition;

    /// Runs the tool.
    async fn call(&self, input: Self::Input) -> Result<Self::Output, ToolError>;
}

/// Object-safe view of a `Tool` working on JSON values.
#[async_trait]
pub trait DynTool: Send + Sync {
    /// Returns the tool's definition.
    fn definition(&self) -> ToolDefinition;

    /// Decodes the input, runs the tool and encodes the output.
    async fn invoke(&self, input: JsonValue) -> Result<JsonValue, ToolError>;
}

#[async_trait]
impl<T: Tool> DynTool for T {
    fn definition(&self) -> ToolDefinition {
        Tool::definition(self)
    }

    async fn invoke(&self, input: JsonValue) -> Result<JsonValue, ToolError> {
        let name = || Tool::definition(self).name;
        let input: T::Input =
            serde_json::from_value(input).map_err(|e| ToolError::InvalidInput {
                name: name(),
                reason: e.to_string(),
            })?;
        let output = self.call(input).await?;
        serde_json::to_value(output).map_err(|e| ToolError::ExecutionFailed {
            name: name(),
            reason: format!("failed to encode output: {e}"),
        })
    }
}

/// Registry of tools keyed by name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn DynTool>>,
}

impl ToolRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool, replacing any tool with the same name.
    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        let name = Tool::definition(&tool).name;
        self.tools.insert(name, Arc::new(tool));
    }

    /// Registers a tool and returns the registry.
    #[must_use]
    pub fn with_tool<T: Tool + 'static>(mut self, tool: T) -> Self {
        self.register(tool);
        self
    }

    /// Returns true if a tool with this name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Returns the definitions of all tools, ordered by name.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    /// Invokes a tool by name.
    ///
    /// # Errors
    ///
    /// Returns `ToolError::NotFound` for an unknown name, and the tool's own
    /// error otherwise.
    pub async fn invoke(&self, name: &str, input: JsonValue) -> Result<JsonValue, ToolError> {
        let tool = self.tools.get(name).ok_or_else(|| ToolError::NotFound {
            name: name.to_string(),
        })?;
        tool.invoke(input).await
    }

    /// Returns the number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Returns true if no tools are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
