//! Tool trait and the read-only registry shared across sessions.
//!
//! Tools are external collaborators: the runtime only knows their name,
//! description, parameter schema and how to invoke them.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Instant;

use crate::error::ToolError;
use crate::provider::ToolDefinition;

/// The core Tool trait.
///
/// A tool's output is arbitrary JSON. A string is treated as text, an array of
/// `{"type":"text"|"image_url",...}` parts is treated as multimodal content.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "calculator").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    async fn execute(
        &self,
        arguments: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Outcome of one registry invocation.
#[derive(Debug, Clone)]
pub struct ToolExecution {
    pub result: std::result::Result<serde_json::Value, ToolError>,
    pub elapsed_ms: u64,
}

impl ToolExecution {
    pub fn error(&self) -> Option<String> {
        self.result.as_ref().err().map(ToString::to_string)
    }
}

/// A registry of available tools, keyed (and listed) by name.
///
/// Built once, then wrapped in an `Arc` and only read during execution.
pub struct ToolRegistry {
    tools: BTreeMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// All tool definitions, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.to_definition()).collect()
    }

    /// Invoke a tool by name and time it. Unknown names are a `NotFound` result.
    pub async fn execute_tool(
        &self,
        name: &str,
        call_id: &str,
        arguments: serde_json::Value,
    ) -> ToolExecution {
        let started = Instant::now();
        let result = match self.tools.get(name) {
            Some(tool) => tool.execute(arguments).await,
            None => Err(ToolError::NotFound(name.to_string())),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => tracing::debug!(tool = name, call_id, elapsed_ms, "Tool finished"),
            Err(e) => tracing::debug!(tool = name, call_id, elapsed_ms, error = %e, "Tool failed"),
        }

        ToolExecution { result, elapsed_ms }
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
