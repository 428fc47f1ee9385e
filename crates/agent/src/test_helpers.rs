//! Tools and hooks shared by the unit tests in this crate.

use async_trait::async_trait;
use ironloop_core::error::ToolError;
use ironloop_core::message::ToolCallRequest;
use ironloop_core::tool::{Tool, ToolRegistry};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::hooks::AgentHooks;

/// Returns its arguments unchanged.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Echo the arguments back"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {"text": {"type": "string"}}
        })
    }
    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        Ok(arguments)
    }
}

/// Always fails.
pub struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "fail"
    }
    fn description(&self) -> &str {
        "Always fails"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }
    async fn execute(&self, _arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        Err(ToolError::ExecutionFailed {
            tool_name: "fail".into(),
            reason: "boom".into(),
        })
    }
}

/// Returns a caption plus one image part.
pub struct ImageTool;

#[async_trait]
impl Tool for ImageTool {
    fn name(&self) -> &str {
        "screenshot"
    }
    fn description(&self) -> &str {
        "Capture the screen"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }
    async fn execute(&self, _arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        Ok(serde_json::json!([
            {"type": "text", "text": "captured"},
            {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}}
        ]))
    }
}

/// Signals `started`, then waits for `release` before returning.
pub struct BlockingTool {
    pub started: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl BlockingTool {
    pub fn new() -> (Self, Arc<Notify>, Arc<Notify>) {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        (
            Self {
                started: started.clone(),
                release: release.clone(),
            },
            started,
            release,
        )
    }
}

#[async_trait]
impl Tool for BlockingTool {
    fn name(&self) -> &str {
        "block"
    }
    fn description(&self) -> &str {
        "Blocks until released"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }
    async fn execute(&self, _arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(serde_json::json!("released"))
    }
}

pub fn registry() -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(EchoTool));
    registry.register(Box::new(FailingTool));
    registry.register(Box::new(ImageTool));
    Arc::new(registry)
}

/// Records hook invocations by name.
#[derive(Default)]
pub struct RecordingHooks {
    pub calls: Mutex<Vec<String>>,
}

impl RecordingHooks {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, entry: String) {
        self.calls.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl AgentHooks for RecordingHooks {
    async fn on_llm_request(
        &self,
        _session_id: &str,
        _request: &ironloop_core::provider::ChatCompletionRequest,
    ) {
        self.record("llm_request".into());
    }

    async fn on_llm_response(
        &self,
        _session_id: &str,
        _completion: &ironloop_core::provider::ChatCompletion,
    ) {
        self.record("llm_response".into());
    }

    async fn on_llm_streaming_response(
        &self,
        _session_id: &str,
        _chunks: &[ironloop_core::provider::ChatCompletionChunk],
    ) {
        self.record("llm_chunks".into());
    }

    async fn on_before_tool_call(
        &self,
        _session_id: &str,
        call: &ToolCallRequest,
        arguments: serde_json::Value,
    ) -> serde_json::Value {
        self.record(format!("before:{}", call.name));
        arguments
    }

    async fn on_after_tool_call(
        &self,
        _session_id: &str,
        call: &ToolCallRequest,
        result: serde_json::Value,
    ) -> serde_json::Value {
        self.record(format!("after:{}", call.name));
        result
    }

    async fn on_tool_call_error(
        &self,
        _session_id: &str,
        call: &ToolCallRequest,
        _error: &ToolError,
    ) -> Option<serde_json::Value> {
        self.record(format!("error:{}", call.name));
        Some(serde_json::json!({"recovered": true}))
    }

    async fn on_each_agent_loop_start(&self, _session_id: &str, iteration: u32) {
        self.record(format!("loop_start:{iteration}"));
    }

    async fn on_agent_loop_end(&self, _session_id: &str, _terminal: &ironloop_core::event::Event) {
        self.record("loop_end".into());
    }
}
