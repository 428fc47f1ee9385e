//! Lifecycle hooks around model calls and tool execution.
//!
//! Every method has a pass-through or no-op default, so an implementation
//! only overrides what it observes. Fixture recorders and tracers plug in here.

use async_trait::async_trait;
use ironloop_core::error::ToolError;
use ironloop_core::event::Event;
use ironloop_core::message::ToolCallRequest;
use ironloop_core::provider::{ChatCompletion, ChatCompletionChunk, ChatCompletionRequest};

#[async_trait]
pub trait AgentHooks: Send + Sync {
    /// Before each transport call.
    async fn on_llm_request(&self, _session_id: &str, _request: &ChatCompletionRequest) {}

    /// After aggregation, with the reconstructed completion.
    async fn on_llm_response(&self, _session_id: &str, _completion: &ChatCompletion) {}

    /// After aggregation, with the raw chunks in arrival order.
    async fn on_llm_streaming_response(&self, _session_id: &str, _chunks: &[ChatCompletionChunk]) {}

    /// May rewrite the arguments a tool is invoked with.
    async fn on_before_tool_call(
        &self,
        _session_id: &str,
        _call: &ToolCallRequest,
        arguments: serde_json::Value,
    ) -> serde_json::Value {
        arguments
    }

    /// May rewrite a successful tool result.
    async fn on_after_tool_call(
        &self,
        _session_id: &str,
        _call: &ToolCallRequest,
        result: serde_json::Value,
    ) -> serde_json::Value {
        result
    }

    /// May produce a recovery value recorded as the failed call's content.
    async fn on_tool_call_error(
        &self,
        _session_id: &str,
        _call: &ToolCallRequest,
        _error: &ToolError,
    ) -> Option<serde_json::Value> {
        None
    }

    async fn on_each_agent_loop_start(&self, _session_id: &str, _iteration: u32) {}

    /// Once per run, with the terminal assistant event.
    async fn on_agent_loop_end(&self, _session_id: &str, _terminal: &Event) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl AgentHooks for NoopHooks {}
