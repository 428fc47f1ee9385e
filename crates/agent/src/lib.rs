//! The agent execution engine for ironloop.
//!
//! A run follows a **Project → Call → Aggregate → Act** cycle:
//!
//! 1. **Project** the session's event log into model messages
//! 2. **Call** the model through a `ChatTransport`
//! 3. **Aggregate** the streamed chunks into one `AssistantMessage`
//! 4. **Act** on its tool calls, append the results, and loop back to 1
//!
//! The loop ends when the model answers without tool calls, the run is
//! aborted, or the iteration ceiling is reached. Sessions are isolated: each
//! owns its event log and cancellation token, while the provider router and
//! tool registry are shared read-only.

pub mod agent;
pub mod hooks;
pub mod loop_runner;
pub mod message_history;
pub mod session;
pub mod stream_adapter;
pub mod stream_aggregator;
pub mod tool_call_engine;
pub mod tool_processor;

#[cfg(test)]
mod test_helpers;

pub use agent::{Agent, AgentDefaults, RunOptions};
pub use hooks::{AgentHooks, NoopHooks};
pub use loop_runner::{LoopExecutor, LoopOutcome};
pub use message_history::IMAGE_PLACEHOLDER;
pub use session::{SessionHandle, SessionInfo, SessionManager, SessionStatus};
pub use stream_adapter::EventSequence;
pub use stream_aggregator::{AggregatedResponse, StreamAggregator, reconstruct_completion};
pub use tool_call_engine::{
    NativeEngine, ParsedModelResponse, PromptEngineeringEngine, RequestContext, ToolCallEngine,
    engine_for,
};
pub use tool_processor::ToolProcessor;
