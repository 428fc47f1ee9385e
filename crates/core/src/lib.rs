//! # ironloop core
//!
//! Domain types, traits, and error definitions for the ironloop agent runtime.
//! Everything the execution engine is built from lives here: the multimodal
//! chat message model, the event-sourced conversation log, the model
//! transport trait and its wire types, and the tool registry.
//!
//! Implementations live in their respective crates and depend inward on
//! this one.

pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod runtime;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, ProviderError, Result, SessionError, ToolError};
pub use event::{
    AssistantMessage, Event, EventKind, EventStream, EventType, FinishReason, SubscriptionId,
    SystemLevel, ToolCallEvent, ToolInfo, ToolResultEvent,
};
pub use message::{ChatMessage, ContentPart, ImageUrl, MessageContent, Role, ToolCallRequest};
pub use provider::{
    ChatCompletion, ChatCompletionChunk, ChatCompletionRequest, ChatTransport, ChunkReceiver,
    ToolDefinition, Usage,
};
pub use runtime::RuntimeConfig;
pub use tool::{Tool, ToolExecution, ToolRegistry};
