//! Tool-call protocol strategies.
//!
//! A `ToolCallEngine` decides how tools are described to the model, how a
//! raw completion is decoded into text + tool calls, and how past turns are
//! re-encoded when the history is projected back into messages.

mod native;
mod prompt_engineering;

pub use native::NativeEngine;
pub use prompt_engineering::PromptEngineeringEngine;

use ironloop_config::ToolCallEngineKind;
use ironloop_core::event::{AssistantMessage, FinishReason, ToolResultEvent};
use ironloop_core::message::{ChatMessage, ContentPart, MessageContent, ToolCallRequest};
use ironloop_core::provider::{ChatCompletion, ChatCompletionRequest, ToolDefinition};
use std::sync::Arc;

/// Inputs for one model request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Canonical decoded form of one model turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedModelResponse {
    pub content: String,
    pub reasoning_content: Option<String>,
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    pub finish_reason: FinishReason,
}

impl ParsedModelResponse {
    pub fn tool_calls(&self) -> &[ToolCallRequest] {
        self.tool_calls.as_deref().unwrap_or_default()
    }
}

pub trait ToolCallEngine: Send + Sync {
    fn kind(&self) -> ToolCallEngineKind;

    /// The system prompt sent with every request.
    fn prepare_prompt(&self, base_instructions: &str, tools: &[ToolDefinition]) -> String;

    fn prepare_request(&self, context: RequestContext) -> ChatCompletionRequest;

    fn parse_response(&self, completion: &ChatCompletion) -> ParsedModelResponse;

    fn build_historical_assistant_message(&self, message: &AssistantMessage) -> ChatMessage;

    /// Messages for the results of one assistant turn, in call order.
    fn build_historical_tool_call_result_messages(
        &self,
        results: &[ToolResultEvent],
    ) -> Vec<ChatMessage>;
}

/// The engine for a configured protocol.
pub fn engine_for(kind: ToolCallEngineKind) -> Arc<dyn ToolCallEngine> {
    match kind {
        ToolCallEngineKind::Native => Arc::new(NativeEngine),
        ToolCallEngineKind::PromptEngineering => Arc::new(PromptEngineeringEngine::default()),
    }
}

/// Fresh id for a tool call the model did not name.
pub(crate) fn synthesize_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

/// A tool result split into its text and its non-text parts.
pub(crate) struct SplitResult {
    pub text: String,
    pub attachments: Vec<ContentPart>,
}

pub(crate) fn split_result(result: &ToolResultEvent) -> SplitResult {
    let parts = ContentPart::from_tool_output(&result.content);
    let text = parts
        .iter()
        .filter_map(ContentPart::as_text)
        .collect::<Vec<_>>()
        .join("\n");
    let attachments: Vec<ContentPart> = parts.into_iter().filter(|p| p.as_text().is_none()).collect();

    let text = match (&result.error, text.is_empty()) {
        (Some(error), true) => format!("Error: {error}"),
        _ => text,
    };

    SplitResult { text, attachments }
}

/// The trailing user message that carries a result's non-text parts.
pub(crate) fn attachments_message(attachments: Vec<ContentPart>) -> Option<ChatMessage> {
    (!attachments.is_empty()).then(|| ChatMessage::user(MessageContent::Parts(attachments)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(content: serde_json::Value, error: Option<&str>) -> ToolResultEvent {
        ToolResultEvent {
            tool_call_id: "c1".into(),
            name: "shot".into(),
            content,
            elapsed_ms: 1,
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn split_separates_images() {
        let split = split_result(&result(
            serde_json::json!([
                {"type": "text", "text": "captured"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,AA"}}
            ]),
            None,
        ));
        assert_eq!(split.text, "captured");
        assert_eq!(split.attachments.len(), 1);
    }

    #[test]
    fn empty_failed_result_renders_error() {
        let split = split_result(&result(serde_json::Value::Null, Some("boom")));
        assert_eq!(split.text, "Error: boom");
        assert!(attachments_message(split.attachments).is_none());
    }

    #[test]
    fn engine_for_kind() {
        assert_eq!(engine_for(ToolCallEngineKind::Native).kind(), ToolCallEngineKind::Native);
        assert_eq!(
            engine_for(ToolCallEngineKind::PromptEngineering).kind(),
            ToolCallEngineKind::PromptEngineering
        );
    }

    #[test]
    fn synthesized_ids_are_unique() {
        assert_ne!(synthesize_call_id(), synthesize_call_id());
        assert!(synthesize_call_id().starts_with("call_"));
    }
}
