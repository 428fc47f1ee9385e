//! Native function calling: tools travel in the request's `tools` field and
//! come back in `message.tool_calls`.

use ironloop_config::ToolCallEngineKind;
use ironloop_core::event::{AssistantMessage, FinishReason, ToolResultEvent};
use ironloop_core::message::{ChatMessage, MessageContent, Role, ToolCallRequest};
use ironloop_core::provider::{ChatCompletion, ChatCompletionRequest, ToolDefinition};

use super::{
    ParsedModelResponse, RequestContext, ToolCallEngine, attachments_message, split_result,
    synthesize_call_id,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct NativeEngine;

impl ToolCallEngine for NativeEngine {
    fn kind(&self) -> ToolCallEngineKind {
        ToolCallEngineKind::Native
    }

    fn prepare_prompt(&self, base_instructions: &str, _tools: &[ToolDefinition]) -> String {
        base_instructions.to_string()
    }

    fn prepare_request(&self, context: RequestContext) -> ChatCompletionRequest {
        let tools = (!context.tools.is_empty())
            .then(|| context.tools.iter().map(ToolDefinition::to_api).collect());

        ChatCompletionRequest {
            model: context.model,
            messages: context.messages,
            tools,
            temperature: context.temperature,
            max_tokens: context.max_tokens,
            stream: true,
        }
    }

    fn parse_response(&self, completion: &ChatCompletion) -> ParsedModelResponse {
        let Some(choice) = completion.first_choice() else {
            return ParsedModelResponse {
                content: String::new(),
                reasoning_content: None,
                tool_calls: None,
                finish_reason: FinishReason::Stop,
            };
        };

        let tool_calls: Vec<ToolCallRequest> = choice
            .message
            .tool_calls
            .iter()
            .flatten()
            .map(|wire| {
                let mut call = ToolCallRequest::from(wire.clone());
                if call.id.is_empty() {
                    call.id = synthesize_call_id();
                }
                call
            })
            .collect();

        let finish_reason = if tool_calls.is_empty() {
            choice
                .finish_reason
                .as_deref()
                .map_or(FinishReason::Stop, FinishReason::from_wire)
        } else {
            FinishReason::ToolCalls
        };

        ParsedModelResponse {
            content: choice.message.content.clone().unwrap_or_default(),
            reasoning_content: choice
                .message
                .reasoning_content
                .clone()
                .filter(|r| !r.is_empty()),
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            finish_reason,
        }
    }

    fn build_historical_assistant_message(&self, message: &AssistantMessage) -> ChatMessage {
        let calls = message.tool_calls();
        let content = if message.content.is_empty() && !calls.is_empty() {
            None
        } else {
            Some(MessageContent::Text(message.content.clone()))
        };

        ChatMessage {
            role: Role::Assistant,
            content,
            tool_calls: calls.iter().map(ToolCallRequest::to_wire).collect(),
            tool_call_id: None,
            name: None,
        }
    }

    fn build_historical_tool_call_result_messages(
        &self,
        results: &[ToolResultEvent],
    ) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(results.len());
        for result in results {
            let split = split_result(result);
            messages.push(ChatMessage::tool(result.tool_call_id.clone(), split.text));
            messages.extend(attachments_message(split.attachments));
        }
        messages
    }
}
