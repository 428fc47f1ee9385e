//! Prompt-engineered tool calling for models without native function calling.
//!
//! Tools are described in the system prompt and the model answers with
//! `<tool_call>{"name": ..., "parameters": {...}}</tool_call>` blocks.

use ironloop_config::ToolCallEngineKind;
use ironloop_core::event::{AssistantMessage, FinishReason, ToolResultEvent};
use ironloop_core::message::{ChatMessage, ToolCallRequest};
use ironloop_core::provider::{ChatCompletion, ChatCompletionRequest, ToolDefinition};
use regex_lite::Regex;
use serde::Deserialize;
use std::fmt::Write as _;
use std::sync::LazyLock;

use super::{
    ParsedModelResponse, RequestContext, ToolCallEngine, attachments_message, split_result,
    synthesize_call_id,
};

static TOOL_CALL_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<tool_call>(.*?)</tool_call>").expect("tool_call pattern compiles"));

#[derive(Deserialize)]
struct ToolCallBlock {
    name: String,
    #[serde(default)]
    parameters: serde_json::Value,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PromptEngineeringEngine;

impl PromptEngineeringEngine {
    /// Decode every well-formed block. Malformed ones are dropped.
    fn extract_calls(content: &str) -> Vec<ToolCallRequest> {
        TOOL_CALL_BLOCK
            .captures_iter(content)
            .filter_map(|caps| {
                let body = caps.get(1)?.as_str().trim();
                match serde_json::from_str::<ToolCallBlock>(body) {
                    Ok(block) if !block.name.is_empty() => {
                        let parameters = if block.parameters.is_null() {
                            serde_json::json!({})
                        } else {
                            block.parameters
                        };
                        Some(ToolCallRequest::new(
                            synthesize_call_id(),
                            block.name,
                            parameters.to_string(),
                        ))
                    }
                    Ok(_) => None,
                    Err(e) => {
                        tracing::debug!(error = %e, "Dropping malformed tool_call block");
                        None
                    }
                }
            })
            .collect()
    }

    fn strip_blocks(content: &str) -> String {
        TOOL_CALL_BLOCK.replace_all(content, "").trim().to_string()
    }

    fn render_call(call: &ToolCallRequest) -> String {
        let parameters: serde_json::Value =
            serde_json::from_str(&call.arguments).unwrap_or_else(|_| serde_json::json!({}));
        let body = serde_json::json!({ "name": call.name, "parameters": parameters });
        format!("<tool_call>\n{body}\n</tool_call>")
    }

    fn render_tool(out: &mut String, tool: &ToolDefinition) {
        let _ = writeln!(out, "\n### {}\n{}", tool.name, tool.description);

        let properties = tool.parameters.get("properties").and_then(|p| p.as_object());
        let required: Vec<&str> = tool
            .parameters
            .get("required")
            .and_then(|r| r.as_array())
            .map(|r| r.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();

        match properties {
            Some(props) if !props.is_empty() => {
                out.push_str("Parameters:\n");
                for (name, schema) in props {
                    let kind = schema.get("type").and_then(|t| t.as_str()).unwrap_or("any");
                    let flag = if required.contains(&name.as_str()) {
                        "required"
                    } else {
                        "optional"
                    };
                    let _ = write!(out, "- `{name}` ({kind}, {flag})");
                    if let Some(desc) = schema.get("description").and_then(|d| d.as_str()) {
                        let _ = write!(out, ": {desc}");
                    }
                    out.push('\n');
                }
            }
            _ => out.push_str("Parameters: none\n"),
        }
    }
}

impl ToolCallEngine for PromptEngineeringEngine {
    fn kind(&self) -> ToolCallEngineKind {
        ToolCallEngineKind::PromptEngineering
    }

    fn prepare_prompt(&self, base_instructions: &str, tools: &[ToolDefinition]) -> String {
        if tools.is_empty() {
            return base_instructions.to_string();
        }

        let mut prompt = base_instructions.trim_end().to_string();
        prompt.push_str(
            "\n\n## Tools\n\
             You can call the tools below. To call one, reply with a block like:\n\
             <tool_call>\n\
             {\"name\": \"tool_name\", \"parameters\": {\"arg\": \"value\"}}\n\
             </tool_call>\n\
             Use one block per call. Results arrive in the next user message.\n",
        );
        for tool in tools {
            Self::render_tool(&mut prompt, tool);
        }
        prompt
    }

    fn prepare_request(&self, context: RequestContext) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: context.model,
            messages: context.messages,
            tools: None,
            temperature: context.temperature,
            max_tokens: context.max_tokens,
            stream: true,
        }
    }

    fn parse_response(&self, completion: &ChatCompletion) -> ParsedModelResponse {
        let choice = completion.first_choice();
        let raw = choice
            .and_then(|c| c.message.content.as_deref())
            .unwrap_or_default();
        let reasoning_content = choice
            .and_then(|c| c.message.reasoning_content.clone())
            .filter(|r| !r.is_empty());

        let calls = Self::extract_calls(raw);
        let finish_reason = if calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        };

        ParsedModelResponse {
            content: Self::strip_blocks(raw),
            reasoning_content,
            tool_calls: (!calls.is_empty()).then_some(calls),
            finish_reason,
        }
    }

    fn build_historical_assistant_message(&self, message: &AssistantMessage) -> ChatMessage {
        let mut sections: Vec<String> = Vec::new();
        if !message.content.is_empty() {
            sections.push(message.content.clone());
        }
        sections.extend(message.tool_calls().iter().map(Self::render_call));
        ChatMessage::assistant(sections.join("\n"))
    }

    fn build_historical_tool_call_result_messages(
        &self,
        results: &[ToolResultEvent],
    ) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(results.len());
        for result in results {
            let split = split_result(result);
            messages.push(ChatMessage::user(format!(
                "Tool: {}\nResult:\n{}",
                result.name, split.text
            )));
            messages.extend(attachments_message(split.attachments));
        }
        messages
    }
}
