//! Model transport boundary.
//!
//! A `ChatTransport` knows how to send a chat-completion request to an
//! OpenAI-compatible backend and hand back the streamed response chunks.
//! The wire types here are the OpenAI shapes and are all serde
//! (de)serializable so requests and chunks can be recorded and replayed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::message::{ChatMessage, WireToolCall};

/// A tool definition as the model sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    /// The `{"type":"function","function":{...}}` envelope used on the wire.
    pub fn to_api(&self) -> ApiToolDefinition {
        ApiToolDefinition {
            kind: "function".into(),
            function: self.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolDefinition,
}

/// One chat-completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    /// The model to use (e.g., "openai/gpt-4o")
    pub model: String,

    pub messages: Vec<ChatMessage>,

    /// Omitted entirely when there are no native tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ApiToolDefinition>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default)]
    pub stream: bool,
}

/// Token usage information.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

// --- Streaming chunk shape ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default)]
    pub choices: Vec<ChunkChoice>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,

    #[serde(default)]
    pub delta: ChunkDelta,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

/// A fragment of one tool call. `id` and `name` normally arrive once,
/// `arguments` arrives in pieces that concatenate per `index`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

impl ChatCompletionChunk {
    /// A chunk carrying only a content delta.
    pub fn content(text: impl Into<String>) -> Self {
        Self::from_delta(ChunkDelta {
            content: Some(text.into()),
            ..Default::default()
        })
    }

    /// A chunk carrying only a reasoning delta.
    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::from_delta(ChunkDelta {
            reasoning_content: Some(text.into()),
            ..Default::default()
        })
    }

    /// A chunk carrying one tool-call fragment.
    pub fn tool_call(
        index: usize,
        id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) -> Self {
        Self::from_delta(ChunkDelta {
            tool_calls: Some(vec![ToolCallDelta {
                index,
                id: id.map(str::to_string),
                kind: id.map(|_| "function".to_string()),
                function: Some(FunctionDelta {
                    name: name.map(str::to_string),
                    arguments: arguments.map(str::to_string),
                }),
            }]),
            ..Default::default()
        })
    }

    /// An empty-delta chunk carrying the finish reason.
    pub fn finish(reason: impl Into<String>) -> Self {
        Self {
            choices: vec![ChunkChoice {
                finish_reason: Some(reason.into()),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn from_delta(delta: ChunkDelta) -> Self {
        Self {
            choices: vec![ChunkChoice {
                delta,
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

// --- Non-streaming completion shape ---

/// A complete response, in the shape a non-streaming call would return.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletion {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub model: String,

    pub choices: Vec<CompletionChoice>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionChoice {
    #[serde(default)]
    pub index: u32,

    pub message: CompletionMessage,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionMessage {
    #[serde(default = "default_assistant_role")]
    pub role: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
}

fn default_assistant_role() -> String {
    "assistant".into()
}

impl ChatCompletion {
    /// The first choice, which is the only one this runtime ever requests.
    pub fn first_choice(&self) -> Option<&CompletionChoice> {
        self.choices.first()
    }
}

/// Receiving half of a streamed completion.
pub type ChunkReceiver =
    tokio::sync::mpsc::Receiver<std::result::Result<ChatCompletionChunk, ProviderError>>;

/// The model transport.
///
/// Implementations open a streaming completion and return the receiving end;
/// errors before the stream opens are returned directly, errors mid-stream are
/// sent as `Err` items.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// A human-readable name (e.g., "openrouter", "scripted").
    fn name(&self) -> &str;

    async fn create_chat_completion(
        &self,
        request: ChatCompletionRequest,
    ) -> std::result::Result<ChunkReceiver, ProviderError>;
}
