//! Merges a chunked completion stream into one logical response.
//!
//! Content and reasoning deltas are concatenated in arrival order, tool-call
//! fragments are concatenated per `index`. In streaming mode every delta is
//! also re-published as a streaming event.

use ironloop_core::error::{Error, ProviderError};
use ironloop_core::event::{AssistantMessage, Event, EventKind, EventStream, FinishReason, SystemLevel};
use ironloop_core::message::{FunctionCall, WireToolCall};
use ironloop_core::provider::{
    ChatCompletion, ChatCompletionChunk, ChunkReceiver, CompletionChoice, CompletionMessage, Usage,
};
use std::collections::BTreeMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::tool_call_engine::{ParsedModelResponse, ToolCallEngine};

#[derive(Debug, Default, Clone)]
struct ToolCallBuffer {
    id: String,
    name: String,
    arguments: String,
}

/// Running state of one streamed completion.
#[derive(Debug, Default)]
struct ChunkAccumulator {
    id: Option<String>,
    model: Option<String>,
    content: String,
    reasoning: String,
    tool_calls: BTreeMap<usize, ToolCallBuffer>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
}

/// Deltas carried by one chunk, for re-publishing.
struct ChunkDeltas {
    content: Option<String>,
    reasoning: Option<String>,
}

impl ChunkAccumulator {
    fn push(&mut self, chunk: &ChatCompletionChunk) -> ChunkDeltas {
        if self.id.is_none() {
            self.id.clone_from(&chunk.id);
        }
        if self.model.is_none() {
            self.model.clone_from(&chunk.model);
        }
        if chunk.usage.is_some() {
            self.usage.clone_from(&chunk.usage);
        }

        let mut deltas = ChunkDeltas {
            content: None,
            reasoning: None,
        };

        for choice in &chunk.choices {
            let delta = &choice.delta;

            if let Some(text) = delta.content.as_deref().filter(|t| !t.is_empty()) {
                self.content.push_str(text);
                deltas.content.get_or_insert_with(String::new).push_str(text);
            }
            if let Some(text) = delta.reasoning_content.as_deref().filter(|t| !t.is_empty()) {
                self.reasoning.push_str(text);
                deltas.reasoning.get_or_insert_with(String::new).push_str(text);
            }

            for fragment in delta.tool_calls.iter().flatten() {
                let buffer = self.tool_calls.entry(fragment.index).or_default();
                if let Some(id) = fragment.id.as_deref().filter(|id| !id.is_empty()) {
                    buffer.id = id.to_string();
                }
                if let Some(function) = &fragment.function {
                    if let Some(name) = function.name.as_deref().filter(|n| !n.is_empty()) {
                        buffer.name = name.to_string();
                    }
                    if let Some(arguments) = &function.arguments {
                        buffer.arguments.push_str(arguments);
                    }
                }
            }

            if choice.finish_reason.is_some() {
                self.finish_reason.clone_from(&choice.finish_reason);
            }
        }

        deltas
    }

    fn finish(self) -> ChatCompletion {
        let tool_calls: Vec<WireToolCall> = self
            .tool_calls
            .into_values()
            .map(|buffer| WireToolCall {
                id: buffer.id,
                kind: "function".into(),
                function: FunctionCall {
                    name: buffer.name,
                    arguments: buffer.arguments,
                },
            })
            .collect();

        ChatCompletion {
            id: self.id.unwrap_or_default(),
            model: self.model.unwrap_or_default(),
            choices: vec![CompletionChoice {
                index: 0,
                message: CompletionMessage {
                    role: "assistant".into(),
                    content: Some(self.content),
                    reasoning_content: (!self.reasoning.is_empty()).then_some(self.reasoning),
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                },
                finish_reason: self.finish_reason,
            }],
            usage: self.usage,
        }
    }
}

/// Rebuild the completion a non-streaming call would have returned.
pub fn reconstruct_completion(chunks: &[ChatCompletionChunk]) -> ChatCompletion {
    let mut acc = ChunkAccumulator::default();
    for chunk in chunks {
        acc.push(chunk);
    }
    acc.finish()
}

/// Result of one aggregated model turn.
#[derive(Debug, Clone)]
pub struct AggregatedResponse {
    /// Raw chunks in arrival order.
    pub chunks: Vec<ChatCompletionChunk>,
    pub completion: ChatCompletion,
    pub parsed: ParsedModelResponse,
    /// The appended `AssistantMessage` event.
    pub event: Event,
}

impl AggregatedResponse {
    pub fn message(&self) -> Option<&AssistantMessage> {
        self.event.as_assistant()
    }
}

pub struct StreamAggregator<'a> {
    session_id: &'a str,
    events: &'a EventStream,
    engine: &'a dyn ToolCallEngine,
    cancel: &'a CancellationToken,
    streaming: bool,
}

impl<'a> StreamAggregator<'a> {
    pub fn new(
        session_id: &'a str,
        events: &'a EventStream,
        engine: &'a dyn ToolCallEngine,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            session_id,
            events,
            engine,
            cancel,
            streaming: false,
        }
    }

    /// Re-publish deltas as streaming events.
    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// Consume the stream and append the consolidated assistant message.
    ///
    /// A transport failure appends `System{error}` and a terminal
    /// `AssistantMessage{error}` before returning the error. Cancellation
    /// returns `Error::Aborted` without appending anything further.
    pub async fn aggregate(&self, mut rx: ChunkReceiver, started: Instant) -> Result<AggregatedResponse, Error> {
        let message_id = uuid::Uuid::new_v4().to_string();
        let mut acc = ChunkAccumulator::default();
        let mut chunks = Vec::new();
        let mut streamed_content = false;
        let mut streamed_reasoning = false;

        loop {
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(session_id = %self.session_id, "Aggregation cancelled");
                    return Err(Error::Aborted { session_id: self.session_id.to_string() });
                }
                item = rx.recv() => item,
            };

            match item {
                None => break,
                Some(Ok(chunk)) => {
                    let deltas = acc.push(&chunk);
                    chunks.push(chunk);

                    if self.streaming {
                        if let Some(content) = deltas.reasoning {
                            streamed_reasoning = true;
                            self.events.append(EventKind::AssistantStreamingThinkingMessage {
                                content,
                                is_complete: false,
                            });
                        }
                        if let Some(content) = deltas.content {
                            streamed_content = true;
                            self.events.append(EventKind::AssistantStreamingMessage {
                                content,
                                is_complete: false,
                                message_id: Some(message_id.clone()),
                            });
                        }
                    }
                }
                Some(Err(err)) => return Err(self.fail(err, started)),
            }
        }

        if streamed_reasoning {
            self.events.append(EventKind::AssistantStreamingThinkingMessage {
                content: String::new(),
                is_complete: true,
            });
        }
        if streamed_content {
            self.events.append(EventKind::AssistantStreamingMessage {
                content: String::new(),
                is_complete: true,
                message_id: Some(message_id.clone()),
            });
        }

        let completion = acc.finish();
        let parsed = self.engine.parse_response(&completion);

        if let Some(reasoning) = &parsed.reasoning_content {
            self.events.append(EventKind::AssistantThinkingMessage {
                content: reasoning.clone(),
            });
        }

        let event = self.events.append(EventKind::AssistantMessage(AssistantMessage {
            content: parsed.content.clone(),
            tool_calls: parsed.tool_calls.clone(),
            finish_reason: parsed.finish_reason,
            elapsed_ms: Some(started.elapsed().as_millis() as u64),
            reasoning_content: parsed.reasoning_content.clone(),
            message_id: Some(message_id),
        }));

        debug!(
            session_id = %self.session_id,
            chunks = chunks.len(),
            tool_calls = parsed.tool_calls().len(),
            finish_reason = ?parsed.finish_reason,
            "Aggregated model response"
        );

        Ok(AggregatedResponse {
            chunks,
            completion,
            parsed,
            event,
        })
    }

    fn fail(&self, err: ProviderError, started: Instant) -> Error {
        warn!(session_id = %self.session_id, error = %err, "Model stream failed");
        append_transport_failure(self.events, &err, Some(started.elapsed().as_millis() as u64));
        Error::Provider(err)
    }
}

/// `System{error}` followed by the terminal `AssistantMessage{error}`.
pub(crate) fn append_transport_failure(events: &EventStream, err: &ProviderError, elapsed_ms: Option<u64>) -> Event {
    events.append(EventKind::System {
        level: SystemLevel::Error,
        message: format!("Model request failed: {err}"),
        details: None,
    });
    events.append(EventKind::AssistantMessage(AssistantMessage {
        elapsed_ms,
        ..AssistantMessage::terminal(err.to_string(), FinishReason::Error)
    }))
}
