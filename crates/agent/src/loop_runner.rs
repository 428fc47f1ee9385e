//! The agent reasoning loop implementation.
//!
//! One execution drives a session through
//! `Iterating → AwaitingModel → Aggregating → (ExecutingTools → Iterating)`
//! until the model answers without tool calls, the run is aborted, or the
//! iteration ceiling is reached. Every outcome ends with exactly one terminal
//! `AssistantMessage` in the session's event log.

use ironloop_core::error::Error;
use ironloop_core::event::{AssistantMessage, Event, EventKind, EventStream, FinishReason, SystemLevel};
use ironloop_core::provider::ChatTransport;
use ironloop_core::tool::ToolRegistry;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::hooks::{AgentHooks, NoopHooks};
use crate::message_history;
use crate::session::SessionHandle;
use crate::stream_aggregator::{StreamAggregator, append_transport_failure};
use crate::tool_call_engine::{RequestContext, ToolCallEngine};
use crate::tool_processor::ToolProcessor;

pub const ABORT_MESSAGE: &str = "Run aborted.";

/// How a run ended, with its terminal `AssistantMessage` event.
#[derive(Debug, Clone)]
pub enum LoopOutcome {
    Resolved(Event),
    Aborted(Event),
    MaxIterations(Event),
}

impl LoopOutcome {
    pub fn event(&self) -> &Event {
        match self {
            Self::Resolved(e) | Self::Aborted(e) | Self::MaxIterations(e) => e,
        }
    }

    pub fn into_event(self) -> Event {
        match self {
            Self::Resolved(e) | Self::Aborted(e) | Self::MaxIterations(e) => e,
        }
    }
}

/// The core loop that orchestrates model calls and tool execution.
pub struct LoopExecutor {
    /// The model transport for this run
    transport: Arc<dyn ChatTransport>,

    /// Tool-call protocol
    engine: Arc<dyn ToolCallEngine>,

    /// Tool registry, shared and read-only
    tools: Arc<ToolRegistry>,

    hooks: Arc<dyn AgentHooks>,

    /// The model to use
    model: String,

    temperature: Option<f32>,
    max_tokens: Option<u32>,

    /// Base instructions, before the engine adds tool descriptions
    system_prompt: String,

    /// Maximum model calls per run
    max_iterations: u32,

    /// Most recent images kept in projected history
    max_images: Option<usize>,
}

impl LoopExecutor {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        engine: Arc<dyn ToolCallEngine>,
        tools: Arc<ToolRegistry>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            engine,
            tools,
            hooks: Arc::new(NoopHooks),
            model: model.into(),
            temperature: None,
            max_tokens: None,
            system_prompt: String::new(),
            max_iterations: 25,
            max_images: None,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn AgentHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the default max tokens per model response.
    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Set the maximum number of model calls per run.
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_max_images(mut self, max: Option<usize>) -> Self {
        self.max_images = max;
        self
    }

    /// Drive the session until a terminal outcome.
    ///
    /// Transport failures are returned as `Err` after their terminal events
    /// were appended. Abort and the iteration ceiling are ordinary outcomes.
    pub async fn execute(&self, session: &SessionHandle, streaming: bool) -> Result<LoopOutcome, Error> {
        let session_id = session.id.as_str();
        let events = session.events.as_ref();
        let cancel = &session.cancel;

        let tool_definitions = self.tools.definitions();
        let system_prompt = self.engine.prepare_prompt(&self.system_prompt, &tool_definitions);

        info!(
            session_id,
            model = %self.model,
            provider = self.transport.name(),
            streaming,
            "Starting agent loop"
        );

        for iteration in 1..=self.max_iterations {
            if cancel.is_cancelled() {
                return Ok(self.finish_aborted(session_id, events).await);
            }

            debug!(session_id, iteration, "Iterating");
            self.hooks.on_each_agent_loop_start(session_id, iteration).await;

            let messages = message_history::project(
                &events.snapshot(),
                self.engine.as_ref(),
                &system_prompt,
                &tool_definitions,
                self.max_images,
            );
            let request = self.engine.prepare_request(RequestContext {
                model: self.model.clone(),
                messages,
                tools: tool_definitions.clone(),
                temperature: self.temperature,
                max_tokens: self.max_tokens,
            });
            self.hooks.on_llm_request(session_id, &request).await;

            debug!(session_id, iteration, messages = request.messages.len(), "Awaiting model");
            let started = Instant::now();
            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                opened = self.transport.create_chat_completion(request) => Some(opened),
            };

            let rx = match opened {
                None => return Ok(self.finish_aborted(session_id, events).await),
                Some(Ok(rx)) => rx,
                Some(Err(err)) => {
                    warn!(session_id, iteration, error = %err, "Model request failed");
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    let terminal = append_transport_failure(events, &err, Some(elapsed_ms));
                    self.hooks.on_agent_loop_end(session_id, &terminal).await;
                    return Err(Error::Provider(err));
                }
            };

            debug!(session_id, iteration, "Aggregating");
            let response = match StreamAggregator::new(session_id, events, self.engine.as_ref(), cancel)
                .streaming(streaming)
                .aggregate(rx, started)
                .await
            {
                Ok(response) => response,
                Err(Error::Aborted { .. }) => return Ok(self.finish_aborted(session_id, events).await),
                Err(err) => {
                    if let Some(terminal) = events.latest_assistant_message() {
                        self.hooks.on_agent_loop_end(session_id, &terminal).await;
                    }
                    return Err(err);
                }
            };

            self.hooks
                .on_llm_streaming_response(session_id, &response.chunks)
                .await;
            self.hooks.on_llm_response(session_id, &response.completion).await;

            let calls = response.parsed.tool_calls();
            if calls.is_empty() {
                debug!(session_id, iteration, "Resolved");
                self.hooks.on_agent_loop_end(session_id, &response.event).await;
                return Ok(LoopOutcome::Resolved(response.event));
            }

            if cancel.is_cancelled() {
                return Ok(self.finish_aborted(session_id, events).await);
            }

            debug!(session_id, iteration, tool_calls = calls.len(), "Executing tools");
            ToolProcessor::new(session_id, events, &self.tools, self.hooks.as_ref(), cancel)
                .process(calls)
                .await;

            if cancel.is_cancelled() {
                return Ok(self.finish_aborted(session_id, events).await);
            }
        }

        warn!(session_id, max_iterations = self.max_iterations, "Max iterations reached");
        events.append(EventKind::system(
            SystemLevel::Warning,
            format!("Stopped after {} iterations", self.max_iterations),
        ));
        let terminal = events.append(EventKind::AssistantMessage(AssistantMessage::terminal(
            format!(
                "Reached the maximum of {} iterations without a final answer.",
                self.max_iterations
            ),
            FinishReason::MaxIterations,
        )));
        self.hooks.on_agent_loop_end(session_id, &terminal).await;
        Ok(LoopOutcome::MaxIterations(terminal))
    }

    async fn finish_aborted(&self, session_id: &str, events: &EventStream) -> LoopOutcome {
        debug!(session_id, "Aborted");
        let terminal = append_abort(events);
        self.hooks.on_agent_loop_end(session_id, &terminal).await;
        LoopOutcome::Aborted(terminal)
    }
}

/// Close a run's log with the abort warning and terminal `Abort` message.
pub(crate) fn append_abort(events: &EventStream) -> Event {
    events.append(EventKind::system(SystemLevel::Warning, "Run aborted by request"));
    events.append(EventKind::AssistantMessage(AssistantMessage::terminal(
        ABORT_MESSAGE,
        FinishReason::Abort,
    )))
}
