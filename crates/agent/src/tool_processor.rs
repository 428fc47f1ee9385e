//! Sequential execution of one assistant turn's tool calls.

use ironloop_core::error::ToolError;
use ironloop_core::event::{EventKind, EventStream, ToolCallEvent, ToolInfo, ToolResultEvent};
use ironloop_core::message::ToolCallRequest;
use ironloop_core::tool::ToolRegistry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::hooks::AgentHooks;

/// Error recorded for calls interrupted by cancellation.
pub const ABORTED_ERROR: &str = "aborted";

pub struct ToolProcessor<'a> {
    session_id: &'a str,
    events: &'a EventStream,
    tools: &'a ToolRegistry,
    hooks: &'a dyn AgentHooks,
    cancel: &'a CancellationToken,
}

impl<'a> ToolProcessor<'a> {
    pub fn new(
        session_id: &'a str,
        events: &'a EventStream,
        tools: &'a ToolRegistry,
        hooks: &'a dyn AgentHooks,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            session_id,
            events,
            tools,
            hooks,
            cancel,
        }
    }

    /// Run every call in order, emitting one `ToolCall`/`ToolResult` pair each.
    ///
    /// A failing call never stops the batch. Cancellation skips the remaining
    /// calls; a call whose `ToolCall` was already emitted still gets its
    /// `ToolResult{error: "aborted"}`.
    pub async fn process(&self, calls: &[ToolCallRequest]) -> Vec<ToolResultEvent> {
        let mut results = Vec::with_capacity(calls.len());

        for call in calls {
            if self.cancel.is_cancelled() {
                debug!(session_id = %self.session_id, skipped = calls.len() - results.len(), "Skipping remaining tool calls");
                break;
            }

            let parsed = parse_arguments(call);
            let shown_arguments = match &parsed {
                Ok(value) => value.clone(),
                Err(_) => serde_json::Value::String(call.arguments.clone()),
            };

            self.events.append(EventKind::ToolCall(ToolCallEvent {
                tool_call_id: call.id.clone(),
                name: call.name.clone(),
                arguments: shown_arguments,
                tool: self.tool_info(&call.name),
                start_time: self.events.runtime().now(),
            }));

            let outcome = match parsed {
                Ok(arguments) => {
                    let arguments = self
                        .hooks
                        .on_before_tool_call(self.session_id, call, arguments)
                        .await;

                    if self.cancel.is_cancelled() {
                        results.push(self.record_aborted(call, 0));
                        break;
                    }

                    let execution = self.tools.execute_tool(&call.name, &call.id, arguments).await;

                    if self.cancel.is_cancelled() {
                        results.push(self.record_aborted(call, execution.elapsed_ms));
                        break;
                    }
                    (execution.result, execution.elapsed_ms)
                }
                Err(err) => (Err(err), 0),
            };

            let result = match outcome {
                (Ok(value), elapsed_ms) => {
                    let content = self.hooks.on_after_tool_call(self.session_id, call, value).await;
                    ToolResultEvent {
                        tool_call_id: call.id.clone(),
                        name: call.name.clone(),
                        content,
                        elapsed_ms,
                        error: None,
                    }
                }
                (Err(err), elapsed_ms) => {
                    warn!(session_id = %self.session_id, tool = %call.name, error = %err, "Tool call failed");
                    let recovered = self.hooks.on_tool_call_error(self.session_id, call, &err).await;
                    ToolResultEvent {
                        tool_call_id: call.id.clone(),
                        name: call.name.clone(),
                        content: recovered.unwrap_or(serde_json::Value::Null),
                        elapsed_ms,
                        error: Some(err.to_string()),
                    }
                }
            };

            self.events.append(EventKind::ToolResult(result.clone()));
            results.push(result);
        }

        results
    }

    fn tool_info(&self, name: &str) -> ToolInfo {
        match self.tools.get(name) {
            Some(tool) => ToolInfo {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                schema: tool.parameters_schema(),
            },
            None => ToolInfo {
                name: name.to_string(),
                description: String::new(),
                schema: serde_json::Value::Null,
            },
        }
    }

    fn record_aborted(&self, call: &ToolCallRequest, elapsed_ms: u64) -> ToolResultEvent {
        debug!(session_id = %self.session_id, tool = %call.name, "Tool call aborted");
        let result = ToolResultEvent {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            content: serde_json::Value::Null,
            elapsed_ms,
            error: Some(ABORTED_ERROR.to_string()),
        };
        self.events.append(EventKind::ToolResult(result.clone()));
        result
    }
}

fn parse_arguments(call: &ToolCallRequest) -> Result<serde_json::Value, ToolError> {
    if call.arguments.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_str(&call.arguments)
        .map_err(|e| ToolError::InvalidArguments(format!("{}: {e}", call.name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::NoopHooks;
    use crate::test_helpers::{BlockingTool, RecordingHooks, registry};
    use ironloop_core::event::{Event, EventType};
    use std::sync::Arc;

    fn pairs(events: &[Event]) -> Vec<(EventType, String)> {
        events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::ToolCall(c) => Some((EventType::ToolCall, c.tool_call_id.clone())),
                EventKind::ToolResult(r) => Some((EventType::ToolResult, r.tool_call_id.clone())),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn failure_does_not_stop_the_batch() {
        let events = EventStream::new();
        let tools = registry();
        let cancel = CancellationToken::new();
        let processor = ToolProcessor::new("s1", &events, &tools, &NoopHooks, &cancel);

        let calls = vec![
            ToolCallRequest::new("c1", "fail", "{}"),
            ToolCallRequest::new("c2", "echo", r#"{"text":"hi"}"#),
        ];
        let results = processor.process(&calls).await;

        assert_eq!(results.len(), 2);
        assert!(results[0].error.as_deref().unwrap().contains("boom"));
        assert_eq!(results[0].content, serde_json::Value::Null);
        assert_eq!(results[1].content, serde_json::json!({"text": "hi"}));
        assert!(results[1].error.is_none());

        assert_eq!(
            pairs(&events.snapshot()),
            vec![
                (EventType::ToolCall, "c1".into()),
                (EventType::ToolResult, "c1".into()),
                (EventType::ToolCall, "c2".into()),
                (EventType::ToolResult, "c2".into()),
            ]
        );
    }

    #[tokio::test]
    async fn unknown_tool_and_bad_json_are_tool_failures() {
        let events = EventStream::new();
        let tools = registry();
        let cancel = CancellationToken::new();
        let processor = ToolProcessor::new("s1", &events, &tools, &NoopHooks, &cancel);

        let results = processor
            .process(&[
                ToolCallRequest::new("c1", "missing", "{}"),
                ToolCallRequest::new("c2", "echo", "{not json"),
            ])
            .await;

        assert!(results[0].error.as_deref().unwrap().contains("not found"));
        assert!(results[1].error.as_deref().unwrap().contains("Invalid tool arguments"));

        let snapshot = events.snapshot();
        let EventKind::ToolCall(call) = &snapshot[2].kind else {
            panic!("expected tool call");
        };
        assert_eq!(call.arguments, serde_json::json!("{not json"));
        assert_eq!(call.tool.name, "echo");
    }

    #[tokio::test]
    async fn empty_arguments_become_empty_object() {
        let events = EventStream::new();
        let tools = registry();
        let cancel = CancellationToken::new();
        let processor = ToolProcessor::new("s1", &events, &tools, &NoopHooks, &cancel);

        let results = processor.process(&[ToolCallRequest::new("c1", "echo", "")]).await;
        assert_eq!(results[0].content, serde_json::json!({}));
    }

    #[tokio::test]
    async fn hooks_run_around_each_call() {
        let events = EventStream::new();
        let tools = registry();
        let cancel = CancellationToken::new();
        let hooks = RecordingHooks::default();
        let processor = ToolProcessor::new("s1", &events, &tools, &hooks, &cancel);

        let results = processor
            .process(&[
                ToolCallRequest::new("c1", "echo", "{}"),
                ToolCallRequest::new("c2", "fail", "{}"),
            ])
            .await;

        assert_eq!(hooks.calls(), vec!["before:echo", "after:echo", "before:fail", "error:fail"]);
        assert_eq!(results[1].content, serde_json::json!({"recovered": true}));
        assert!(results[1].error.is_some());
    }

    #[tokio::test]
    async fn cancelled_before_start_emits_nothing() {
        let events = EventStream::new();
        let tools = registry();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let processor = ToolProcessor::new("s1", &events, &tools, &NoopHooks, &cancel);

        let results = processor.process(&[ToolCallRequest::new("c1", "echo", "{}")]).await;
        assert!(results.is_empty());
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn in_flight_call_is_recorded_as_aborted() {
        let (tool, started, release) = BlockingTool::new();
        let mut registry = ironloop_core::tool::ToolRegistry::new();
        registry.register(Box::new(tool));
        registry.register(Box::new(crate::test_helpers::EchoTool));
        let tools = Arc::new(registry);

        let events = Arc::new(EventStream::new());
        let cancel = CancellationToken::new();

        let task = {
            let events = events.clone();
            let tools = tools.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let processor = ToolProcessor::new("s1", &events, &tools, &NoopHooks, &cancel);
                processor
                    .process(&[
                        ToolCallRequest::new("c1", "block", "{}"),
                        ToolCallRequest::new("c2", "echo", "{}"),
                    ])
                    .await
            })
        };

        started.notified().await;
        cancel.cancel();
        release.notify_one();

        let results = task.await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].error.as_deref(), Some(ABORTED_ERROR));
        assert_eq!(
            pairs(&events.snapshot()),
            vec![
                (EventType::ToolCall, "c1".into()),
                (EventType::ToolResult, "c1".into()),
            ]
        );
    }
}
