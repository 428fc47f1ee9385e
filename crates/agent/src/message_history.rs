//! Projection of a session's event log into the message list sent to the model.
//!
//! The projection is a pure function of the events, the tool-call engine, the
//! base system prompt, the tool definitions and the image budget.

use ironloop_core::event::{AssistantMessage, Event, EventKind, FinishReason, ToolResultEvent};
use ironloop_core::message::{ChatMessage, ContentPart, MessageContent};
use ironloop_core::provider::ToolDefinition;
use std::collections::HashSet;

use crate::tool_call_engine::ToolCallEngine;

/// Text that replaces an image dropped by the image budget.
pub const IMAGE_PLACEHOLDER: &str = "[Image omitted to conserve context]";

/// (event index, part index) of an image to omit.
type ImageRef = (usize, usize);

/// Build the model messages for `events`.
///
/// The first message is always the engine's system prompt. User messages map
/// one to one. Each assistant message is followed by the results of its own
/// tool calls, found by scanning forward to the next turn boundary. System
/// events, streaming deltas and failed (`error`) turns are not projected.
pub fn project(
    events: &[Event],
    engine: &dyn ToolCallEngine,
    system_prompt: &str,
    tools: &[ToolDefinition],
    max_images: Option<usize>,
) -> Vec<ChatMessage> {
    let omitted = max_images
        .map(|limit| images_to_omit(events, limit))
        .unwrap_or_default();

    let mut messages = vec![ChatMessage::system(engine.prepare_prompt(system_prompt, tools))];

    for (index, event) in events.iter().enumerate() {
        match &event.kind {
            EventKind::UserMessage { content } => {
                messages.push(ChatMessage::user(redact_user_content(content, index, &omitted)));
            }
            EventKind::AssistantMessage(message) if message.finish_reason != FinishReason::Error => {
                let results = results_for(events, index, message, &omitted);
                let answered = answered_only(message, &results);
                messages.push(engine.build_historical_assistant_message(&answered));
                if !results.is_empty() {
                    messages.extend(engine.build_historical_tool_call_result_messages(&results));
                }
            }
            _ => {}
        }
    }

    messages
}

/// The tool results belonging to the assistant message at `index`, in call order.
fn results_for(
    events: &[Event],
    index: usize,
    message: &AssistantMessage,
    omitted: &HashSet<ImageRef>,
) -> Vec<ToolResultEvent> {
    result_indices(events, index, message)
        .into_iter()
        .filter_map(|offset| match &events[offset].kind {
            EventKind::ToolResult(result) => Some(redact_tool_result(result, offset, omitted)),
            _ => None,
        })
        .collect()
}

/// Log indices of the results answering `message`'s calls, in call order.
///
/// Scans forward to the next turn boundary; a repeated result for the same
/// call id is ignored.
fn result_indices(events: &[Event], index: usize, message: &AssistantMessage) -> Vec<usize> {
    if !message.has_tool_calls() {
        return Vec::new();
    }

    let mut found: Vec<(usize, usize, &str)> = Vec::new();
    for (offset, event) in events.iter().enumerate().skip(index + 1) {
        if event.is_turn_boundary() {
            break;
        }
        if let EventKind::ToolResult(result) = &event.kind {
            let position = message
                .tool_calls()
                .iter()
                .position(|call| call.id == result.tool_call_id);
            if let Some(position) = position {
                if found.iter().all(|(_, _, id)| *id != result.tool_call_id) {
                    found.push((position, offset, result.tool_call_id.as_str()));
                }
            }
        }
    }

    found.sort_by_key(|(position, _, _)| *position);
    found.into_iter().map(|(_, offset, _)| offset).collect()
}

/// Indices of tool results that `project` will emit.
fn projected_results(events: &[Event]) -> HashSet<usize> {
    events
        .iter()
        .enumerate()
        .filter_map(|(index, event)| match &event.kind {
            EventKind::AssistantMessage(message) if message.finish_reason != FinishReason::Error => {
                Some(result_indices(events, index, message))
            }
            _ => None,
        })
        .flatten()
        .collect()
}

/// The assistant message restricted to calls that have a recorded result.
///
/// Calls skipped by an abort never ran; sending them back without a result
/// would make the next request invalid.
fn answered_only(message: &AssistantMessage, results: &[ToolResultEvent]) -> AssistantMessage {
    let Some(calls) = &message.tool_calls else {
        return message.clone();
    };
    let kept: Vec<_> = calls
        .iter()
        .filter(|call| results.iter().any(|r| r.tool_call_id == call.id))
        .cloned()
        .collect();
    AssistantMessage {
        tool_calls: (!kept.is_empty()).then_some(kept),
        ..message.clone()
    }
}

/// Every image part that will be projected, oldest first.
fn image_refs(events: &[Event]) -> Vec<ImageRef> {
    let projected = projected_results(events);
    let mut refs = Vec::new();
    for (index, event) in events.iter().enumerate() {
        let parts = match &event.kind {
            EventKind::UserMessage {
                content: MessageContent::Parts(parts),
            } => parts.clone(),
            EventKind::ToolResult(result) if projected.contains(&index) => {
                ContentPart::from_tool_output(&result.content)
            }
            _ => continue,
        };
        refs.extend(
            parts
                .iter()
                .enumerate()
                .filter(|(_, part)| part.is_image())
                .map(|(part, _)| (index, part)),
        );
    }
    refs
}

/// The oldest images beyond the newest `limit`.
fn images_to_omit(events: &[Event], limit: usize) -> HashSet<ImageRef> {
    let refs = image_refs(events);
    let excess = refs.len().saturating_sub(limit);
    refs.into_iter().take(excess).collect()
}

fn replace_omitted(parts: Vec<ContentPart>, index: usize, omitted: &HashSet<ImageRef>) -> Vec<ContentPart> {
    parts
        .into_iter()
        .enumerate()
        .map(|(part_index, part)| {
            if omitted.contains(&(index, part_index)) {
                ContentPart::text(IMAGE_PLACEHOLDER)
            } else {
                part
            }
        })
        .collect()
}

fn redact_user_content(content: &MessageContent, index: usize, omitted: &HashSet<ImageRef>) -> MessageContent {
    match content {
        MessageContent::Parts(parts) if omitted.iter().any(|(i, _)| *i == index) => {
            MessageContent::Parts(replace_omitted(parts.clone(), index, omitted))
        }
        other => other.clone(),
    }
}

fn redact_tool_result(result: &ToolResultEvent, index: usize, omitted: &HashSet<ImageRef>) -> ToolResultEvent {
    if !omitted.iter().any(|(i, _)| *i == index) {
        return result.clone();
    }
    let parts = replace_omitted(ContentPart::from_tool_output(&result.content), index, omitted);
    ToolResultEvent {
        content: serde_json::to_value(parts).unwrap_or(serde_json::Value::Null),
        ..result.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool_call_engine::{NativeEngine, PromptEngineeringEngine};
    use ironloop_core::event::{EventStream, SystemLevel};
    use ironloop_core::message::{Role, ToolCallRequest};

    fn assistant_with_calls(content: &str, calls: &[(&str, &str)]) -> EventKind {
        let mut msg = AssistantMessage::terminal(content, FinishReason::ToolCalls);
        msg.tool_calls = Some(
            calls
                .iter()
                .map(|(id, name)| ToolCallRequest::new(*id, *name, "{}"))
                .collect(),
        );
        EventKind::AssistantMessage(msg)
    }

    fn tool_result(id: &str, name: &str, content: serde_json::Value) -> EventKind {
        EventKind::ToolResult(ToolResultEvent {
            tool_call_id: id.into(),
            name: name.into(),
            content,
            elapsed_ms: 1,
            error: None,
        })
    }

    fn answer(text: &str) -> EventKind {
        EventKind::AssistantMessage(AssistantMessage::terminal(text, FinishReason::Stop))
    }

    fn image_turn(url: &str) -> EventKind {
        EventKind::user(vec![ContentPart::text("look"), ContentPart::image(url)])
    }

    #[test]
    fn system_prompt_first_then_turns_in_order() {
        let stream = EventStream::new();
        stream.append(EventKind::user("what is 2+2?"));
        stream.append(assistant_with_calls("", &[("c1", "calc")]));
        stream.append(EventKind::system(SystemLevel::Info, "not projected"));
        stream.append(tool_result("c1", "calc", serde_json::json!("4")));
        stream.append(answer("It is 4."));

        let messages = project(&stream.snapshot(), &NativeEngine, "be brief", &[], None);
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );
        assert_eq!(messages[0].text(), "be brief");
        assert_eq!(messages[3].text(), "4");
        assert_eq!(messages[4].text(), "It is 4.");
    }

    #[test]
    fn projection_is_idempotent() {
        let stream = EventStream::new();
        stream.append(image_turn("https://x/1.png"));
        stream.append(answer("ok"));
        let events = stream.snapshot();

        let first = project(&events, &PromptEngineeringEngine, "sys", &[], Some(1));
        let second = project(&events, &PromptEngineeringEngine, "sys", &[], Some(1));
        assert_eq!(first, second);
    }

    #[test]
    fn results_are_matched_by_id_and_ordered_by_call() {
        let stream = EventStream::new();
        stream.append(EventKind::user("go"));
        stream.append(assistant_with_calls("", &[("a", "one"), ("b", "two")]));
        stream.append(tool_result("b", "two", serde_json::json!("second")));
        stream.append(tool_result("a", "one", serde_json::json!("first")));
        stream.append(tool_result("zzz", "stray", serde_json::json!("ignored")));

        let messages = project(&stream.snapshot(), &NativeEngine, "", &[], None);
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[3].tool_call_id.as_deref(), Some("a"));
        assert_eq!(messages[4].tool_call_id.as_deref(), Some("b"));
    }

    #[test]
    fn results_after_next_turn_boundary_are_not_attached() {
        let stream = EventStream::new();
        stream.append(assistant_with_calls("", &[("a", "one")]));
        stream.append(EventKind::user("interrupt"));
        stream.append(tool_result("a", "one", serde_json::json!("late")));

        let messages = project(&stream.snapshot(), &NativeEngine, "", &[], None);
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::Assistant, Role::User]);
        assert!(messages[1].tool_calls.is_empty());
    }

    #[test]
    fn unanswered_calls_are_dropped_from_history() {
        let stream = EventStream::new();
        stream.append(EventKind::user("go"));
        stream.append(assistant_with_calls("", &[("a", "one"), ("b", "two")]));
        stream.append(tool_result("a", "one", serde_json::json!("done")));

        let messages = project(&stream.snapshot(), &NativeEngine, "", &[], None);
        assert_eq!(messages[2].tool_calls.len(), 1);
        assert_eq!(messages[2].tool_calls[0].id, "a");
    }

    #[test]
    fn error_turns_are_skipped() {
        let stream = EventStream::new();
        stream.append(EventKind::user("hi"));
        stream.append(EventKind::AssistantMessage(AssistantMessage::terminal(
            "connection reset",
            FinishReason::Error,
        )));
        stream.append(EventKind::user("again"));

        let messages = project(&stream.snapshot(), &NativeEngine, "", &[], None);
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::User]);
    }

    #[test]
    fn image_budget_replaces_oldest_images() {
        let stream = EventStream::new();
        stream.append(image_turn("https://x/old.png"));
        stream.append(answer("seen"));
        stream.append(image_turn("https://x/new.png"));

        let messages = project(&stream.snapshot(), &NativeEngine, "", &[], Some(1));
        let old = messages[1].content.as_ref().unwrap().parts();
        let new = messages[3].content.as_ref().unwrap().parts();

        assert_eq!(old[0], ContentPart::text("look"));
        assert_eq!(old[1], ContentPart::text(IMAGE_PLACEHOLDER));
        assert_eq!(new[1], ContentPart::image("https://x/new.png"));
    }

    #[test]
    fn image_budget_counts_tool_result_images() {
        let stream = EventStream::new();
        stream.append(image_turn("https://x/user.png"));
        stream.append(assistant_with_calls("", &[("c1", "camera")]));
        stream.append(tool_result(
            "c1",
            "camera",
            serde_json::json!([{"type": "image_url", "image_url": {"url": "https://x/tool.png"}}]),
        ));

        let messages = project(&stream.snapshot(), &NativeEngine, "", &[], Some(1));
        let user_parts = messages[1].content.as_ref().unwrap().parts();
        assert_eq!(user_parts[1], ContentPart::text(IMAGE_PLACEHOLDER));

        // tool message (text only), then the image as a user message
        assert_eq!(messages[3].role, Role::Tool);
        assert_eq!(messages[4].content.as_ref().unwrap().image_count(), 1);
    }

    #[test]
    fn image_budget_ignores_results_that_are_not_projected() {
        let image = |url: &str| serde_json::json!([{"type": "image_url", "image_url": {"url": url}}]);
        let stream = EventStream::new();
        stream.append(image_turn("https://x/user.png"));
        stream.append(assistant_with_calls("", &[("c1", "camera")]));
        stream.append(tool_result("c9", "camera", image("https://x/stray.png")));
        stream.append(tool_result("c1", "camera", image("https://x/tool.png")));

        let messages = project(&stream.snapshot(), &NativeEngine, "", &[], Some(2));
        let user_parts = messages[1].content.as_ref().unwrap().parts();
        assert_eq!(user_parts[1], ContentPart::image("https://x/user.png"));
        assert_eq!(messages[4].content.as_ref().unwrap().image_count(), 1);
    }

    #[test]
    fn no_budget_keeps_every_image() {
        let stream = EventStream::new();
        stream.append(image_turn("https://x/1.png"));
        stream.append(image_turn("https://x/2.png"));
        let messages = project(&stream.snapshot(), &NativeEngine, "", &[], None);
        assert_eq!(messages[1].content.as_ref().unwrap().image_count(), 1);
        assert_eq!(messages[2].content.as_ref().unwrap().image_count(), 1);
    }
}
