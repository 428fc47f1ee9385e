//! Pull-based view of a session's events.
//!
//! The event log pushes synchronously to subscribers; `EventSequence` buffers
//! those pushes and hands them out as a `futures::Stream`. Only one consumer
//! waits at a time, so a single waker slot is enough.

use futures::Stream;
use ironloop_core::event::{Event, EventStream, EventType, SubscriptionId};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use tokio_util::sync::CancellationToken;

/// Event types forwarded to stream consumers.
pub const STREAMED_EVENT_TYPES: &[EventType] = &[
    EventType::AssistantMessage,
    EventType::AssistantThinkingMessage,
    EventType::AssistantStreamingMessage,
    EventType::AssistantStreamingThinkingMessage,
    EventType::ToolCall,
    EventType::ToolResult,
    EventType::System,
];

#[derive(Default)]
struct Shared {
    queue: VecDeque<Event>,
    waker: Option<Waker>,
    done: bool,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Events of one run, ending with its terminal `AssistantMessage`.
///
/// Dropping the sequence before the terminal message was delivered
/// cancels the run.
pub struct EventSequence {
    session_id: String,
    events: Arc<EventStream>,
    subscription: SubscriptionId,
    cancel: CancellationToken,
    shared: Arc<Mutex<Shared>>,
    finished: bool,
}

impl EventSequence {
    /// Subscribe before the run appends anything so no event is missed.
    pub fn attach(session_id: impl Into<String>, events: Arc<EventStream>, cancel: CancellationToken) -> Self {
        let shared = Arc::new(Mutex::new(Shared::default()));

        let sink = shared.clone();
        let subscription = events.subscribe_types(STREAMED_EVENT_TYPES, move |event| {
            let waker = {
                let mut state = lock(&sink);
                if state.done {
                    return;
                }
                state.queue.push_back(event.clone());
                if is_terminal(event) {
                    state.done = true;
                }
                state.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        });

        Self {
            session_id: session_id.into(),
            events,
            subscription,
            cancel,
            shared,
            finished: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether the terminal message has been handed out.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// A final answer, or any terminal outcome (error, abort, max iterations).
fn is_terminal(event: &Event) -> bool {
    event.as_assistant().is_some_and(|message| !message.has_tool_calls())
}

impl Stream for EventSequence {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        let mut state = lock(&this.shared);
        match state.queue.pop_front() {
            Some(event) => {
                if state.done && state.queue.is_empty() {
                    this.finished = true;
                }
                Poll::Ready(Some(event))
            }
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl Drop for EventSequence {
    fn drop(&mut self) {
        self.events.unsubscribe(self.subscription);
        if !self.finished {
            tracing::debug!(session_id = %self.session_id, "Event sequence dropped early, cancelling run");
            self.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use ironloop_core::event::{AssistantMessage, EventKind, FinishReason, SystemLevel};
    use ironloop_core::message::ToolCallRequest;

    fn assistant(tool_calls: bool) -> EventKind {
        let mut message = AssistantMessage::terminal("text", FinishReason::Stop);
        if tool_calls {
            message.tool_calls = Some(vec![ToolCallRequest::new("c1", "echo", "{}")]);
            message.finish_reason = FinishReason::ToolCalls;
        }
        EventKind::AssistantMessage(message)
    }

    #[tokio::test]
    async fn yields_relevant_events_until_final_answer() {
        let events = Arc::new(EventStream::new());
        let cancel = CancellationToken::new();
        let mut sequence = EventSequence::attach("s1", events.clone(), cancel.clone());

        events.append(EventKind::user("hi"));
        events.append(assistant(true));
        events.append(EventKind::system(SystemLevel::Info, "note"));
        events.append(assistant(false));
        events.append(EventKind::system(SystemLevel::Info, "after"));

        let collected: Vec<EventType> = (&mut sequence).map(|e| e.event_type()).collect().await;
        assert_eq!(
            collected,
            vec![EventType::AssistantMessage, EventType::System, EventType::AssistantMessage]
        );
        assert!(sequence.is_finished());

        drop(sequence);
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn wakes_pending_consumer() {
        let events = Arc::new(EventStream::new());
        let mut sequence = EventSequence::attach("s1", events.clone(), CancellationToken::new());

        let producer = {
            let events = events.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                events.append(assistant(false));
            })
        };

        let event = sequence.next().await.unwrap();
        assert_eq!(event.event_type(), EventType::AssistantMessage);
        assert!(sequence.next().await.is_none());
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn early_drop_cancels_and_unsubscribes() {
        let events = Arc::new(EventStream::new());
        let cancel = CancellationToken::new();
        let sequence = EventSequence::attach("s1", events.clone(), cancel.clone());
        assert_eq!(sequence.session_id(), "s1");

        events.append(assistant(true));
        drop(sequence);

        assert!(cancel.is_cancelled());
        assert!(!events.unsubscribe(1));
    }
}
