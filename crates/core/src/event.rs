//! Event-sourced conversation state.
//!
//! Every step of a run (user input, model output, tool calls, warnings) is
//! recorded as an immutable [`Event`] in a per-session [`EventStream`].
//! The message list sent to the model is a projection of this log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::message::{MessageContent, ToolCallRequest};
use crate::runtime::RuntimeConfig;

/// Discriminant of an [`EventKind`], used for subscription and query filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    UserMessage,
    AssistantMessage,
    AssistantThinkingMessage,
    AssistantStreamingMessage,
    AssistantStreamingThinkingMessage,
    ToolCall,
    ToolResult,
    System,
}

/// Terminal classification of one model turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Error,
    Abort,
    MaxIterations,
}

impl FinishReason {
    /// Map a provider's `finish_reason` string. Unknown values count as `stop`.
    pub fn from_wire(value: &str) -> Self {
        match value {
            "tool_calls" | "function_call" => Self::ToolCalls,
            "length" => Self::Length,
            "content_filter" => Self::ContentFilter,
            _ => Self::Stop,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemLevel {
    Info,
    Warning,
    Error,
}

/// Snapshot of the tool definition a call was dispatched against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub schema: serde_json::Value,
}

/// One consolidated model turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub content: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,

    pub finish_reason: FinishReason,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,

    /// Shared with the streaming deltas of the same turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl AssistantMessage {
    /// A terminal message with no tool calls (abort, error, max iterations).
    pub fn terminal(content: impl Into<String>, finish_reason: FinishReason) -> Self {
        Self {
            content: content.into(),
            tool_calls: None,
            finish_reason,
            elapsed_ms: None,
            reasoning_content: None,
            message_id: None,
        }
    }

    pub fn tool_calls(&self) -> &[ToolCallRequest] {
        self.tool_calls.as_deref().unwrap_or_default()
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallEvent {
    pub tool_call_id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    pub tool: ToolInfo,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultEvent {
    pub tool_call_id: String,
    pub name: String,
    pub content: serde_json::Value,
    pub elapsed_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    UserMessage {
        content: MessageContent,
    },
    AssistantMessage(AssistantMessage),
    AssistantThinkingMessage {
        content: String,
    },
    AssistantStreamingMessage {
        content: String,
        is_complete: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    AssistantStreamingThinkingMessage {
        content: String,
        is_complete: bool,
    },
    ToolCall(ToolCallEvent),
    ToolResult(ToolResultEvent),
    System {
        level: SystemLevel,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::UserMessage { .. } => EventType::UserMessage,
            Self::AssistantMessage(_) => EventType::AssistantMessage,
            Self::AssistantThinkingMessage { .. } => EventType::AssistantThinkingMessage,
            Self::AssistantStreamingMessage { .. } => EventType::AssistantStreamingMessage,
            Self::AssistantStreamingThinkingMessage { .. } => {
                EventType::AssistantStreamingThinkingMessage
            }
            Self::ToolCall(_) => EventType::ToolCall,
            Self::ToolResult(_) => EventType::ToolResult,
            Self::System { .. } => EventType::System,
        }
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::UserMessage {
            content: content.into(),
        }
    }

    pub fn system(level: SystemLevel, message: impl Into<String>) -> Self {
        Self::System {
            level,
            message: message.into(),
            details: None,
        }
    }
}

/// An immutable, appended event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }

    pub fn as_assistant(&self) -> Option<&AssistantMessage> {
        match &self.kind {
            EventKind::AssistantMessage(msg) => Some(msg),
            _ => None,
        }
    }

    /// An assistant message that requests no tools ends a run.
    pub fn is_final_answer(&self) -> bool {
        self.as_assistant().is_some_and(|m| !m.has_tool_calls())
    }

    /// User and assistant messages delimit turns.
    pub fn is_turn_boundary(&self) -> bool {
        matches!(
            self.kind,
            EventKind::UserMessage { .. } | EventKind::AssistantMessage(_)
        )
    }
}

/// Handle returned by [`EventStream::subscribe`].
pub type SubscriptionId = u64;

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;
type Predicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    predicate: Option<Predicate>,
    callback: Callback,
}

#[derive(Default)]
struct LogState {
    events: Vec<Event>,
    seq: u64,
    last_timestamp: Option<DateTime<Utc>>,
    /// Appended but not yet delivered to subscribers.
    pending: VecDeque<Event>,
    dispatching: bool,
}

/// Append-only, strictly ordered event log with synchronous multicast.
///
/// Subscribers run on the appending thread, outside the log lock, so a
/// callback may query the stream or even append to it. Delivery order always
/// equals append order: an append made while another append is still
/// delivering is queued and delivered by the active dispatcher.
pub struct EventStream {
    runtime: RuntimeConfig,
    log: Mutex<LogState>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscription: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Releases the dispatch flag if a subscriber panics mid-delivery.
struct DispatchGuard<'a> {
    log: &'a Mutex<LogState>,
    drained: bool,
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        if !self.drained {
            lock(self.log).dispatching = false;
        }
    }
}

impl EventStream {
    pub fn new() -> Self {
        Self::with_runtime(RuntimeConfig::default())
    }

    pub fn with_runtime(runtime: RuntimeConfig) -> Self {
        Self {
            runtime,
            log: Mutex::new(LogState::default()),
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    /// Append an event and deliver it to every matching subscriber.
    pub fn append(&self, kind: EventKind) -> Event {
        let event = {
            let mut log = lock(&self.log);
            log.seq += 1;

            let now = self.runtime.now();
            let timestamp = match log.last_timestamp {
                Some(last) if last > now => last,
                _ => now,
            };
            log.last_timestamp = Some(timestamp);

            let id = if self.runtime.deterministic_ids {
                format!("evt-{:06}", log.seq)
            } else {
                uuid::Uuid::new_v4().to_string()
            };

            let event = Event {
                id,
                timestamp,
                kind,
            };
            log.events.push(event.clone());
            log.pending.push_back(event.clone());

            if log.dispatching {
                return event;
            }
            log.dispatching = true;
            event
        };

        self.drain_pending();
        event
    }

    fn drain_pending(&self) {
        let mut guard = DispatchGuard {
            log: &self.log,
            drained: false,
        };
        loop {
            let next = {
                let mut log = lock(&self.log);
                match log.pending.pop_front() {
                    Some(event) => event,
                    None => {
                        log.dispatching = false;
                        guard.drained = true;
                        return;
                    }
                }
            };

            let subscribers = lock(&self.subscribers).clone();
            for subscriber in &subscribers {
                let matches = subscriber
                    .predicate
                    .as_ref()
                    .is_none_or(|predicate| predicate(&next));
                if matches {
                    (subscriber.callback)(&next);
                }
            }
        }
    }

    /// Subscribe to events accepted by `predicate`.
    pub fn subscribe<P, F>(&self, predicate: P, callback: F) -> SubscriptionId
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.insert_subscriber(Some(Arc::new(predicate)), Arc::new(callback))
    }

    /// Subscribe to every event.
    pub fn subscribe_all<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.insert_subscriber(None, Arc::new(callback))
    }

    /// Subscribe to a fixed set of event types.
    pub fn subscribe_types<F>(&self, types: &[EventType], callback: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let types = types.to_vec();
        self.subscribe(move |event| types.contains(&event.event_type()), callback)
    }

    fn insert_subscriber(&self, predicate: Option<Predicate>, callback: Callback) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        lock(&self.subscribers).push(Subscriber {
            id,
            predicate,
            callback,
        });
        id
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = lock(&self.subscribers);
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Ordered events, optionally filtered by type; `limit` keeps the latest N.
    pub fn query(&self, types: Option<&[EventType]>, limit: Option<usize>) -> Vec<Event> {
        let log = lock(&self.log);
        let matching: Vec<&Event> = log
            .events
            .iter()
            .filter(|e| types.is_none_or(|t| t.contains(&e.event_type())))
            .collect();
        let skip = limit.map_or(0, |n| matching.len().saturating_sub(n));
        matching.into_iter().skip(skip).cloned().collect()
    }

    /// The whole log.
    pub fn snapshot(&self) -> Vec<Event> {
        lock(&self.log).events.clone()
    }

    pub fn latest_assistant_message(&self) -> Option<Event> {
        lock(&self.log)
            .events
            .iter()
            .rev()
            .find(|e| e.event_type() == EventType::AssistantMessage)
            .cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.log).events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every event. Subscriptions are kept.
    pub fn clear(&self) {
        let mut log = lock(&self.log);
        log.events.clear();
        log.pending.clear();
    }
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("events", &self.len())
            .field("subscribers", &lock(&self.subscribers).len())
            .finish()
    }
}
