//! Deterministic transport that replays scripted chunk turns.
//!
//! Each call to `create_chat_completion` consumes the next turn. Every
//! request is recorded so tests can assert on what the model was sent.

use async_trait::async_trait;
use ironloop_core::error::ProviderError;
use ironloop_core::provider::{ChatCompletionChunk, ChatCompletionRequest, ChatTransport, ChunkReceiver};
use std::sync::Mutex;

/// One scripted model turn.
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    /// Stream these items, then close the stream.
    Chunks(Vec<Result<ChatCompletionChunk, ProviderError>>),
    /// Fail before the stream opens.
    Fail(ProviderError),
    /// Stream these items, then keep the stream open until the receiver goes away.
    Stall(Vec<ChatCompletionChunk>),
}

impl ScriptedTurn {
    /// A plain text answer, streamed word by word.
    pub fn text(text: &str) -> Self {
        Self::Chunks(text_chunks(text))
    }

    /// Reasoning followed by a text answer.
    pub fn reasoning_then_text(reasoning: &str, text: &str) -> Self {
        let mut chunks = vec![Ok(ChatCompletionChunk::reasoning(reasoning))];
        chunks.extend(text_chunks(text));
        Self::Chunks(chunks)
    }

    /// Native tool calls given as `(id, name, arguments_json)`.
    ///
    /// The id and name arrive with the first fragment, the arguments are
    /// split into two fragments.
    pub fn tool_calls(calls: &[(&str, &str, &str)]) -> Self {
        let mut chunks = Vec::new();
        for (index, (id, name, arguments)) in calls.iter().enumerate() {
            let (head, tail) = split_half(arguments);
            chunks.push(Ok(ChatCompletionChunk::tool_call(
                index,
                Some(*id),
                Some(*name),
                Some(head),
            )));
            chunks.push(Ok(ChatCompletionChunk::tool_call(index, None, None, Some(tail))));
        }
        chunks.push(Ok(ChatCompletionChunk::finish("tool_calls")));
        Self::Chunks(chunks)
    }

    /// Some content, then a mid-stream transport failure.
    pub fn interrupted(partial: &str) -> Self {
        Self::Chunks(vec![
            Ok(ChatCompletionChunk::content(partial)),
            Err(ProviderError::StreamInterrupted("connection reset".into())),
        ])
    }
}

fn text_chunks(text: &str) -> Vec<Result<ChatCompletionChunk, ProviderError>> {
    let mut chunks: Vec<_> = text
        .split_inclusive(' ')
        .map(|piece| Ok(ChatCompletionChunk::content(piece)))
        .collect();
    chunks.push(Ok(ChatCompletionChunk::finish("stop")));
    chunks
}

fn split_half(s: &str) -> (&str, &str) {
    let mid = s
        .char_indices()
        .map(|(i, _)| i)
        .nth(s.chars().count() / 2)
        .unwrap_or(s.len());
    s.split_at(mid)
}

/// A transport that returns a sequence of scripted turns.
///
/// Exhausting the script is an `ApiError`, unless `repeat_last` is set, in
/// which case the final turn is replayed forever.
pub struct ScriptedTransport {
    name: String,
    turns: Vec<ScriptedTurn>,
    repeat_last: bool,
    requests: Mutex<Vec<ChatCompletionRequest>>,
}

impl ScriptedTransport {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self::named("scripted", turns)
    }

    pub fn named(name: impl Into<String>, turns: Vec<ScriptedTurn>) -> Self {
        Self {
            name: name.into(),
            turns,
            repeat_last: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A model that answers every request with the same turn.
    pub fn repeating(turn: ScriptedTurn) -> Self {
        Self {
            repeat_last: true,
            ..Self::new(vec![turn])
        }
    }

    /// Create a transport that returns a single text answer.
    pub fn single_text(text: &str) -> Self {
        Self::new(vec![ScriptedTurn::text(text)])
    }

    pub fn call_count(&self) -> usize {
        self.lock_requests().len()
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<ChatCompletionRequest> {
        self.lock_requests().clone()
    }

    fn lock_requests(&self) -> std::sync::MutexGuard<'_, Vec<ChatCompletionRequest>> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn turn(&self, call: usize) -> Option<&ScriptedTurn> {
        match self.turns.get(call) {
            Some(turn) => Some(turn),
            None if self.repeat_last => self.turns.last(),
            None => None,
        }
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_chat_completion(
        &self,
        request: ChatCompletionRequest,
    ) -> std::result::Result<ChunkReceiver, ProviderError> {
        let call = {
            let mut requests = self.lock_requests();
            requests.push(request);
            requests.len() - 1
        };

        let turn = self.turn(call).cloned().ok_or_else(|| ProviderError::ApiError {
            status_code: 500,
            message: format!(
                "ScriptedTransport: no more turns (call #{call}, have {})",
                self.turns.len()
            ),
        })?;

        match turn {
            ScriptedTurn::Fail(err) => Err(err),
            ScriptedTurn::Chunks(items) => {
                let (tx, rx) = tokio::sync::mpsc::channel(items.len().max(1));
                for item in items {
                    // Capacity covers every item, so this never fails.
                    let _ = tx.try_send(item);
                }
                Ok(rx)
            }
            ScriptedTurn::Stall(chunks) => {
                let (tx, rx) = tokio::sync::mpsc::channel(chunks.len().max(1));
                tokio::spawn(async move {
                    for chunk in chunks {
                        if tx.send(Ok(chunk)).await.is_err() {
                            return;
                        }
                    }
                    tx.closed().await;
                });
                Ok(rx)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironloop_core::message::ChatMessage;

    fn request(text: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "mock-model".into(),
            messages: vec![ChatMessage::user(text)],
            tools: None,
            temperature: None,
            max_tokens: None,
            stream: true,
        }
    }

    async fn drain(mut rx: ChunkReceiver) -> Vec<Result<ChatCompletionChunk, ProviderError>> {
        let mut out = Vec::new();
        while let Some(item) = rx.recv().await {
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn replays_turns_in_order_and_records_requests() {
        let transport = ScriptedTransport::new(vec![
            ScriptedTurn::text("first answer"),
            ScriptedTurn::text("second"),
        ]);

        let first = drain(transport.create_chat_completion(request("a")).await.unwrap()).await;
        assert_eq!(first.len(), 3);
        let second = drain(transport.create_chat_completion(request("b")).await.unwrap()).await;
        assert_eq!(second.len(), 2);

        assert_eq!(transport.call_count(), 2);
        assert_eq!(transport.requests()[1].messages[0].text(), "b");
    }

    #[tokio::test]
    async fn exhausted_script_is_an_error() {
        let transport = ScriptedTransport::new(vec![]);
        let err = transport.create_chat_completion(request("a")).await.unwrap_err();
        assert!(matches!(err, ProviderError::ApiError { .. }));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn repeating_replays_forever() {
        let transport = ScriptedTransport::repeating(ScriptedTurn::text("again"));
        for _ in 0..5 {
            let items = drain(transport.create_chat_completion(request("x")).await.unwrap()).await;
            assert!(items.iter().all(Result::is_ok));
        }
        assert_eq!(transport.call_count(), 5);
    }

    #[tokio::test]
    async fn tool_call_turn_fragments_arguments() {
        let transport = ScriptedTransport::new(vec![ScriptedTurn::tool_calls(&[(
            "call_1",
            "echo",
            r#"{"text":"hi"}"#,
        )])]);
        let items = drain(transport.create_chat_completion(request("x")).await.unwrap()).await;
        assert_eq!(items.len(), 3);

        let args: String = items
            .iter()
            .filter_map(|i| i.as_ref().ok())
            .flat_map(|c| c.choices.iter())
            .filter_map(|c| c.delta.tool_calls.as_ref())
            .flatten()
            .filter_map(|d| d.function.as_ref()?.arguments.clone())
            .collect();
        assert_eq!(args, r#"{"text":"hi"}"#);
    }

    #[tokio::test]
    async fn fail_turn_errors_before_stream() {
        let transport = ScriptedTransport::new(vec![ScriptedTurn::Fail(
            ProviderError::AuthenticationFailed("bad key".into()),
        )]);
        let err = transport.create_chat_completion(request("x")).await.unwrap_err();
        assert!(matches!(err, ProviderError::AuthenticationFailed(_)));
    }

    #[test]
    fn split_half_respects_char_boundaries() {
        assert_eq!(split_half("abcd"), ("ab", "cd"));
        assert_eq!(split_half("ééé"), ("é", "éé"));
        assert_eq!(split_half(""), ("", ""));
    }
}
