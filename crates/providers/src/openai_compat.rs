//! OpenAI-compatible chat transport.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM, DeepSeek, Groq, Together AI
//! and any endpoint exposing `/v1/chat/completions` with SSE streaming.
//!
//! The transport forwards every parsed `data:` chunk untouched; merging the
//! deltas into one logical response is the aggregator's job.

use async_trait::async_trait;
use futures::StreamExt;
use ironloop_core::error::ProviderError;
use ironloop_core::provider::{ChatCompletionChunk, ChatCompletionRequest, ChatTransport, ChunkReceiver};
use tracing::{debug, trace, warn};

/// An OpenAI-compatible chat-completion endpoint.
pub struct OpenAiCompatTransport {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatTransport {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .unwrap_or_default();

        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        }
    }

    /// OpenRouter (convenience constructor).
    pub fn openrouter(api_key: impl Into<String>) -> Self {
        Self::new("openrouter", "https://openrouter.ai/api/v1", api_key)
    }

    /// OpenAI (convenience constructor).
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new("openai", "https://api.openai.com/v1", api_key)
    }

    /// Ollama (convenience constructor). No real key is needed.
    pub fn ollama(base_url: Option<&str>) -> Self {
        Self::new(
            "ollama",
            base_url.unwrap_or("http://localhost:11434/v1"),
            "ollama",
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request_body(request: &ChatCompletionRequest) -> serde_json::Value {
        let mut body = serde_json::to_value(request).unwrap_or_else(|_| serde_json::json!({}));
        body["stream"] = serde_json::json!(true);
        body["stream_options"] = serde_json::json!({ "include_usage": true });
        body
    }
}

#[async_trait]
impl ChatTransport for OpenAiCompatTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_chat_completion(
        &self,
        request: ChatCompletionRequest,
    ) -> std::result::Result<ChunkReceiver, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = Self::request_body(&request);

        debug!(provider = %self.name, model = %request.model, messages = request.messages.len(), "Sending streaming request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(e.to_string())
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;

        let status = response.status().as_u16();

        if status == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(5);
            return Err(ProviderError::RateLimited { retry_after_secs });
        }

        if status == 401 || status == 403 {
            return Err(ProviderError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ));
        }

        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Provider streaming error");
            return Err(ProviderError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let provider_name = self.name.clone();

        // Read the SSE byte stream and forward parsed chunks
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut lines = SseLineBuffer::default();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                for event in lines.push(&bytes) {
                    match event {
                        SseData::Done => return,
                        SseData::Json(data) => {
                            match serde_json::from_str::<ChatCompletionChunk>(&data) {
                                Ok(chunk) => {
                                    if tx.send(Ok(chunk)).await.is_err() {
                                        return; // receiver dropped
                                    }
                                }
                                Err(e) => {
                                    trace!(
                                        provider = %provider_name,
                                        data = %data,
                                        error = %e,
                                        "Ignoring unparseable SSE chunk"
                                    );
                                }
                            }
                        }
                    }
                }
            }

            debug!(provider = %provider_name, "Stream ended without [DONE]");
        });

        Ok(rx)
    }
}

/// A complete `data:` payload from the event stream.
#[derive(Debug, PartialEq)]
enum SseData {
    Json(String),
    Done,
}

/// Splits an SSE byte stream into `data:` payloads across network reads.
///
/// Bytes are buffered until a full line arrives, so multi-byte characters
/// split between reads decode intact.
#[derive(Default)]
struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseData> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();

        while let Some(line_end) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw[..line_end]);
            let line = line.trim_end_matches('\r');

            // Skip empty lines and SSE comments
            if line.is_empty() || line.starts_with(':') {
                continue;
            }

            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if data == "[DONE]" {
                    out.push(SseData::Done);
                } else if !data.is_empty() {
                    out.push(SseData::Json(data.to_string()));
                }
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironloop_core::message::ChatMessage;

    #[test]
    fn openrouter_constructor() {
        let transport = OpenAiCompatTransport::openrouter("sk-test");
        assert_eq!(transport.name(), "openrouter");
        assert!(transport.base_url().contains("openrouter.ai"));
    }

    #[test]
    fn ollama_constructor() {
        let transport = OpenAiCompatTransport::ollama(None);
        assert_eq!(transport.name(), "ollama");
        assert!(transport.base_url().contains("localhost:11434"));
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let transport = OpenAiCompatTransport::new("x", "http://host/v1/", "k");
        assert_eq!(transport.base_url(), "http://host/v1");
    }

    #[test]
    fn request_body_forces_streaming() {
        let request = ChatCompletionRequest {
            model: "gpt-4o".into(),
            messages: vec![ChatMessage::system("be brief"), ChatMessage::user("hi")],
            tools: None,
            temperature: Some(0.2),
            max_tokens: Some(64),
            stream: false,
        };
        let body = OpenAiCompatTransport::request_body(&request);
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["max_tokens"], 64);
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn sse_lines_split_across_reads() {
        let mut lines = SseLineBuffer::default();
        assert!(lines.push("data: {\"choices\":[]".as_bytes()).is_empty());
        let out = lines.push("}\n\ndata: [DONE]\n".as_bytes());
        assert_eq!(
            out,
            vec![SseData::Json("{\"choices\":[]}".into()), SseData::Done]
        );
    }

    #[test]
    fn multibyte_char_split_across_reads() {
        let line = "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"é\"}}]}\n";
        let bytes = line.as_bytes();
        let split = line.find('é').unwrap() + 1;

        let mut lines = SseLineBuffer::default();
        assert!(lines.push(&bytes[..split]).is_empty());
        let out = lines.push(&bytes[split..]);

        let SseData::Json(data) = &out[0] else {
            panic!("expected json payload");
        };
        let chunk: ChatCompletionChunk = serde_json::from_str(data).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("é"));
    }

    #[test]
    fn sse_comments_and_crlf_are_handled() {
        let mut lines = SseLineBuffer::default();
        let out = lines.push(": keep-alive\r\ndata: {\"a\":1}\r\n\r\nevent: ping\n".as_bytes());
        assert_eq!(out, vec![SseData::Json("{\"a\":1}".into())]);
    }

    #[test]
    fn sse_data_without_space() {
        let mut lines = SseLineBuffer::default();
        assert_eq!(lines.push("data:[DONE]\n".as_bytes()), vec![SseData::Done]);
    }

    #[test]
    fn sse_payload_parses_as_chunk() {
        let mut lines = SseLineBuffer::default();
        let out = lines.push("data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n".as_bytes());
        let SseData::Json(data) = &out[0] else {
            panic!("expected json payload");
        };
        let chunk: ChatCompletionChunk = serde_json::from_str(data).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hel"));
    }

    #[test]
    fn parse_usage_only_chunk() {
        let data = r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#;
        let chunk: ChatCompletionChunk = serde_json::from_str(data).unwrap();
        assert!(chunk.choices.is_empty());
        assert_eq!(chunk.usage.unwrap().total_tokens, 15);
    }
}
