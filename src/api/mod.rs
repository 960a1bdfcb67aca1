//! OpenAI-compatible chat completion client.
//!
//! Streams `/chat/completions` responses over SSE, coalescing incremental
//! `tool_calls` deltas per index into complete [`ToolCall`]s. Retries
//! transient HTTP failures with exponential backoff before the stream
//! starts; a stream that dies mid-flight surfaces as an error chunk.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub mod types;

use crate::config::{Config, RetrySettings};
use crate::errors::ApiError;
use types::*;

/// A chunk received from an SSE streaming response.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// Visible assistant text.
    Content(String),
    /// A fully accumulated tool call.
    ToolCall(ToolCall),
    /// Token usage, when the backend reports it.
    Usage(Usage),
    /// Stream is complete.
    Done,
}

/// Trait abstraction over the LLM API, enabling test mocking. The engine
/// only ever talks to this trait.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a chat completion request (non-streaming).
    async fn chat(
        &self,
        messages: Vec<Message>,
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<ChatResponse>;

    /// Send a streaming chat completion request; chunks arrive on the
    /// returned channel until `Done` or an error.
    async fn chat_stream(
        &self,
        messages: Vec<Message>,
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<mpsc::Receiver<Result<StreamChunk>>>;
}

/// One in-progress tool call being assembled from streamed deltas.
#[derive(Debug, Default, Clone)]
struct PendingCall {
    id: String,
    call_type: String,
    name: String,
    arguments: String,
}

/// Accumulates incremental tool call deltas into complete ToolCall objects.
///
/// Backends send tool calls as delta series: the first delta for an index
/// carries `id`, `type`, `function.name` and a first `function.arguments`
/// fragment; later deltas for the same index append argument fragments.
/// Emission happens only at `finish_reason` or stream end, because some
/// backends interleave argument chunks across indices.
#[derive(Default)]
pub(crate) struct ToolCallAccumulator {
    pending: HashMap<usize, PendingCall>,
}

impl ToolCallAccumulator {
    fn absorb(&mut self, delta: &serde_json::Value) {
        let Some(index) = delta.get("index").and_then(|v| v.as_u64()) else {
            return;
        };
        let entry = self.pending.entry(index as usize).or_default();
        if let Some(id) = delta.get("id").and_then(|v| v.as_str()) {
            if !id.is_empty() {
                entry.id = id.to_string();
            }
        }
        if let Some(t) = delta.get("type").and_then(|v| v.as_str()) {
            if !t.is_empty() {
                entry.call_type = t.to_string();
            }
        }
        if let Some(func) = delta.get("function") {
            if let Some(name) = func.get("name").and_then(|v| v.as_str()) {
                if !name.is_empty() {
                    entry.name = name.to_string();
                }
            }
            if let Some(args) = func.get("arguments").and_then(|v| v.as_str()) {
                entry.arguments.push_str(args);
            }
        }
    }

    /// Drain pending calls in index order. Ids missing from the wire are
    /// synthesized so the tool-message pairing invariant always holds.
    fn flush(&mut self) -> Vec<ToolCall> {
        let mut calls: Vec<_> = self.pending.drain().collect();
        calls.sort_by_key(|(idx, _)| *idx);
        calls
            .into_iter()
            .map(|(_, p)| ToolCall {
                id: if p.id.is_empty() {
                    format!("call_{}", uuid::Uuid::new_v4())
                } else {
                    p.id
                },
                call_type: if p.call_type.is_empty() {
                    "function".to_string()
                } else {
                    p.call_type
                },
                function: ToolFunction {
                    name: p.name,
                    arguments: p.arguments,
                },
            })
            .collect()
    }
}

/// Parse one SSE event, returning zero or more StreamChunks. Tool call
/// deltas are buffered in the accumulator and emitted on `finish_reason`
/// or `[DONE]`.
pub(crate) fn parse_sse_event(event: &str, accumulator: &mut ToolCallAccumulator) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();

    for line in event.lines() {
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        if data == "[DONE]" {
            for call in accumulator.flush() {
                chunks.push(StreamChunk::ToolCall(call));
            }
            chunks.push(StreamChunk::Done);
            return chunks;
        }

        let Ok(json) = serde_json::from_str::<serde_json::Value>(data) else {
            warn!("Unparseable SSE payload: {}", data);
            continue;
        };
        let choice = json.get("choices").and_then(|c| c.get(0));
        let delta = choice.and_then(|c| c.get("delta"));

        if let Some(content) = delta.and_then(|d| d.get("content")).and_then(|c| c.as_str()) {
            if !content.is_empty() {
                chunks.push(StreamChunk::Content(content.to_string()));
            }
        }

        if let Some(tool_calls) = delta
            .and_then(|d| d.get("tool_calls"))
            .and_then(|tc| tc.as_array())
        {
            for tc_delta in tool_calls {
                accumulator.absorb(tc_delta);
            }
        }

        if choice
            .and_then(|c| c.get("finish_reason"))
            .and_then(|f| f.as_str())
            .is_some()
        {
            for call in accumulator.flush() {
                chunks.push(StreamChunk::ToolCall(call));
            }
        }

        if let Some(usage) = json.get("usage") {
            if let Ok(u) = serde_json::from_value::<Usage>(usage.clone()) {
                chunks.push(StreamChunk::Usage(u));
            }
        }
    }
    chunks
}

/// Retry configuration for API calls.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            retryable_status_codes: vec![429, 500, 502, 503, 504],
        }
    }
}

impl RetryConfig {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_delay_ms: settings.base_delay_ms,
            max_delay_ms: settings.max_delay_ms,
            retryable_status_codes: vec![429, 500, 502, 503, 504],
        }
    }
}

/// HTTP client for OpenAI-compatible chat completion APIs.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    model: String,
    max_tokens: usize,
    temperature: f32,
    api_key: Option<String>,
    retry_config: RetryConfig,
    chunk_timeout: Duration,
}

impl ApiClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        if config.endpoint.starts_with("http://") && !is_local_endpoint(&config.endpoint) {
            warn!(
                endpoint = %config.endpoint,
                "API endpoint uses HTTP; credentials may be transmitted in plaintext"
            );
        }

        Ok(Self {
            client,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            api_key: config.api_key.clone(),
            retry_config: RetryConfig::from_settings(&config.retry),
            chunk_timeout: Duration::from_secs(120),
        })
    }

    fn request_body(
        &self,
        messages: &[Message],
        tools: Option<&Vec<ToolDefinition>>,
        stream: bool,
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "stream": stream,
        });
        if let Some(tools) = tools {
            body["tools"] = serde_json::json!(tools);
        }
        body
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut delay = Duration::from_millis(self.retry_config.initial_delay_ms);
        let mut attempt = 0u32;

        loop {
            let mut request = self
                .client
                .post(&url)
                .header("Content-Type", "application/json");
            if let Some(ref key) = self.api_key {
                request = request.header("Authorization", format!("Bearer {}", key));
            }

            let outcome = request.json(body).send().await;
            match outcome {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    let code = status.as_u16();
                    if self.retry_config.retryable_status_codes.contains(&code)
                        && attempt < self.retry_config.max_retries
                    {
                        attempt += 1;
                        warn!(status = code, attempt, "Retryable API status, backing off");
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(Duration::from_millis(self.retry_config.max_delay_ms));
                        continue;
                    }
                    let message = response.text().await.unwrap_or_default();
                    return Err(match code {
                        401 | 403 => ApiError::Authentication(message).into(),
                        429 => ApiError::RateLimit {
                            retry_after_secs: None,
                        }
                        .into(),
                        _ => ApiError::HttpStatus {
                            status: code,
                            message,
                        }
                        .into(),
                    });
                }
                Err(e) if e.is_timeout() => {
                    if attempt < self.retry_config.max_retries {
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(Duration::from_millis(self.retry_config.max_delay_ms));
                        continue;
                    }
                    return Err(ApiError::Timeout.into());
                }
                Err(e) => return Err(ApiError::Network(e.to_string()).into()),
            }
        }
    }
}

#[async_trait]
impl LlmClient for ApiClient {
    async fn chat(
        &self,
        messages: Vec<Message>,
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<ChatResponse> {
        let body = self.request_body(&messages, tools.as_ref(), false);
        let response = self.post(&body).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))?;
        Ok(parsed)
    }

    async fn chat_stream(
        &self,
        messages: Vec<Message>,
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<mpsc::Receiver<Result<StreamChunk>>> {
        let body = self.request_body(&messages, tools.as_ref(), true);
        debug!("Starting streaming request to {}", self.base_url);
        let response = self.post(&body).await?;

        let (tx, rx) = mpsc::channel(32);
        let chunk_timeout = self.chunk_timeout;

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut accumulator = ToolCallAccumulator::default();

            loop {
                let next = match tokio::time::timeout(chunk_timeout, stream.next()).await {
                    Ok(Some(result)) => result,
                    Ok(None) => break,
                    Err(_elapsed) => {
                        for call in accumulator.flush() {
                            if tx.send(Ok(StreamChunk::ToolCall(call))).await.is_err() {
                                return;
                            }
                        }
                        let err = ApiError::Stream(format!(
                            "no data for {} seconds",
                            chunk_timeout.as_secs()
                        ));
                        let _ = tx.send(Err(err.into())).await;
                        return;
                    }
                };

                match next {
                    Ok(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(pos) = buffer.find("\n\n") {
                            let event = buffer[..pos].to_string();
                            buffer.drain(..pos + 2);
                            for chunk in parse_sse_event(&event, &mut accumulator) {
                                if tx.send(Ok(chunk)).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        // Flush buffered tool calls so partial progress is
                        // not lost before reporting the error.
                        for call in accumulator.flush() {
                            if tx.send(Ok(StreamChunk::ToolCall(call))).await.is_err() {
                                return;
                            }
                        }
                        let _ = tx.send(Err(ApiError::Stream(e.to_string()).into())).await;
                        return;
                    }
                }
            }

            let remaining = buffer.trim().to_string();
            if !remaining.is_empty() {
                for chunk in parse_sse_event(&remaining, &mut accumulator) {
                    if tx.send(Ok(chunk)).await.is_err() {
                        return;
                    }
                }
            }
            for call in accumulator.flush() {
                if tx.send(Ok(StreamChunk::ToolCall(call))).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(Ok(StreamChunk::Done)).await;
        });

        Ok(rx)
    }
}

fn is_local_endpoint(endpoint: &str) -> bool {
    endpoint.contains("://localhost")
        || endpoint.contains("://127.0.0.1")
        || endpoint.contains("://[::1]")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta_event(payload: serde_json::Value) -> String {
        format!("data: {}", payload)
    }

    #[test]
    fn test_parse_content_delta() {
        let mut acc = ToolCallAccumulator::default();
        let event = delta_event(serde_json::json!({
            "choices": [{"index": 0, "delta": {"content": "checking disks"}}]
        }));
        let chunks = parse_sse_event(&event, &mut acc);
        assert!(
            matches!(&chunks[..], [StreamChunk::Content(c)] if c == "checking disks")
        );
    }

    #[test]
    fn test_tool_call_accumulated_across_deltas() {
        let mut acc = ToolCallAccumulator::default();
        let first = delta_event(serde_json::json!({
            "choices": [{"index": 0, "delta": {"tool_calls": [{
                "index": 0, "id": "call_1", "type": "function",
                "function": {"name": "execute_command", "arguments": "{\"comm"}
            }]}}]
        }));
        let second = delta_event(serde_json::json!({
            "choices": [{"index": 0, "delta": {"tool_calls": [{
                "index": 0,
                "function": {"arguments": "and\":\"df -h\"}"}
            }]}}]
        }));
        let finish = delta_event(serde_json::json!({
            "choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]
        }));

        assert!(parse_sse_event(&first, &mut acc).is_empty());
        assert!(parse_sse_event(&second, &mut acc).is_empty());
        let chunks = parse_sse_event(&finish, &mut acc);
        match &chunks[..] {
            [StreamChunk::ToolCall(call)] => {
                assert_eq!(call.id, "call_1");
                assert_eq!(call.function.name, "execute_command");
                assert_eq!(call.function.arguments, r#"{"command":"df -h"}"#);
            }
            other => panic!("unexpected chunks: {:?}", other),
        }
    }

    #[test]
    fn test_multiple_tool_calls_emitted_in_index_order() {
        let mut acc = ToolCallAccumulator::default();
        let event = delta_event(serde_json::json!({
            "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 1, "id": "call_b", "function": {"name": "b", "arguments": "{}"}},
                {"index": 0, "id": "call_a", "function": {"name": "a", "arguments": "{}"}}
            ]}}]
        }));
        parse_sse_event(&event, &mut acc);
        let calls = acc.flush();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[1].id, "call_b");
    }

    #[test]
    fn test_missing_id_synthesized() {
        let mut acc = ToolCallAccumulator::default();
        let event = delta_event(serde_json::json!({
            "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"name": "wait", "arguments": "{\"seconds\":5}"}}
            ]}}]
        }));
        parse_sse_event(&event, &mut acc);
        let calls = acc.flush();
        assert!(calls[0].id.starts_with("call_"));
        assert_eq!(calls[0].call_type, "function");
    }

    #[test]
    fn test_done_flushes_and_terminates() {
        let mut acc = ToolCallAccumulator::default();
        let event = delta_event(serde_json::json!({
            "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "function": {"name": "wait", "arguments": "{}"}}
            ]}}]
        }));
        parse_sse_event(&event, &mut acc);
        let chunks = parse_sse_event("data: [DONE]", &mut acc);
        assert!(matches!(chunks[0], StreamChunk::ToolCall(_)));
        assert!(matches!(chunks.last(), Some(StreamChunk::Done)));
    }

    #[test]
    fn test_is_local_endpoint() {
        assert!(is_local_endpoint("http://localhost:11434/v1"));
        assert!(is_local_endpoint("http://127.0.0.1:8080/v1"));
        assert!(!is_local_endpoint("http://api.example.com/v1"));
    }
}
