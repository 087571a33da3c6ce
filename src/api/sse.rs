use std::collections::BTreeMap;

use futures_util::StreamExt;
use memchr::memchr;
use serde::{Deserialize, Serialize};

use super::{BackendError, ChatBackend, ChatMessage, StreamEvent, StreamEventSink, StreamRequest};

#[derive(Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct WireDelta {
    content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Deserialize)]
struct WireChoice {
    delta: WireDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireChunk {
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireToolCallDelta {
    index: Option<u32>,
    id: Option<String>,
    function: Option<WireToolFunctionDelta>,
}

#[derive(Deserialize)]
struct WireToolFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

/// Tool-call fragments accumulated across deltas. OpenAI-style backends
/// stream arguments progressively; the complete call is only emittable once
/// the stream finishes.
#[derive(Default)]
struct PendingToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

fn extract_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

fn extract_error_summary(value: &serde_json::Value) -> Option<String> {
    value
        .pointer("/error/message")
        .or_else(|| value.pointer("/error"))
        .or_else(|| value.get("message"))
        .and_then(|v| v.as_str())
        .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
}

fn format_api_error(error_text: &str) -> String {
    let trimmed = error_text.trim();
    if trimmed.is_empty() {
        return "API error: <empty response body>".to_string();
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(summary) = extract_error_summary(&value).filter(|s| !s.is_empty()) {
            return format!("API error: {summary}");
        }
    }

    format!("API error: {trimmed}")
}

/// Streaming backend for OpenAI-compatible `chat/completions` endpoints.
pub struct SseBackend {
    client: reqwest::Client,
    name: String,
    base_url: String,
    api_key: String,
}

impl SseBackend {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            name: name.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    /// Apply one SSE payload. Returns `true` when the stream is done.
    fn handle_payload(
        payload: &str,
        sink: &StreamEventSink,
        pending: &mut BTreeMap<u32, PendingToolCall>,
    ) -> Result<bool, BackendError> {
        if payload == "[DONE]" {
            return Ok(true);
        }

        let chunk: WireChunk = match serde_json::from_str(payload) {
            Ok(chunk) => chunk,
            Err(_) => {
                if payload.trim().is_empty() {
                    return Ok(false);
                }
                return Err(BackendError::Api(format_api_error(payload)));
            }
        };

        let Some(choice) = chunk.choices.first() else {
            return Ok(false);
        };

        if let Some(content) = &choice.delta.content {
            if !content.is_empty() {
                sink.emit(StreamEvent::Chunk(content.clone()));
            }
        }
        if let Some(reasoning) = &choice.delta.reasoning {
            if !reasoning.is_empty() {
                sink.emit(StreamEvent::ThinkingStatus(reasoning.clone()));
            }
        }
        if let Some(deltas) = &choice.delta.tool_calls {
            for delta in deltas {
                let entry = pending.entry(delta.index.unwrap_or(0)).or_default();
                if delta.id.is_some() {
                    entry.id = delta.id.clone();
                }
                if let Some(function) = &delta.function {
                    if function.name.is_some() {
                        entry.name = function.name.clone();
                    }
                    if let Some(arguments) = &function.arguments {
                        entry.arguments.push_str(arguments);
                    }
                }
            }
        }

        Ok(choice.finish_reason.as_deref() == Some("stop"))
    }

    /// Flush accumulated tool calls as `ToolCallStarted` events. Execution
    /// and the matching `ToolCallCompleted` are the embedder's side of the
    /// protocol; this endpoint never runs tools server-side.
    fn flush_tool_calls(sink: &StreamEventSink, pending: BTreeMap<u32, PendingToolCall>) {
        for (index, call) in pending {
            let Some(name) = call.name else { continue };
            sink.emit(StreamEvent::ToolCallStarted {
                id: call.id.unwrap_or_else(|| format!("call-{index}")),
                name,
                input_json: call.arguments,
            });
        }
    }

    async fn run_stream(
        &self,
        request: StreamRequest,
        sink: &StreamEventSink,
    ) -> Result<(), BackendError> {
        let wire = WireRequest {
            model: request.config.model.clone(),
            messages: request.history.clone(),
            stream: true,
            temperature: request.config.temperature,
        };

        let response = self
            .client
            .post(self.endpoint())
            .header("Content-Type", "application/json")
            .bearer_auth(&self.api_key)
            .json(&wire)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            return Err(BackendError::Api(format_api_error(&body)));
        }

        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut pending: BTreeMap<u32, PendingToolCall> = BTreeMap::new();

        while let Some(chunk) = stream.next().await {
            if sink.is_cancelled() {
                return Ok(());
            }

            let bytes = chunk.map_err(|e| BackendError::Transport(e.to_string()))?;
            buffer.extend_from_slice(&bytes);

            while let Some(newline_pos) = memchr(b'\n', &buffer) {
                let done = match std::str::from_utf8(&buffer[..newline_pos]) {
                    Ok(line) => match extract_data_payload(line.trim()) {
                        Some(payload) => Self::handle_payload(payload, sink, &mut pending)?,
                        None => false,
                    },
                    Err(e) => {
                        tracing::warn!("invalid UTF-8 in stream: {e}");
                        false
                    }
                };
                buffer.drain(..=newline_pos);
                if done {
                    Self::flush_tool_calls(sink, pending);
                    return Ok(());
                }
            }
        }

        Self::flush_tool_calls(sink, pending);
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChatBackend for SseBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream_message(
        &self,
        request: StreamRequest,
        sink: StreamEventSink,
    ) -> Result<(), BackendError> {
        let cancel = sink.cancel_token().clone();
        tokio::select! {
            result = self.run_stream(request, &sink) => result,
            _ = cancel.cancelled() => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn test_sink() -> (
        StreamEventSink,
        mpsc::UnboundedReceiver<(StreamEvent, u64)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StreamEventSink::new(tx, 1, CancellationToken::new()), rx)
    }

    #[test]
    fn payload_spacing_variants_parse() {
        let (sink, mut rx) = test_sink();
        let mut pending = BTreeMap::new();

        for line in [
            r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#,
            r#"data:{"choices":[{"delta":{"content":"World"}}]}"#,
        ] {
            let payload = extract_data_payload(line).expect("data line");
            assert!(!SseBackend::handle_payload(payload, &sink, &mut pending).unwrap());
        }

        let contents: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|(event, _)| match event {
                StreamEvent::Chunk(c) => c,
                other => panic!("expected chunk, got {other:?}"),
            })
            .collect();
        assert_eq!(contents, ["Hello", "World"]);
    }

    #[test]
    fn done_sentinel_ends_the_stream() {
        let (sink, _rx) = test_sink();
        let mut pending = BTreeMap::new();
        assert!(SseBackend::handle_payload("[DONE]", &sink, &mut pending).unwrap());
    }

    #[test]
    fn error_payloads_become_api_errors() {
        let (sink, _rx) = test_sink();
        let mut pending = BTreeMap::new();
        let result = SseBackend::handle_payload(
            r#"{"error":{"message":"model overloaded"}}"#,
            &sink,
            &mut pending,
        );
        match result {
            Err(BackendError::Api(message)) => {
                assert_eq!(message, "API error: model overloaded");
            }
            other => panic!("expected api error, got {other:?}"),
        }
    }

    #[test]
    fn tool_call_deltas_accumulate_across_payloads() {
        let (sink, mut rx) = test_sink();
        let mut pending = BTreeMap::new();

        let first = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call-9","function":{"name":"lookup","arguments":"{\"q\":"}}]}}]}"#;
        let second = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"rust\"}"}}]}}]}"#;
        assert!(!SseBackend::handle_payload(first, &sink, &mut pending).unwrap());
        assert!(!SseBackend::handle_payload(second, &sink, &mut pending).unwrap());

        SseBackend::flush_tool_calls(&sink, pending);
        let (event, _) = rx.try_recv().expect("tool call event");
        match event {
            StreamEvent::ToolCallStarted {
                id,
                name,
                input_json,
            } => {
                assert_eq!(id, "call-9");
                assert_eq!(name, "lookup");
                assert_eq!(input_json, r#"{"q":"rust"}"#);
            }
            other => panic!("expected tool call start, got {other:?}"),
        }
    }

    #[test]
    fn format_api_error_prefers_the_json_summary() {
        let raw = r#"{"error":{"message":"quota   exceeded","type":"rate_limit"}}"#;
        assert_eq!(format_api_error(raw), "API error: quota exceeded");
        assert_eq!(format_api_error("plain failure"), "API error: plain failure");
        assert_eq!(format_api_error("  "), "API error: <empty response body>");
    }
}
