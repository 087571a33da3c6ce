use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Flush no faster than this when the backend is firehosing.
const FLUSH_FAST_STREAM: Duration = Duration::from_millis(100);
/// Middle tier, also the warm-up default before throughput is measurable.
const FLUSH_MEDIUM_STREAM: Duration = Duration::from_millis(50);
/// Frame-rate flushing for slow streams.
const FLUSH_SLOW_STREAM: Duration = Duration::from_millis(16);
/// Throughput is only trusted after this much stream time.
const THROUGHPUT_WARMUP: Duration = Duration::from_millis(500);
/// A buffer past this size flushes immediately, timer or not.
const IMMEDIATE_FLUSH_BYTES: usize = 2048;

const FAST_CHUNKS_PER_SEC: f64 = 50.0;
const MEDIUM_CHUNKS_PER_SEC: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallStatus {
    Running,
    Success,
    Error,
}

/// A tool invocation surfaced by the backend, tracked in place across
/// completion and retries (the id never changes).
#[derive(Debug, Clone)]
pub struct LiveToolCall {
    pub id: String,
    pub name: String,
    pub input_json: String,
    pub status: ToolCallStatus,
    pub started_at: DateTime<Utc>,
    pub retry_count: u32,
    pub retryable: bool,
    /// Parsed eagerly from `input_json` at start time so retries can replay
    /// arguments without re-parsing stream state.
    pub arguments: Map<String, Value>,
    pub output: Option<String>,
}

impl LiveToolCall {
    pub fn started(id: impl Into<String>, name: impl Into<String>, input_json: impl Into<String>) -> Self {
        let input_json = input_json.into();
        let arguments = parse_arguments(&input_json);
        Self {
            id: id.into(),
            name: name.into(),
            input_json,
            status: ToolCallStatus::Running,
            started_at: Utc::now(),
            retry_count: 0,
            retryable: false,
            arguments,
            output: None,
        }
    }

    pub fn complete(&mut self, output: String, is_error: bool) {
        self.status = if is_error {
            ToolCallStatus::Error
        } else {
            ToolCallStatus::Success
        };
        self.retryable = is_error;
        self.output = Some(output);
    }

    pub fn begin_retry(&mut self) {
        self.retry_count += 1;
        self.status = ToolCallStatus::Running;
        self.retryable = false;
        self.output = None;
    }
}

/// Malformed argument JSON degrades to an empty map rather than losing the
/// tool call.
pub fn parse_arguments(input_json: &str) -> Map<String, Value> {
    match serde_json::from_str::<Value>(input_json) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// How one send progresses. Terminal outcomes are reported through
/// [`ExchangeOutcome`]; the phase returns to `Idle` afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Sending,
    AwaitingConfirmation,
    Streaming,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

/// Per-exchange transient state: created at send time, destroyed at
/// completion, cancellation, or error. Nothing in here survives into the
/// next exchange.
#[derive(Debug)]
pub struct ExchangeSession {
    pub stream_id: u64,
    pub conversation_id: Uuid,
    pub cancel_token: CancellationToken,
    /// placeholder -> original, captured before fan-out / stream start.
    pub redaction_map: HashMap<String, String>,
    pub user_text: String,
    pub buffer: String,
    /// Everything already flushed to observers.
    pub visible_text: String,
    pub chunk_count: u64,
    pub byte_count: u64,
    pub started_at: Instant,
    pub flush_scheduled: bool,
    pub thinking_status: Option<String>,
    pub backend_artifact: Option<crate::core::artifact::Artifact>,
}

impl ExchangeSession {
    pub fn new(
        stream_id: u64,
        conversation_id: Uuid,
        redaction_map: HashMap<String, String>,
        user_text: String,
    ) -> Self {
        Self {
            stream_id,
            conversation_id,
            cancel_token: CancellationToken::new(),
            redaction_map,
            user_text,
            buffer: String::new(),
            visible_text: String::new(),
            chunk_count: 0,
            byte_count: 0,
            started_at: Instant::now(),
            flush_scheduled: false,
            thinking_status: None,
            backend_artifact: None,
        }
    }

    pub fn record_chunk(&mut self, chunk: &str) {
        self.chunk_count += 1;
        self.byte_count += chunk.len() as u64;
        self.buffer.push_str(chunk);
    }

    /// Adaptive flush interval from measured throughput. Before the warm-up
    /// window has elapsed the medium default applies.
    pub fn flush_interval(&self) -> Duration {
        self.flush_interval_at(self.started_at.elapsed())
    }

    fn flush_interval_at(&self, elapsed: Duration) -> Duration {
        if elapsed < THROUGHPUT_WARMUP {
            return FLUSH_MEDIUM_STREAM;
        }
        let chunks_per_sec = self.chunk_count as f64 / elapsed.as_secs_f64();
        if chunks_per_sec > FAST_CHUNKS_PER_SEC {
            FLUSH_FAST_STREAM
        } else if chunks_per_sec > MEDIUM_CHUNKS_PER_SEC {
            FLUSH_MEDIUM_STREAM
        } else {
            FLUSH_SLOW_STREAM
        }
    }

    pub fn needs_immediate_flush(&self) -> bool {
        self.buffer.len() > IMMEDIATE_FLUSH_BYTES
    }

    /// Move buffered text into the visible transcript, returning the delta.
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let delta = std::mem::take(&mut self.buffer);
        self.visible_text.push_str(&delta);
        Some(delta)
    }
}
