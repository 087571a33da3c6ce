use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::artifact::Artifact;

pub mod sse;

/// One entry of the wire-format history handed to a backend. Content has
/// already been redacted by the orchestrator.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Effective configuration for one generation call. Built per send: skill
/// augmentation appends to `system_prompt` without touching the base config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationConfig {
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub text: String,
    pub config: GenerationConfig,
    pub history: Vec<ChatMessage>,
}

/// Events a backend emits while a generation call is in flight. Tool calls
/// interleave with chunks; `Completed`/`Errored` are signalled through the
/// backend's return value, not through an event.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Chunk(String),
    ThinkingStatus(String),
    ArtifactCreated(Artifact),
    ToolCallStarted {
        id: String,
        name: String,
        input_json: String,
    },
    ToolCallCompleted {
        id: String,
        output: String,
        is_error: bool,
    },
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{0}")]
    Api(String),
    #[error("request failed: {0}")]
    Transport(String),
}

/// Where a backend delivers its stream events.
///
/// Events travel over an unbounded channel tagged with the stream id so the
/// orchestrator can drop events from a superseded stream. Backends should
/// check [`is_cancelled`](Self::is_cancelled) at each suspension point and
/// stop emitting once cancelled.
#[derive(Clone)]
pub struct StreamEventSink {
    tx: mpsc::UnboundedSender<(StreamEvent, u64)>,
    stream_id: u64,
    cancel: CancellationToken,
}

impl StreamEventSink {
    pub fn new(
        tx: mpsc::UnboundedSender<(StreamEvent, u64)>,
        stream_id: u64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            tx,
            stream_id,
            cancel,
        }
    }

    pub fn emit(&self, event: StreamEvent) {
        let _ = self.tx.send((event, self.stream_id));
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// The streaming generation seam.
///
/// `stream_message` returns `Ok(())` when the stream ends normally and an
/// error on failure; partial output already emitted through the sink is the
/// caller's to keep or discard.
#[async_trait::async_trait]
pub trait ChatBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn stream_message(
        &self,
        request: StreamRequest,
        sink: StreamEventSink,
    ) -> Result<(), BackendError>;
}
