use tokio::sync::broadcast;
use uuid::Uuid;

use crate::core::artifact::Artifact;
use crate::core::memory::MemoryFact;
use crate::core::message::Message;
use crate::core::session::LiveToolCall;
use crate::security::threat::ThreatAlert;

/// Everything observers can learn about an orchestrator without polling.
///
/// Delivery is at-most-once: events go out over a broadcast channel, lagging
/// subscribers lose the oldest events, and publishing never blocks the
/// orchestrator. Consumers that need full state call
/// `OrchestratorHandle::snapshot` instead of replaying events.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// A message entered the visible transcript (user or assistant).
    MessageAppended(Message),
    /// Buffered stream output was flushed to the visible transcript.
    TranscriptDelta { stream_id: u64, content: String },
    /// Backend reported reasoning/thinking progress.
    ThinkingStatus { stream_id: u64, status: String },
    /// A send was rejected before any network call.
    SendRejected { reason: String },
    /// Security screening wants an explicit user decision before sending.
    ConfirmationRequired {
        source: WarningSource,
        message: String,
        detected: Vec<String>,
    },
    /// A tool call was created or changed status.
    ToolCallUpdated(LiveToolCall),
    /// Human-readable retry progress ("executing", "retrying in 2s").
    ToolCallStatus { id: String, status: String },
    /// The exchange finished; the assistant message is final and persisted.
    StreamCompleted {
        message: Message,
        artifact: Option<Artifact>,
    },
    /// Streamed fragment from one backend during parallel fan-out. Keep one
    /// accumulation buffer per provider; fragments interleave arbitrarily
    /// across backends.
    ParallelDelta { provider: String, content: String },
    /// One parallel-mode backend finished successfully.
    ParallelResponse { provider: String, message: Message },
    /// One parallel-mode backend failed; no message was persisted for it.
    ParallelFailure { provider: String, error: String },
    /// Response-side threat scan flagged the generated output.
    ResponseFlagged { alerts: Vec<ThreatAlert> },
    /// The exchange failed; no assistant message was persisted.
    StreamFailed { error: String },
    /// The exchange was cancelled; partial output was discarded.
    StreamCancelled,
    /// Detached memory extraction finished for an exchange.
    MemoryExtracted {
        conversation_id: Uuid,
        facts: Vec<MemoryFact>,
    },
    /// Backend pushed a ready-made artifact alongside the stream.
    ArtifactCreated(Artifact),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSource {
    Injection,
    Threat,
}

/// Typed fire-and-forget bus. Cheap to clone; every clone publishes into the
/// same channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }

    /// Publish without acknowledgment. Having no subscribers is not an
    /// error.
    pub fn publish(&self, event: OrchestratorEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(OrchestratorEvent::StreamCancelled);
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(OrchestratorEvent::SendRejected {
            reason: "blocked".to_string(),
        });

        match rx.recv().await.unwrap() {
            OrchestratorEvent::SendRejected { reason } => assert_eq!(reason, "blocked"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn late_subscribers_miss_earlier_events() {
        let bus = EventBus::default();
        bus.publish(OrchestratorEvent::StreamCancelled);
        let mut rx = bus.subscribe();
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
