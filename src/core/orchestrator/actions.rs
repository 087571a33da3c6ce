use std::collections::BTreeMap;

use tracing::{debug, warn};
use uuid::Uuid;

use super::{OrchestratorCommand, StreamOrchestrator};
use crate::core::artifact::{extract_first_artifact, Artifact};
use crate::core::events::OrchestratorEvent;
use crate::core::memory::MemoryFact;
use crate::core::message::Message;
use crate::core::parallel::ProviderOutcome;
use crate::core::session::{ExchangeOutcome, LiveToolCall, Phase};
use crate::security::redaction::restore;

/// Everything background tasks are allowed to do to the orchestrator. Each
/// stream-scoped variant carries the stream id it belongs to; stale ids are
/// dropped on arrival.
#[derive(Debug)]
pub(crate) enum OrchestratorAction {
    StreamChunk {
        content: String,
        stream_id: u64,
    },
    ThinkingStatus {
        status: String,
        stream_id: u64,
    },
    BackendArtifact {
        artifact: Artifact,
        stream_id: u64,
    },
    ToolCallStarted {
        id: String,
        name: String,
        input_json: String,
        stream_id: u64,
    },
    ToolCallCompleted {
        id: String,
        output: String,
        is_error: bool,
        stream_id: u64,
    },
    FlushTick {
        stream_id: u64,
    },
    StreamEnded {
        stream_id: u64,
    },
    StreamErrored {
        message: String,
        stream_id: u64,
    },
    ParallelDelta {
        provider: String,
        content: String,
        stream_id: u64,
    },
    ParallelFinished {
        outcomes: BTreeMap<String, ProviderOutcome>,
        stream_id: u64,
    },
    ToolRetryAttempt {
        id: String,
        attempt: u32,
        status: String,
    },
    ToolRetryFinished {
        id: String,
        output: String,
        is_error: bool,
    },
    MemoryExtracted {
        conversation_id: Uuid,
        facts: Vec<MemoryFact>,
    },
    PersistFailed {
        error: String,
    },
    /// Ends the action pump. The orchestrator holds its own action sender,
    /// so the channel alone can never signal termination.
    Shutdown,
}

pub(super) fn apply_action(
    o: &mut StreamOrchestrator,
    action: OrchestratorAction,
) -> Vec<OrchestratorCommand> {
    match action {
        OrchestratorAction::StreamChunk { content, stream_id } => {
            if !o.is_current_stream(stream_id) {
                return Vec::new();
            }
            append_chunk(o, &content, stream_id)
        }
        OrchestratorAction::ThinkingStatus { status, stream_id } => {
            if !o.is_current_stream(stream_id) {
                return Vec::new();
            }
            if let Some(exchange) = o.exchange.as_mut() {
                exchange.thinking_status = Some(status.clone());
            }
            o.bus
                .publish(OrchestratorEvent::ThinkingStatus { stream_id, status });
            Vec::new()
        }
        OrchestratorAction::BackendArtifact { artifact, stream_id } => {
            if !o.is_current_stream(stream_id) {
                return Vec::new();
            }
            if let Some(exchange) = o.exchange.as_mut() {
                exchange.backend_artifact = Some(artifact.clone());
            }
            o.bus.publish(OrchestratorEvent::ArtifactCreated(artifact));
            Vec::new()
        }
        OrchestratorAction::ToolCallStarted {
            id,
            name,
            input_json,
            stream_id,
        } => {
            if !o.is_current_stream(stream_id) {
                return Vec::new();
            }
            tool_call_started(o, id, name, input_json);
            Vec::new()
        }
        OrchestratorAction::ToolCallCompleted {
            id,
            output,
            is_error,
            stream_id,
        } => {
            if !o.is_current_stream(stream_id) {
                return Vec::new();
            }
            tool_call_completed(o, &id, output, is_error);
            Vec::new()
        }
        OrchestratorAction::FlushTick { stream_id } => {
            if !o.is_current_stream(stream_id) {
                return Vec::new();
            }
            flush_tick(o, stream_id);
            Vec::new()
        }
        OrchestratorAction::StreamEnded { stream_id } => {
            if !o.is_current_stream(stream_id) {
                return Vec::new();
            }
            finalize_stream(o, stream_id)
        }
        OrchestratorAction::StreamErrored { message, stream_id } => {
            if !o.is_current_stream(stream_id) {
                return Vec::new();
            }
            fail_stream(o, message);
            Vec::new()
        }
        OrchestratorAction::ParallelDelta {
            provider,
            content,
            stream_id,
        } => {
            if !o.is_current_stream(stream_id) {
                return Vec::new();
            }
            o.bus
                .publish(OrchestratorEvent::ParallelDelta { provider, content });
            Vec::new()
        }
        OrchestratorAction::ParallelFinished { outcomes, stream_id } => {
            if !o.is_current_stream(stream_id) {
                return Vec::new();
            }
            finalize_parallel(o, outcomes)
        }
        OrchestratorAction::ToolRetryAttempt { id, attempt, status } => {
            debug!(id = %id, attempt, "tool retry attempt");
            o.bus
                .publish(OrchestratorEvent::ToolCallStatus { id, status });
            Vec::new()
        }
        OrchestratorAction::ToolRetryFinished {
            id,
            output,
            is_error,
        } => {
            tool_call_completed(o, &id, output, is_error);
            Vec::new()
        }
        OrchestratorAction::MemoryExtracted {
            conversation_id,
            facts,
        } => {
            o.bus.publish(OrchestratorEvent::MemoryExtracted {
                conversation_id,
                facts,
            });
            Vec::new()
        }
        OrchestratorAction::PersistFailed { error } => {
            o.last_error = Some(error);
            Vec::new()
        }
        OrchestratorAction::Shutdown => Vec::new(),
    }
}

fn append_chunk(
    o: &mut StreamOrchestrator,
    content: &str,
    stream_id: u64,
) -> Vec<OrchestratorCommand> {
    if content.is_empty() {
        return Vec::new();
    }
    let Some(exchange) = o.exchange.as_mut() else {
        return Vec::new();
    };

    exchange.record_chunk(content);

    // A buffer past the size bound flushes immediately, bypassing the timer.
    // Any pending timer stays scheduled; its tick drains whatever arrives in
    // the meantime, so there is never more than one.
    if exchange.needs_immediate_flush() {
        if let Some(delta) = exchange.flush() {
            o.bus
                .publish(OrchestratorEvent::TranscriptDelta { stream_id, content: delta });
        }
        return Vec::new();
    }

    if exchange.flush_scheduled {
        return Vec::new();
    }
    exchange.flush_scheduled = true;
    vec![OrchestratorCommand::ScheduleFlush {
        stream_id,
        delay: exchange.flush_interval(),
    }]
}

fn flush_tick(o: &mut StreamOrchestrator, stream_id: u64) {
    let Some(exchange) = o.exchange.as_mut() else {
        return;
    };
    exchange.flush_scheduled = false;
    if let Some(delta) = exchange.flush() {
        o.bus
            .publish(OrchestratorEvent::TranscriptDelta { stream_id, content: delta });
    }
}

fn tool_call_started(o: &mut StreamOrchestrator, id: String, name: String, input_json: String) {
    let call = match o.live_tool_calls.iter_mut().find(|call| call.id == id) {
        Some(existing) => {
            // Re-announced id: refresh the payload but keep the entry.
            existing.input_json = input_json.clone();
            existing.arguments = crate::core::session::parse_arguments(&input_json);
            existing.clone()
        }
        None => {
            let call = LiveToolCall::started(id, name, input_json);
            o.live_tool_calls.push(call.clone());
            call
        }
    };
    o.bus.publish(OrchestratorEvent::ToolCallUpdated(call));
}

fn tool_call_completed(o: &mut StreamOrchestrator, id: &str, output: String, is_error: bool) {
    let call = match o.live_tool_calls.iter_mut().find(|call| call.id == id) {
        Some(existing) => {
            existing.complete(output, is_error);
            existing.clone()
        }
        None => {
            warn!(id, "completion for untracked tool call");
            let mut call = LiveToolCall::started(id, "unknown", "{}");
            call.complete(output, is_error);
            o.live_tool_calls.push(call.clone());
            call
        }
    };
    o.bus.publish(OrchestratorEvent::ToolCallUpdated(call));
}

/// Normal end of a single-backend stream: flush the remainder, reverse the
/// redaction, scan the response, lift an artifact, persist, clear all
/// per-exchange state, and fire detached memory extraction.
fn finalize_stream(o: &mut StreamOrchestrator, stream_id: u64) -> Vec<OrchestratorCommand> {
    let Some(mut exchange) = o.exchange.take() else {
        return Vec::new();
    };

    if let Some(delta) = exchange.flush() {
        o.bus
            .publish(OrchestratorEvent::TranscriptDelta { stream_id, content: delta });
    }
    debug!(
        stream_id,
        chunks = exchange.chunk_count,
        bytes = exchange.byte_count,
        "stream finished"
    );

    let restored = restore(&exchange.visible_text, &exchange.redaction_map);

    if o.config.security.threat_analysis {
        let scan = o.threat.analyze_model_response(&restored);
        if !scan.is_clean {
            warn!(alerts = scan.alerts.len(), "model response flagged");
            o.bus
                .publish(OrchestratorEvent::ResponseFlagged { alerts: scan.alerts });
        }
    }

    let artifact = exchange
        .backend_artifact
        .take()
        .or_else(|| extract_first_artifact(&restored));

    o.live_tool_calls.clear();
    o.phase = Phase::Idle;
    o.last_outcome = Some(ExchangeOutcome::Completed);

    if restored.is_empty() {
        let error = "backend returned an empty response".to_string();
        o.last_error = Some(error.clone());
        o.last_outcome = Some(ExchangeOutcome::Failed(error.clone()));
        o.bus.publish(OrchestratorEvent::StreamFailed { error });
        return Vec::new();
    }

    let message = Message::assistant(exchange.conversation_id, restored.clone())
        .with_provider(o.config.provider.clone());
    o.messages.push(message.clone());
    o.bus
        .publish(OrchestratorEvent::MessageAppended(message.clone()));
    o.bus.publish(OrchestratorEvent::StreamCompleted {
        message: message.clone(),
        artifact,
    });

    let mut commands = vec![OrchestratorCommand::PersistAssistant(message)];
    if o.config.memory_extraction {
        commands.push(OrchestratorCommand::ExtractMemory {
            conversation_id: exchange.conversation_id,
            user_text: exchange.user_text.clone(),
            assistant_text: restored,
        });
    }
    commands
}

/// Fatal generation failure: surface the error, return to idle, persist
/// nothing for this turn.
fn fail_stream(o: &mut StreamOrchestrator, message: String) {
    if let Some(exchange) = o.exchange.take() {
        exchange.cancel_token.cancel();
    }
    o.live_tool_calls.clear();
    o.phase = Phase::Idle;
    o.last_error = Some(message.clone());
    o.last_outcome = Some(ExchangeOutcome::Failed(message.clone()));
    o.bus
        .publish(OrchestratorEvent::StreamFailed { error: message });
}

/// Parallel-mode completion: each success is independently restored with the
/// pre-fan-out map and persisted as a provider-tagged assistant message; a
/// failed backend has no persisted message.
fn finalize_parallel(
    o: &mut StreamOrchestrator,
    outcomes: BTreeMap<String, ProviderOutcome>,
) -> Vec<OrchestratorCommand> {
    let Some(exchange) = o.exchange.take() else {
        return Vec::new();
    };

    o.live_tool_calls.clear();
    o.phase = Phase::Idle;
    o.last_outcome = Some(ExchangeOutcome::Completed);

    let mut commands = Vec::new();
    for (provider, outcome) in outcomes {
        match outcome {
            ProviderOutcome::Success(text) => {
                let restored = restore(&text, &exchange.redaction_map);
                if restored.is_empty() {
                    continue;
                }
                let message = Message::assistant(exchange.conversation_id, restored)
                    .with_provider(provider.clone());
                o.messages.push(message.clone());
                o.bus
                    .publish(OrchestratorEvent::MessageAppended(message.clone()));
                o.bus.publish(OrchestratorEvent::ParallelResponse {
                    provider,
                    message: message.clone(),
                });
                commands.push(OrchestratorCommand::PersistAssistant(message));
            }
            ProviderOutcome::Failure(error) => {
                debug!(provider = %provider, "parallel backend failed: {error}");
                o.bus
                    .publish(OrchestratorEvent::ParallelFailure { provider, error });
            }
        }
    }
    commands
}
