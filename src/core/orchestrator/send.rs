use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::{OrchestratorAction, PendingSend, SendError, SendOutcome, StreamOrchestrator};
use crate::api::{ChatBackend, ChatMessage, GenerationConfig, StreamEvent, StreamEventSink, StreamRequest};
use crate::core::events::{OrchestratorEvent, WarningSource};
use crate::core::message::Message;
use crate::core::parallel::ParallelExecutor;
use crate::core::session::{ExchangeOutcome, ExchangeSession, Phase};

/// The send pipeline. Each stage short-circuits on rejection; nothing before
/// the security verdict mutates shared state, so a blocked send leaves the
/// orchestrator exactly as it found it.
pub(super) async fn submit(
    o: &mut StreamOrchestrator,
    text: String,
    bypass_security: bool,
) -> Result<SendOutcome, SendError> {
    if text.trim().is_empty() {
        return Err(SendError::EmptyMessage);
    }

    let backend = o
        .backends
        .get(&o.config.provider)
        .cloned()
        .ok_or_else(|| SendError::UnknownProvider(o.config.provider.clone()))?;

    // Stage 1: injection screening.
    if o.config.security.injection_check && !bypass_security {
        let analysis = o.guard.analyze(&text);
        if o.guard.should_block(&analysis) {
            let names: Vec<String> =
                analysis.detected_patterns.iter().map(|m| m.name.clone()).collect();
            return Ok(reject(
                o,
                format!("Message blocked: prompt injection detected ({})", names.join(", ")),
            ));
        }
        if analysis.requires_user_confirmation {
            let detected: Vec<String> =
                analysis.detected_patterns.iter().map(|m| m.name.clone()).collect();
            return Ok(suspend(
                o,
                text,
                WarningSource::Injection,
                "This message matches patterns often used to manipulate the assistant. Send anyway?"
                    .to_string(),
                detected,
            ));
        }
    }

    // Stage 2: conversation-scoped threat analysis.
    if o.config.security.threat_analysis && !bypass_security {
        let recent: Vec<Message> = o.messages.iter().rev().take(5).rev().cloned().collect();
        let conversation_id = o.conversation_id;
        let analysis = o
            .threat
            .analyze_incoming_prompt(&text, &recent, conversation_id);
        if analysis.should_block {
            let kinds: Vec<String> = analysis.alerts.iter().map(|a| a.kind.clone()).collect();
            return Ok(reject(
                o,
                format!("Message blocked: threat detected ({})", kinds.join(", ")),
            ));
        }
        if analysis.requires_confirmation {
            let kinds: Vec<String> = analysis.alerts.iter().map(|a| a.kind.clone()).collect();
            return Ok(suspend(
                o,
                text,
                WarningSource::Threat,
                "This message raised a security warning for this conversation. Send anyway?"
                    .to_string(),
                kinds,
            ));
        }
    }

    // Screening passed: the new send now owns shared state. Tear down any
    // in-flight exchange before touching it.
    o.teardown_exchange(ExchangeOutcome::Cancelled);
    o.phase = Phase::Sending;
    o.last_error = None;

    // Stage 3: redact the outbound text and a bounded history window. The
    // per-message history maps are dropped; only the outbound map survives,
    // for exactly one exchange.
    let (outbound_text, redaction_map) = if o.config.redaction.enabled {
        let result = o.redactor.redact(&text);
        (result.sanitized_text, result.redaction_map)
    } else {
        (text.clone(), HashMap::new())
    };
    let mut history = build_history(o);

    // Stage 4: skill augmentation, for this call only.
    let mut system_prompt = o.config.system_prompt.clone();
    if let Some(skill) = o.config.match_skill(&text) {
        debug!(skill = %skill.name, "skill matched");
        system_prompt = Some(match system_prompt {
            Some(base) => format!("{base}\n\n{}", skill.prompt),
            None => skill.prompt.clone(),
        });
    }
    if let Some(prompt) = &system_prompt {
        history.insert(0, ChatMessage::new("system", prompt.clone()));
    }
    history.push(ChatMessage::new("user", outbound_text.clone()));

    // Stage 5: persist the user-visible (non-redacted) message before any
    // generation starts, so it survives a crash or cancel of the stream.
    let user_message = Message::user(o.conversation_id, text.clone());
    o.store.save_message(&user_message).await?;
    o.messages.push(user_message.clone());
    o.bus
        .publish(OrchestratorEvent::MessageAppended(user_message.clone()));

    o.current_stream_id += 1;
    let stream_id = o.current_stream_id;
    let exchange = ExchangeSession::new(stream_id, o.conversation_id, redaction_map, text);

    let generation = GenerationConfig {
        provider: o.config.provider.clone(),
        model: o.config.model.clone(),
        system_prompt,
        temperature: o.config.temperature,
    };

    // Stage 6: parallel fan-out takes over the whole exchange when active.
    if o.config.parallel.is_active() {
        let cancel = exchange.cancel_token.clone();
        o.exchange = Some(exchange);
        o.phase = Phase::Streaming;
        spawn_parallel_tasks(o, outbound_text, generation, history, stream_id, cancel);
        return Ok(SendOutcome::Accepted {
            message_id: user_message.id,
            stream_id,
        });
    }

    // Stage 7: single-backend streaming call.
    let sink_cancel = exchange.cancel_token.clone();
    o.exchange = Some(exchange);
    o.phase = Phase::Streaming;

    let request = StreamRequest {
        text: outbound_text,
        config: generation,
        history,
    };
    spawn_stream_tasks(o, backend, request, stream_id, sink_cancel);

    Ok(SendOutcome::Accepted {
        message_id: user_message.id,
        stream_id,
    })
}

fn reject(o: &mut StreamOrchestrator, reason: String) -> SendOutcome {
    o.last_error = Some(reason.clone());
    o.bus.publish(OrchestratorEvent::SendRejected {
        reason: reason.clone(),
    });
    SendOutcome::Rejected { reason }
}

fn suspend(
    o: &mut StreamOrchestrator,
    text: String,
    source: WarningSource,
    reason: String,
    detected: Vec<String>,
) -> SendOutcome {
    o.pending_send = Some(PendingSend {
        text,
        source,
        reason: reason.clone(),
        detected: detected.clone(),
    });
    o.phase = Phase::AwaitingConfirmation;
    o.bus.publish(OrchestratorEvent::ConfirmationRequired {
        source,
        message: reason.clone(),
        detected: detected.clone(),
    });
    SendOutcome::AwaitingConfirmation {
        source,
        reason,
        detected,
    }
}

/// Wire history: the trailing window of user/assistant turns, each redacted
/// independently.
fn build_history(o: &StreamOrchestrator) -> Vec<ChatMessage> {
    let window = o.config.redaction.history_window;
    let turns: Vec<&Message> = o.messages.iter().filter(|m| m.role.is_history()).collect();
    let start = turns.len().saturating_sub(window);

    turns[start..]
        .iter()
        .map(|message| {
            let content = if o.config.redaction.enabled {
                o.redactor.redact(&message.content).sanitized_text
            } else {
                message.content.clone()
            };
            ChatMessage::new(message.role.as_str(), content)
        })
        .collect()
}

/// Drive one backend stream. The driver task runs the call to completion;
/// the forwarder drains the sink channel in arrival order and only reports
/// the terminal outcome after every event has been applied, so completion
/// can never overtake a chunk.
fn spawn_stream_tasks(
    o: &StreamOrchestrator,
    backend: Arc<dyn ChatBackend>,
    request: StreamRequest,
    stream_id: u64,
    cancel: tokio_util::sync::CancellationToken,
) {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let sink = StreamEventSink::new(event_tx, stream_id, cancel);
    let (done_tx, done_rx) = oneshot::channel();

    tokio::spawn(async move {
        let result = backend.stream_message(request, sink).await;
        let _ = done_tx.send(result);
    });

    let actions = o.actions.clone();
    tokio::spawn(async move {
        while let Some((event, id)) = event_rx.recv().await {
            let action = match event {
                StreamEvent::Chunk(content) => OrchestratorAction::StreamChunk {
                    content,
                    stream_id: id,
                },
                StreamEvent::ThinkingStatus(status) => OrchestratorAction::ThinkingStatus {
                    status,
                    stream_id: id,
                },
                StreamEvent::ArtifactCreated(artifact) => OrchestratorAction::BackendArtifact {
                    artifact,
                    stream_id: id,
                },
                StreamEvent::ToolCallStarted {
                    id: call_id,
                    name,
                    input_json,
                } => OrchestratorAction::ToolCallStarted {
                    id: call_id,
                    name,
                    input_json,
                    stream_id: id,
                },
                StreamEvent::ToolCallCompleted {
                    id: call_id,
                    output,
                    is_error,
                } => OrchestratorAction::ToolCallCompleted {
                    id: call_id,
                    output,
                    is_error,
                    stream_id: id,
                },
            };
            if actions.send(action).is_err() {
                return;
            }
        }

        // Channel closed: the backend dropped the sink, every event above is
        // already queued in order.
        let terminal = match done_rx.await {
            Ok(Ok(())) => OrchestratorAction::StreamEnded { stream_id },
            Ok(Err(e)) => OrchestratorAction::StreamErrored {
                message: e.to_string(),
                stream_id,
            },
            Err(_) => OrchestratorAction::StreamErrored {
                message: "backend task aborted".to_string(),
                stream_id,
            },
        };
        let _ = actions.send(terminal);
    });
}

/// Launch the parallel fan-out plus its delta forwarder. The forwarder owns
/// terminal reporting for the same ordering reason as the single-stream
/// path.
fn spawn_parallel_tasks(
    o: &StreamOrchestrator,
    text: String,
    generation: GenerationConfig,
    history: Vec<ChatMessage>,
    stream_id: u64,
    cancel: tokio_util::sync::CancellationToken,
) {
    let backends: Vec<(String, Arc<dyn ChatBackend>)> = o
        .config
        .parallel
        .providers
        .iter()
        .filter_map(|name| {
            o.backends
                .get(name)
                .map(|backend| (name.clone(), backend.clone()))
        })
        .collect();

    let (delta_tx, mut delta_rx) = mpsc::unbounded_channel();
    let (done_tx, done_rx) = oneshot::channel();

    tokio::spawn(async move {
        let executor = ParallelExecutor::with_token(cancel);
        let outcomes = executor
            .execute(backends, &text, &generation, &history, delta_tx)
            .await;
        let _ = done_tx.send(outcomes);
    });

    let actions = o.actions.clone();
    tokio::spawn(async move {
        while let Some(delta) = delta_rx.recv().await {
            let _ = actions.send(OrchestratorAction::ParallelDelta {
                provider: delta.provider,
                content: delta.content,
                stream_id,
            });
        }
        if let Ok(outcomes) = done_rx.await {
            let _ = actions.send(OrchestratorAction::ParallelFinished { outcomes, stream_id });
        }
    });
}
