//! The central conversation state machine.
//!
//! One orchestrator owns one visible transcript and at most one in-flight
//! generation. Every mutation of shared observable state flows through
//! [`actions::apply_action`] on the single owner behind an async mutex:
//! background tasks (stream drivers, flush timers, tool retries, memory
//! extraction) never touch state directly, they dispatch actions back into
//! the pump. Stream events are tagged with a stream id so anything from a
//! superseded exchange is dropped on arrival.

mod actions;
mod send;
#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::api::ChatBackend;
use crate::core::config::OrchestratorConfig;
use crate::core::events::{EventBus, OrchestratorEvent, WarningSource};
use crate::core::memory::MemoryExtractor;
use crate::core::message::Message;
use crate::core::session::{ExchangeOutcome, ExchangeSession, LiveToolCall, Phase};
use crate::security::injection::InjectionGuard;
use crate::security::redaction::{RedactionError, Redactor};
use crate::security::threat::ThreatAnalyzer;
use crate::storage::{ConversationStore, StoreError};
use crate::tools::{ToolCallExecutor, ToolClient, ToolError};

pub(crate) use actions::OrchestratorAction;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Redaction(#[from] RedactionError),
    #[error("no backend registered under `{0}`")]
    UnknownProvider(String),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("message is empty")]
    EmptyMessage,
    #[error("no backend registered under `{0}`")]
    UnknownProvider(String),
    #[error("no send is awaiting confirmation")]
    NoPendingSend,
    #[error("message {0} is not an editable user message")]
    NotEditable(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What became of a call to `send_message`.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    /// The pipeline accepted the message; generation is running.
    Accepted { message_id: Uuid, stream_id: u64 },
    /// Security screening blocked the message before any network call.
    Rejected { reason: String },
    /// Screening wants an explicit decision; resolve with
    /// [`OrchestratorHandle::confirm_pending_send`] or
    /// [`OrchestratorHandle::dismiss_pending_send`].
    AwaitingConfirmation {
        source: WarningSource,
        reason: String,
        detected: Vec<String>,
    },
}

/// A send suspended on a security warning. Held until the user decides.
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub text: String,
    pub source: WarningSource,
    pub reason: String,
    pub detected: Vec<String>,
}

/// Point-in-time copy of observable orchestrator state.
#[derive(Debug, Clone)]
pub struct OrchestratorSnapshot {
    pub phase: Phase,
    pub conversation_id: Uuid,
    pub messages: Vec<Message>,
    /// Flushed (visible) portion of the in-flight response, empty when idle.
    pub streaming_text: String,
    pub thinking_status: Option<String>,
    pub live_tool_calls: Vec<LiveToolCall>,
    pub pending_send: Option<PendingSend>,
    pub last_error: Option<String>,
    pub last_outcome: Option<ExchangeOutcome>,
}

/// Everything the orchestrator needs injected. Security services are built
/// from configuration per instance, so no state leaks across orchestrators
/// or tests.
pub struct OrchestratorDeps {
    pub backends: BTreeMap<String, Arc<dyn ChatBackend>>,
    pub store: Arc<dyn ConversationStore>,
    pub tools: Option<Arc<dyn ToolClient>>,
    pub memory: Option<Arc<dyn MemoryExtractor>>,
}

/// Deferred side effects produced by [`actions::apply_action`], executed by
/// the pump after the lock is released.
pub(crate) enum OrchestratorCommand {
    ScheduleFlush { stream_id: u64, delay: Duration },
    PersistAssistant(Message),
    ExtractMemory {
        conversation_id: Uuid,
        user_text: String,
        assistant_text: String,
    },
}

pub struct StreamOrchestrator {
    pub(crate) config: OrchestratorConfig,
    pub(crate) backends: BTreeMap<String, Arc<dyn ChatBackend>>,
    pub(crate) store: Arc<dyn ConversationStore>,
    pub(crate) tool_executor: Option<ToolCallExecutor>,
    pub(crate) guard: InjectionGuard,
    pub(crate) threat: ThreatAnalyzer,
    pub(crate) redactor: Redactor,
    pub(crate) bus: EventBus,
    pub(crate) actions: mpsc::UnboundedSender<OrchestratorAction>,
    pub(crate) conversation_id: Uuid,
    pub(crate) messages: Vec<Message>,
    pub(crate) live_tool_calls: Vec<LiveToolCall>,
    pub(crate) phase: Phase,
    pub(crate) exchange: Option<ExchangeSession>,
    pub(crate) pending_send: Option<PendingSend>,
    pub(crate) last_error: Option<String>,
    pub(crate) last_outcome: Option<ExchangeOutcome>,
    pub(crate) current_stream_id: u64,
}

impl StreamOrchestrator {
    /// Build an orchestrator for a fresh conversation and start its action
    /// pump.
    pub fn spawn(
        deps: OrchestratorDeps,
        config: OrchestratorConfig,
    ) -> Result<OrchestratorHandle, OrchestratorError> {
        Self::spawn_for_conversation(deps, config, Uuid::new_v4())
    }

    pub fn spawn_for_conversation(
        deps: OrchestratorDeps,
        config: OrchestratorConfig,
        conversation_id: Uuid,
    ) -> Result<OrchestratorHandle, OrchestratorError> {
        if !deps.backends.contains_key(&config.provider) {
            return Err(OrchestratorError::UnknownProvider(config.provider.clone()));
        }
        for provider in &config.parallel.providers {
            if !deps.backends.contains_key(provider) {
                return Err(OrchestratorError::UnknownProvider(provider.clone()));
            }
        }

        let redactor = Redactor::from_config(
            &config.redaction.disabled_builtins,
            &config.redaction.custom_patterns,
        )?;
        let threat = ThreatAnalyzer::new(config.security.threat_policy.clone());
        let tool_executor = deps
            .tools
            .map(|client| ToolCallExecutor::new(client, config.retry.clone()));

        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        let bus = EventBus::default();

        let orchestrator = StreamOrchestrator {
            config,
            backends: deps.backends,
            store: deps.store.clone(),
            tool_executor,
            guard: InjectionGuard::new(),
            threat,
            redactor,
            bus: bus.clone(),
            actions: actions_tx.clone(),
            conversation_id,
            messages: Vec::new(),
            live_tool_calls: Vec::new(),
            phase: Phase::Idle,
            exchange: None,
            pending_send: None,
            last_error: None,
            last_outcome: None,
            current_stream_id: 0,
        };

        let inner = Arc::new(Mutex::new(orchestrator));
        spawn_action_pump(
            inner.clone(),
            actions_rx,
            PumpContext {
                actions: actions_tx.clone(),
                store: deps.store,
                memory: deps.memory,
            },
        );

        Ok(OrchestratorHandle {
            inner,
            actions: actions_tx,
            bus,
        })
    }

    pub(crate) fn is_current_stream(&self, stream_id: u64) -> bool {
        self.exchange
            .as_ref()
            .is_some_and(|exchange| exchange.stream_id == stream_id)
    }

    /// Cancel and fully discard any in-flight exchange. All per-exchange
    /// transient state (buffer, redaction map, tool-call list) goes with it,
    /// synchronously, so observers see a consistent idle state.
    pub(crate) fn teardown_exchange(&mut self, outcome: ExchangeOutcome) {
        let Some(exchange) = self.exchange.take() else {
            return;
        };
        exchange.cancel_token.cancel();
        self.live_tool_calls.clear();
        self.phase = Phase::Idle;
        if matches!(outcome, ExchangeOutcome::Cancelled) {
            self.bus.publish(OrchestratorEvent::StreamCancelled);
        }
        self.last_outcome = Some(outcome);
        debug!(stream_id = exchange.stream_id, "exchange torn down");
    }

    pub(crate) fn snapshot(&self) -> OrchestratorSnapshot {
        OrchestratorSnapshot {
            phase: self.phase,
            conversation_id: self.conversation_id,
            messages: self.messages.clone(),
            streaming_text: self
                .exchange
                .as_ref()
                .map(|e| e.visible_text.clone())
                .unwrap_or_default(),
            thinking_status: self
                .exchange
                .as_ref()
                .and_then(|e| e.thinking_status.clone()),
            live_tool_calls: self.live_tool_calls.clone(),
            pending_send: self.pending_send.clone(),
            last_error: self.last_error.clone(),
            last_outcome: self.last_outcome.clone(),
        }
    }
}

struct PumpContext {
    actions: mpsc::UnboundedSender<OrchestratorAction>,
    store: Arc<dyn ConversationStore>,
    memory: Option<Arc<dyn MemoryExtractor>>,
}

/// The serialized update path: one task drains the action queue, applies
/// each action under the lock, then executes the resulting commands.
fn spawn_action_pump(
    inner: Arc<Mutex<StreamOrchestrator>>,
    mut actions_rx: mpsc::UnboundedReceiver<OrchestratorAction>,
    ctx: PumpContext,
) {
    tokio::spawn(async move {
        while let Some(action) = actions_rx.recv().await {
            if matches!(action, OrchestratorAction::Shutdown) {
                break;
            }
            let commands = {
                let mut orchestrator = inner.lock().await;
                actions::apply_action(&mut orchestrator, action)
            };
            for command in commands {
                execute_command(command, &ctx);
            }
        }
    });
}

fn execute_command(command: OrchestratorCommand, ctx: &PumpContext) {
    match command {
        OrchestratorCommand::ScheduleFlush { stream_id, delay } => {
            let actions = ctx.actions.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = actions.send(OrchestratorAction::FlushTick { stream_id });
            });
        }
        OrchestratorCommand::PersistAssistant(message) => {
            let store = ctx.store.clone();
            let actions = ctx.actions.clone();
            tokio::spawn(async move {
                if let Err(e) = store.save_message(&message).await {
                    error!("failed to persist assistant message: {e}");
                    let _ = actions.send(OrchestratorAction::PersistFailed {
                        error: e.to_string(),
                    });
                }
            });
        }
        OrchestratorCommand::ExtractMemory {
            conversation_id,
            user_text,
            assistant_text,
        } => {
            let Some(extractor) = ctx.memory.clone() else {
                return;
            };
            let actions = ctx.actions.clone();
            // Detached on purpose: extraction failure or latency must never
            // reach the transcript or delay the next send.
            tokio::spawn(async move {
                match extractor
                    .extract(conversation_id, &user_text, &assistant_text)
                    .await
                {
                    Ok(facts) if !facts.is_empty() => {
                        let _ = actions.send(OrchestratorAction::MemoryExtracted {
                            conversation_id,
                            facts,
                        });
                    }
                    Ok(_) => {}
                    Err(e) => warn!("memory extraction failed: {e}"),
                }
            });
        }
    }
}

/// Clonable entry point for driving one orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    inner: Arc<Mutex<StreamOrchestrator>>,
    actions: mpsc::UnboundedSender<OrchestratorAction>,
    bus: EventBus,
}

impl OrchestratorHandle {
    /// Run the full send pipeline for a user message. Implicitly cancels
    /// any exchange still in flight once screening passes.
    pub async fn send_message(&self, text: impl Into<String>) -> Result<SendOutcome, SendError> {
        let mut orchestrator = self.inner.lock().await;
        orchestrator.pending_send = None;
        send::submit(&mut orchestrator, text.into(), false).await
    }

    /// Resolve a suspended send by re-entering the pipeline with security
    /// bypassed.
    pub async fn confirm_pending_send(&self) -> Result<SendOutcome, SendError> {
        let mut orchestrator = self.inner.lock().await;
        let pending = orchestrator
            .pending_send
            .take()
            .ok_or(SendError::NoPendingSend)?;
        orchestrator.phase = Phase::Idle;
        send::submit(&mut orchestrator, pending.text, true).await
    }

    /// Drop a suspended send without sending it.
    pub async fn dismiss_pending_send(&self) {
        let mut orchestrator = self.inner.lock().await;
        orchestrator.pending_send = None;
        if orchestrator.phase == Phase::AwaitingConfirmation {
            // A suspended send never cancelled the in-flight exchange; fall
            // back to whichever state that leaves us in.
            orchestrator.phase = if orchestrator.exchange.is_some() {
                Phase::Streaming
            } else {
                Phase::Idle
            };
        }
    }

    /// Explicit user cancellation of the in-flight exchange. Partial output
    /// is discarded silently; this is not an error.
    pub async fn cancel(&self) {
        let mut orchestrator = self.inner.lock().await;
        orchestrator.teardown_exchange(ExchangeOutcome::Cancelled);
    }

    /// Edit a user message: atomically removes it and every subsequent
    /// message from storage, then re-runs the send pipeline with the new
    /// text.
    pub async fn edit_user_message(
        &self,
        message_id: Uuid,
        new_text: impl Into<String>,
    ) -> Result<SendOutcome, SendError> {
        let mut orchestrator = self.inner.lock().await;
        orchestrator.teardown_exchange(ExchangeOutcome::Cancelled);

        let index = orchestrator
            .messages
            .iter()
            .position(|m| m.id == message_id && m.is_user())
            .ok_or(SendError::NotEditable(message_id))?;

        let removed: Vec<Uuid> = orchestrator.messages[index..].iter().map(|m| m.id).collect();
        for id in removed {
            match orchestrator.store.delete_message(id).await {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        orchestrator.messages.truncate(index);

        send::submit(&mut orchestrator, new_text.into(), false).await
    }

    /// Re-run a tool call through the backoff-aware executor. An untracked
    /// id gets a fresh entry; a tracked one keeps its id, bumps the retry
    /// count, and goes back to `Running`.
    pub async fn retry_tool_call(&self, id: &str, name: &str, input_json: &str) {
        let mut orchestrator = self.inner.lock().await;

        let call = match orchestrator
            .live_tool_calls
            .iter_mut()
            .find(|call| call.id == id)
        {
            Some(existing) => {
                existing.begin_retry();
                existing.clone()
            }
            None => {
                let call = LiveToolCall::started(id, name, input_json);
                orchestrator.live_tool_calls.push(call.clone());
                call
            }
        };
        orchestrator
            .bus
            .publish(OrchestratorEvent::ToolCallUpdated(call.clone()));

        let Some(executor) = orchestrator.tool_executor.clone() else {
            let _ = orchestrator
                .actions
                .send(OrchestratorAction::ToolRetryFinished {
                    id: call.id,
                    output: "no tool client configured".to_string(),
                    is_error: true,
                });
            return;
        };

        let actions = orchestrator.actions.clone();
        let name = call.name.clone();
        let arguments = call.arguments.clone();
        let call_id = call.id;
        tokio::spawn(async move {
            let attempt_actions = actions.clone();
            let attempt_id = call_id.clone();
            let result = executor
                .run(&name, &arguments, move |attempt, delay| {
                    let status = if delay.is_zero() {
                        "executing".to_string()
                    } else {
                        format!("retrying in {:.1}s", delay.as_secs_f64())
                    };
                    let _ = attempt_actions.send(OrchestratorAction::ToolRetryAttempt {
                        id: attempt_id.clone(),
                        attempt,
                        status,
                    });
                })
                .await;

            let (output, is_error) = match result {
                Ok(output) => (output.combined_text(), output.is_error),
                Err(ToolError::Transient(e)) | Err(ToolError::Fatal(e)) => (e, true),
            };
            let _ = actions.send(OrchestratorAction::ToolRetryFinished {
                id: call_id,
                output,
                is_error,
            });
        });
    }

    /// Load existing transcript pages from the store into the visible
    /// message list. Intended for conversation resume at startup.
    pub async fn hydrate(&self, page_size: usize) -> Result<usize, SendError> {
        let mut orchestrator = self.inner.lock().await;
        let conversation_id = orchestrator.conversation_id;
        let store = orchestrator.store.clone();

        let mut loaded = Vec::new();
        let mut cursor = None;
        loop {
            let page = store
                .load_messages(conversation_id, cursor, page_size.max(1))
                .await?;
            loaded.extend(page.messages);
            if !page.has_more {
                break;
            }
            cursor = page.next_cursor;
        }

        let count = loaded.len();
        orchestrator.messages = loaded;
        Ok(count)
    }

    /// Drop per-conversation threat escalation state. Retention is caller
    /// policy; nothing resets it implicitly.
    pub async fn reset_threat_state(&self) {
        let mut orchestrator = self.inner.lock().await;
        let conversation_id = orchestrator.conversation_id;
        orchestrator.threat.reset_conversation(conversation_id);
    }

    /// Cancel any in-flight work and stop the action pump. The handle (and
    /// its clones) are inert afterwards.
    pub async fn shutdown(&self) {
        {
            let mut orchestrator = self.inner.lock().await;
            orchestrator.teardown_exchange(ExchangeOutcome::Cancelled);
        }
        let _ = self.actions.send(OrchestratorAction::Shutdown);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<OrchestratorEvent> {
        self.bus.subscribe()
    }

    pub async fn snapshot(&self) -> OrchestratorSnapshot {
        self.inner.lock().await.snapshot()
    }
}
