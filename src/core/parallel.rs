use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::{ChatBackend, ChatMessage, GenerationConfig, StreamEvent, StreamEventSink, StreamRequest};

/// One streamed fragment from one backend during fan-out. Deltas from
/// different backends interleave arbitrarily; within one backend they arrive
/// in order.
#[derive(Debug, Clone)]
pub struct ParallelDelta {
    pub provider: String,
    pub content: String,
}

/// Terminal per-backend result: accumulated text or the failure that ended
/// the stream. One backend failing never affects the others.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderOutcome {
    Success(String),
    Failure(String),
}

impl ProviderOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProviderOutcome::Success(_))
    }
}

/// Concurrent fan-out of one prompt to N backends.
///
/// Each backend runs as an independent, independently-cancellable task with
/// its own accumulation buffer. `cancel` stops all of them; text already
/// accumulated is returned as-is.
pub struct ParallelExecutor {
    cancel: CancellationToken,
}

impl Default for ParallelExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ParallelExecutor {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// Tie the executor's lifetime to an external token (the orchestrator
    /// links it to the exchange, so cancelling the exchange cancels the
    /// whole fan-out).
    pub fn with_token(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn execute(
        &self,
        backends: Vec<(String, Arc<dyn ChatBackend>)>,
        text: &str,
        base_config: &GenerationConfig,
        history: &[ChatMessage],
        delta_tx: mpsc::UnboundedSender<ParallelDelta>,
    ) -> BTreeMap<String, ProviderOutcome> {
        let mut tasks = Vec::with_capacity(backends.len());

        for (provider, backend) in backends {
            let request = StreamRequest {
                text: text.to_string(),
                config: GenerationConfig {
                    provider: provider.clone(),
                    ..base_config.clone()
                },
                history: history.to_vec(),
            };
            let delta_tx = delta_tx.clone();
            let cancel = self.cancel.child_token();

            tasks.push(tokio::spawn(async move {
                let (event_tx, mut event_rx) = mpsc::unbounded_channel();
                let sink = StreamEventSink::new(event_tx, 0, cancel);
                let (done_tx, done_rx) = oneshot::channel();

                tokio::spawn(async move {
                    let result = backend.stream_message(request, sink).await;
                    let _ = done_tx.send(result);
                });

                let mut accumulated = String::new();
                while let Some((event, _)) = event_rx.recv().await {
                    if let StreamEvent::Chunk(content) = event {
                        accumulated.push_str(&content);
                        let _ = delta_tx.send(ParallelDelta {
                            provider: provider.clone(),
                            content,
                        });
                    }
                }

                let outcome = match done_rx.await {
                    Ok(Ok(())) => ProviderOutcome::Success(accumulated),
                    Ok(Err(e)) => ProviderOutcome::Failure(e.to_string()),
                    Err(_) => ProviderOutcome::Failure("backend task aborted".to_string()),
                };
                debug!(provider = %provider, success = outcome.is_success(), "parallel backend finished");
                (provider, outcome)
            }));
        }
        drop(delta_tx);

        let mut outcomes = BTreeMap::new();
        for joined in join_all(tasks).await {
            if let Ok((provider, outcome)) = joined {
                outcomes.insert(provider, outcome);
            }
        }
        outcomes
    }
}
