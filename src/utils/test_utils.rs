use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::api::{BackendError, ChatBackend, StreamEvent, StreamEventSink, StreamRequest};
use crate::core::config::OrchestratorConfig;
use crate::core::events::OrchestratorEvent;
use crate::core::memory::{MemoryError, MemoryExtractor, MemoryFact};
use crate::core::orchestrator::{OrchestratorDeps, OrchestratorHandle, StreamOrchestrator};
use crate::storage::memory::InMemoryStore;
use crate::tools::{RetryPolicy, ToolClient, ToolContent, ToolError, ToolOutput};

/// One step of a scripted stream. `Pause` yields real wall-clock time so
/// tests can interleave sends with an in-flight stream.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Chunk(String),
    Thinking(String),
    ToolStart {
        id: String,
        name: String,
        input_json: String,
    },
    ToolDone {
        id: String,
        output: String,
        is_error: bool,
    },
    Pause(Duration),
}

/// Backend that replays a fixed script, honouring cancellation at each step.
/// Requests are recorded so tests can assert on what actually went out.
pub struct ScriptedBackend {
    name: String,
    steps: Vec<ScriptStep>,
    result: Result<(), String>,
    invocations: AtomicU32,
    requests: std::sync::Mutex<Vec<StreamRequest>>,
}

impl ScriptedBackend {
    pub fn new(name: impl Into<String>, steps: Vec<ScriptStep>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            steps,
            result: Ok(()),
            invocations: AtomicU32::new(0),
            requests: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn failing(name: impl Into<String>, steps: Vec<ScriptStep>, error: String) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            steps,
            result: Err(error),
            invocations: AtomicU32::new(0),
            requests: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<StreamRequest> {
        self.requests.lock().expect("requests poisoned").last().cloned()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream_message(
        &self,
        request: StreamRequest,
        sink: StreamEventSink,
    ) -> Result<(), BackendError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .expect("requests poisoned")
            .push(request);
        for step in &self.steps {
            if sink.is_cancelled() {
                return Ok(());
            }
            match step {
                ScriptStep::Chunk(content) => sink.emit(StreamEvent::Chunk(content.clone())),
                ScriptStep::Thinking(status) => {
                    sink.emit(StreamEvent::ThinkingStatus(status.clone()))
                }
                ScriptStep::ToolStart {
                    id,
                    name,
                    input_json,
                } => sink.emit(StreamEvent::ToolCallStarted {
                    id: id.clone(),
                    name: name.clone(),
                    input_json: input_json.clone(),
                }),
                ScriptStep::ToolDone {
                    id,
                    output,
                    is_error,
                } => sink.emit(StreamEvent::ToolCallCompleted {
                    id: id.clone(),
                    output: output.clone(),
                    is_error: *is_error,
                }),
                ScriptStep::Pause(duration) => {
                    tokio::select! {
                        _ = tokio::time::sleep(*duration) => {}
                        _ = sink.cancel_token().cancelled() => return Ok(()),
                    }
                }
            }
        }
        self.result.clone().map_err(BackendError::Api)
    }
}

pub fn scripted_backend(chunks: Vec<&str>) -> Arc<ScriptedBackend> {
    ScriptedBackend::new(
        "scripted",
        chunks
            .into_iter()
            .map(|c| ScriptStep::Chunk(c.to_string()))
            .collect(),
    )
}

pub fn failing_backend(error: BackendError) -> Arc<ScriptedBackend> {
    ScriptedBackend::failing("failing", Vec::new(), error.to_string())
}

/// Backend that never emits and only returns once cancelled.
pub fn hanging_backend() -> Arc<ScriptedBackend> {
    ScriptedBackend::new(
        "hanging",
        vec![ScriptStep::Pause(Duration::from_secs(3600))],
    )
}

/// Tool client that fails transiently a fixed number of times, then
/// succeeds.
pub struct FlakyToolClient {
    pub failures_before_success: u32,
    pub calls: AtomicU32,
}

impl FlakyToolClient {
    pub fn new(failures_before_success: u32) -> Arc<Self> {
        Arc::new(Self {
            failures_before_success,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl ToolClient for FlakyToolClient {
    async fn execute_tool(
        &self,
        name: &str,
        _arguments: &Map<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures_before_success {
            return Err(ToolError::Transient("connection reset".to_string()));
        }
        Ok(ToolOutput {
            content: vec![ToolContent::text(format!("{name} result"))],
            is_error: false,
        })
    }
}

/// Memory extractor that always fails; completion must shrug it off.
pub struct FailingMemoryExtractor;

#[async_trait]
impl MemoryExtractor for FailingMemoryExtractor {
    async fn extract(
        &self,
        _conversation_id: Uuid,
        _user_text: &str,
        _assistant_text: &str,
    ) -> Result<Vec<MemoryFact>, MemoryError> {
        Err(MemoryError::Extraction("model unavailable".to_string()))
    }
}

pub struct EchoMemoryExtractor;

#[async_trait]
impl MemoryExtractor for EchoMemoryExtractor {
    async fn extract(
        &self,
        _conversation_id: Uuid,
        user_text: &str,
        _assistant_text: &str,
    ) -> Result<Vec<MemoryFact>, MemoryError> {
        Ok(vec![MemoryFact {
            content: format!("user said: {user_text}"),
            category: None,
        }])
    }
}

pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        provider: "test".to_string(),
        model: "test-model".to_string(),
        retry: RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            multiplier: 2,
        },
        ..OrchestratorConfig::default()
    }
}

pub fn test_deps(backend: Arc<dyn ChatBackend>) -> (OrchestratorDeps, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let mut backends: BTreeMap<String, Arc<dyn ChatBackend>> = BTreeMap::new();
    backends.insert("test".to_string(), backend);
    (
        OrchestratorDeps {
            backends,
            store: store.clone(),
            tools: None,
            memory: None,
        },
        store,
    )
}

pub fn spawn_test_orchestrator(
    backend: Arc<dyn ChatBackend>,
) -> (OrchestratorHandle, Arc<InMemoryStore>) {
    let (deps, store) = test_deps(backend);
    let handle = StreamOrchestrator::spawn(deps, test_config()).expect("spawn orchestrator");
    (handle, store)
}

/// Block (with a generous timeout) until the bus yields an event matching
/// the predicate.
pub async fn wait_for_event(
    rx: &mut broadcast::Receiver<OrchestratorEvent>,
    pred: impl Fn(&OrchestratorEvent) -> bool,
) -> OrchestratorEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
