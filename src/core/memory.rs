use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory extraction failed: {0}")]
    Extraction(String),
}

/// A fact worth remembering across conversations, mined from one exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemoryFact {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// Best-effort post-hoc fact extraction.
///
/// The orchestrator runs this on a detached task after each completed
/// exchange and communicates results one-way over the event bus. Failures
/// and latency here must never touch the visible transcript or delay the
/// next send; implementations are free to be slow or flaky.
#[async_trait]
pub trait MemoryExtractor: Send + Sync {
    async fn extract(
        &self,
        conversation_id: Uuid,
        user_text: &str,
        assistant_text: &str,
    ) -> Result<Vec<MemoryFact>, MemoryError>;
}
