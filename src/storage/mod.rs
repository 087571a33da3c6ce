pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::message::Message;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message {0} not found")]
    NotFound(Uuid),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Pagination cursor. `(timestamp, id)` keeps iteration stable under
/// concurrent inserts: a new message with an equal timestamp but a different
/// id never shifts already-served pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCursor {
    pub timestamp: DateTime<Utc>,
    pub id: Uuid,
}

impl MessageCursor {
    pub fn for_message(message: &Message) -> Self {
        Self {
            timestamp: message.timestamp,
            id: message.id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub has_more: bool,
    pub next_cursor: Option<MessageCursor>,
}

/// Persistence seam for conversation transcripts. Implementations own
/// durability; the orchestrator only sequences calls (user message before
/// generation, assistant message after completion, deletes before an edited
/// pair is rewritten).
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn load_messages(
        &self,
        conversation_id: Uuid,
        cursor: Option<MessageCursor>,
        limit: usize,
    ) -> Result<MessagePage, StoreError>;

    async fn save_message(&self, message: &Message) -> Result<(), StoreError>;

    async fn delete_message(&self, id: Uuid) -> Result<(), StoreError>;
}
