use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use super::{ConversationStore, MessageCursor, MessagePage, StoreError};
use crate::core::message::Message;

/// In-memory reference store. Used by tests and by embedders that do their
/// own persistence elsewhere.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    conversations: Mutex<HashMap<Uuid, Vec<Message>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one conversation in `(timestamp, id)` order.
    pub fn conversation(&self, conversation_id: Uuid) -> Vec<Message> {
        let guard = self.conversations.lock().expect("store poisoned");
        guard.get(&conversation_id).cloned().unwrap_or_default()
    }

    pub fn message_count(&self, conversation_id: Uuid) -> usize {
        let guard = self.conversations.lock().expect("store poisoned");
        guard.get(&conversation_id).map(Vec::len).unwrap_or(0)
    }

    fn sort_key(message: &Message) -> (chrono::DateTime<chrono::Utc>, Uuid) {
        (message.timestamp, message.id)
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn load_messages(
        &self,
        conversation_id: Uuid,
        cursor: Option<MessageCursor>,
        limit: usize,
    ) -> Result<MessagePage, StoreError> {
        let guard = self.conversations.lock().expect("store poisoned");
        let all = guard.get(&conversation_id).cloned().unwrap_or_default();

        let start = match cursor {
            Some(cursor) => all
                .iter()
                .position(|m| Self::sort_key(m) > (cursor.timestamp, cursor.id))
                .unwrap_or(all.len()),
            None => 0,
        };

        let end = (start + limit).min(all.len());
        let messages: Vec<Message> = all[start..end].to_vec();
        let has_more = end < all.len();
        let next_cursor = if has_more {
            messages.last().map(MessageCursor::for_message)
        } else {
            None
        };

        Ok(MessagePage {
            messages,
            has_more,
            next_cursor,
        })
    }

    async fn save_message(&self, message: &Message) -> Result<(), StoreError> {
        let mut guard = self.conversations.lock().expect("store poisoned");
        let entries = guard.entry(message.conversation_id).or_default();
        entries.push(message.clone());
        entries.sort_by_key(Self::sort_key);
        Ok(())
    }

    async fn delete_message(&self, id: Uuid) -> Result<(), StoreError> {
        let mut guard = self.conversations.lock().expect("store poisoned");
        for entries in guard.values_mut() {
            if let Some(index) = entries.iter().position(|m| m.id == id) {
                entries.remove(index);
                return Ok(());
            }
        }
        Err(StoreError::NotFound(id))
    }
}
