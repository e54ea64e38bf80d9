//! Recent messages per room, served by `getMessages`.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;

use crate::gateway::protocol::ChatMessage;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    #[error("history unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait HistoryStore: Send + Sync + 'static {
    async fn append(&self, room: &str, message: ChatMessage) -> Result<(), HistoryError>;

    /// Oldest first.
    async fn range(&self, room: &str) -> Result<Vec<ChatMessage>, HistoryError>;
}

/// Bounded ring per room; the oldest line falls off when a room is full.
pub struct MemoryHistory {
    capacity: usize,
    rooms: DashMap<String, VecDeque<ChatMessage>>,
}

impl MemoryHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rooms: DashMap::new(),
        }
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn append(&self, room: &str, message: ChatMessage) -> Result<(), HistoryError> {
        let mut ring = self.rooms.entry(room.to_string()).or_default();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(message);
        Ok(())
    }

    async fn range(&self, room: &str) -> Result<Vec<ChatMessage>, HistoryError> {
        Ok(self
            .rooms
            .get(room)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default())
    }
}

/// Stand-in when history is switched off.
pub struct NoHistory;

#[async_trait]
impl HistoryStore for NoHistory {
    async fn append(&self, _room: &str, _message: ChatMessage) -> Result<(), HistoryError> {
        Ok(())
    }

    async fn range(&self, _room: &str) -> Result<Vec<ChatMessage>, HistoryError> {
        Ok(Vec::new())
    }
}
