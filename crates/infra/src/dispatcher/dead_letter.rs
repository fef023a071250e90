//! Dead letters: deliveries the dispatcher gave up on.

use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use readsync_core::EventId;
use readsync_events::EventRecord;

/// An event one handler could not process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub event: EventRecord,
    pub handler: String,
    pub reason: String,
    /// Delivery attempts made (0 for events parked until shutdown).
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(event: EventRecord, handler: impl Into<String>, reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            event,
            handler: handler.into(),
            reason: reason.into(),
            attempts,
            dead_lettered_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeadLetterError {
    #[error("dead-letter storage error: {0}")]
    Storage(String),
}

/// Storage for failed deliveries awaiting operator intervention.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn record(&self, letter: DeadLetter) -> Result<(), DeadLetterError>;

    async fn list(&self) -> Result<Vec<DeadLetter>, DeadLetterError>;

    /// Remove and return the letter for (event, handler), e.g. to redeliver it.
    async fn take(&self, event_id: EventId, handler: &str) -> Result<Option<DeadLetter>, DeadLetterError>;
}

#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    letters: RwLock<Vec<DeadLetter>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> DeadLetterError {
    DeadLetterError::Storage("lock poisoned".to_string())
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn record(&self, letter: DeadLetter) -> Result<(), DeadLetterError> {
        let mut letters = self.letters.write().map_err(|_| poisoned())?;
        // Redelivered failures replace the earlier letter for the same (event, handler).
        letters.retain(|l| !(l.event.id() == letter.event.id() && l.handler == letter.handler));
        letters.push(letter);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DeadLetter>, DeadLetterError> {
        Ok(self.letters.read().map_err(|_| poisoned())?.clone())
    }

    async fn take(&self, event_id: EventId, handler: &str) -> Result<Option<DeadLetter>, DeadLetterError> {
        let mut letters = self.letters.write().map_err(|_| poisoned())?;
        let pos = letters
            .iter()
            .position(|l| l.event.id() == event_id && l.handler == handler);
        Ok(pos.map(|idx| letters.remove(idx)))
    }
}
