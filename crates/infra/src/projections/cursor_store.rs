//! Projection cursor persistence.
//!
//! A cursor is the highest sequence a projection has applied for one aggregate
//! stream. It enables:
//! - Idempotent projections (redeliveries <= cursor are ignored)
//! - Tombstones: a deleted row keeps its cursor, so a redelivered create cannot
//!   resurrect it
//! - Deterministic rebuilds (clear cursors and replay from scratch)

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use readsync_core::AggregateId;

use crate::read_model::ReadModelError;

/// Cursor store for per-(projection, aggregate) watermarks.
#[async_trait]
pub trait ProjectionCursorStore: Send + Sync {
    /// Last applied sequence for a (projection, aggregate) stream.
    async fn get_cursor(
        &self,
        projection: &str,
        aggregate_id: &AggregateId,
    ) -> Result<Option<u64>, ReadModelError>;

    /// Move the cursor forward to `sequence`. Never moves it backwards; returns the
    /// cursor value after the call.
    async fn advance_cursor(
        &self,
        projection: &str,
        aggregate_id: &AggregateId,
        sequence: u64,
    ) -> Result<u64, ReadModelError>;

    /// Clear all cursors for a projection (for rebuilds).
    async fn clear_cursors(&self, projection: &str) -> Result<(), ReadModelError>;
}

#[derive(Debug, Default)]
pub struct InMemoryCursorStore {
    cursors: RwLock<HashMap<(String, AggregateId), u64>>,
}

impl InMemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> ReadModelError {
    ReadModelError::Storage("cursor store lock poisoned".to_string())
}

#[async_trait]
impl ProjectionCursorStore for InMemoryCursorStore {
    async fn get_cursor(
        &self,
        projection: &str,
        aggregate_id: &AggregateId,
    ) -> Result<Option<u64>, ReadModelError> {
        let cursors = self.cursors.read().map_err(|_| poisoned())?;
        Ok(cursors
            .get(&(projection.to_string(), aggregate_id.clone()))
            .copied())
    }

    async fn advance_cursor(
        &self,
        projection: &str,
        aggregate_id: &AggregateId,
        sequence: u64,
    ) -> Result<u64, ReadModelError> {
        let mut cursors = self.cursors.write().map_err(|_| poisoned())?;
        let cursor = cursors
            .entry((projection.to_string(), aggregate_id.clone()))
            .or_insert(0);
        *cursor = (*cursor).max(sequence);
        Ok(*cursor)
    }

    async fn clear_cursors(&self, projection: &str) -> Result<(), ReadModelError> {
        let mut cursors = self.cursors.write().map_err(|_| poisoned())?;
        cursors.retain(|(name, _), _| name != projection);
        Ok(())
    }
}
