//! Sequence-guarded application of read-model mutations.
//!
//! The synchronizer is the only writer of a projection's rows. Every mutation is
//! checked against the projection cursor for its aggregate:
//! - sequence <= cursor: the row already reflects an equal or later state, no-op
//! - sequence > cursor: apply, then advance the cursor
//!
//! Upserts are additionally guarded by the row's embedded version inside the store,
//! so concurrent writers outside this process cannot regress a row either.

use std::marker::PhantomData;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use readsync_core::AggregateId;
use readsync_events::{Filter, Mutation, ReadModel};

use crate::projections::cursor_store::ProjectionCursorStore;
use crate::read_model::{ReadModelError, ReadModelStore, UpsertOutcome};

/// How the synchronizer treats sequence gaps within one aggregate stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum SequencePolicy {
    /// Apply any event newer than the cursor; older or equal events are no-ops.
    ///
    /// Converges because every upsert carries the full row state.
    #[default]
    LastWriterWins,
    /// Only apply the event immediately following the cursor; later events are
    /// rejected with [`ProjectionError::SequenceGap`] so the caller can defer them.
    Contiguous,
}

impl SequencePolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "last_writer_wins" | "lww" => Some(Self::LastWriterWins),
            "contiguous" => Some(Self::Contiguous),
            _ => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    #[error(transparent)]
    Storage(#[from] ReadModelError),

    #[error("sequence gap for aggregate {aggregate_id}: last applied {last}, got {found}")]
    SequenceGap {
        aggregate_id: AggregateId,
        last: u64,
        found: u64,
    },
}

impl ProjectionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

/// Result of applying one mutation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The mutation changed (or confirmed) the read model.
    Applied,
    /// The read model already reflects `current` >= this event's sequence.
    Superseded { current: u64 },
}

pub struct ProjectionSynchronizer<M, S> {
    name: String,
    store: S,
    cursors: Arc<dyn ProjectionCursorStore>,
    policy: SequencePolicy,
    _model: PhantomData<fn() -> M>,
}

impl<M, S> ProjectionSynchronizer<M, S>
where
    M: ReadModel,
    S: ReadModelStore<M>,
{
    pub fn new(name: impl Into<String>, store: S, cursors: Arc<dyn ProjectionCursorStore>) -> Self {
        Self {
            name: name.into(),
            store,
            cursors,
            policy: SequencePolicy::default(),
            _model: PhantomData,
        }
    }

    pub fn with_policy(mut self, policy: SequencePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> SequencePolicy {
        self.policy
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Replace the row matching `filter` with `model`, or insert it.
    pub async fn upsert(
        &self,
        aggregate_id: &AggregateId,
        sequence: u64,
        model: M,
        filter: Filter<M>,
    ) -> Result<SyncOutcome, ProjectionError> {
        self.apply(aggregate_id, sequence, Mutation::Upsert { model, filter })
            .await
    }

    /// Remove every row matching `filter`; zero matches is not an error.
    pub async fn delete(
        &self,
        aggregate_id: &AggregateId,
        sequence: u64,
        filter: Filter<M>,
    ) -> Result<SyncOutcome, ProjectionError> {
        self.apply(aggregate_id, sequence, Mutation::Delete { filter })
            .await
    }

    /// Apply the mutation produced by the event at `sequence` of `aggregate_id`.
    pub async fn apply(
        &self,
        aggregate_id: &AggregateId,
        sequence: u64,
        mutation: Mutation<M>,
    ) -> Result<SyncOutcome, ProjectionError> {
        let last = self
            .cursors
            .get_cursor(&self.name, aggregate_id)
            .await?
            .unwrap_or(0);

        if sequence <= last {
            debug!(
                projection = %self.name,
                aggregate_id = %aggregate_id,
                sequence,
                current = last,
                "event already reflected; skipping"
            );
            return Ok(SyncOutcome::Superseded { current: last });
        }

        if self.policy == SequencePolicy::Contiguous && sequence != last + 1 {
            return Err(ProjectionError::SequenceGap {
                aggregate_id: aggregate_id.clone(),
                last,
                found: sequence,
            });
        }

        // One atomic store call per mutation. A crash before the cursor advances
        // only causes a redelivery, which the store's version guard absorbs.
        let outcome = match mutation {
            Mutation::Upsert { model, filter } => match self.store.upsert(model, filter).await? {
                UpsertOutcome::Stale { current } => SyncOutcome::Superseded { current },
                UpsertOutcome::Inserted | UpsertOutcome::Replaced => SyncOutcome::Applied,
            },
            Mutation::Delete { filter } => {
                let removed = self.store.delete(filter).await?;
                debug!(projection = %self.name, aggregate_id = %aggregate_id, removed, "rows deleted");
                SyncOutcome::Applied
            }
        };

        self.cursors
            .advance_cursor(&self.name, aggregate_id, sequence)
            .await?;

        Ok(outcome)
    }

    /// Drop every row and cursor of this projection (rebuild support).
    pub async fn reset(&self) -> Result<(), ProjectionError> {
        self.store.clear().await?;
        self.cursors.clear_cursors(&self.name).await?;
        Ok(())
    }
}
