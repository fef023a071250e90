use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use readsync_core::{AggregateId, EventId, ExpectedVersion};
use readsync_events::{EventRecord, NewEvent};

/// Result of appending a batch of records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Records persisted by this call, in append order.
    pub committed: Vec<EventRecord>,
    /// Ids already present in the store (client retries); nothing was written for them.
    pub duplicates: Vec<EventId>,
}

impl AppendOutcome {
    pub fn is_noop(&self) -> bool {
        self.committed.is_empty()
    }
}

/// Event store operation error.
///
/// These are **infrastructure errors** (durability, sequencing) as opposed to
/// mapping errors raised by projections.
///
/// ## Error Categories
///
/// - **Storage**: backend unavailable or timed out (retryable with backoff)
/// - **Concurrency**: sequence conflict on append (retryable after refetching the head)
/// - **InvalidAppend**: the batch itself is malformed (not retryable)
/// - **Publish**: publication failed *after* a successful append; the records are
///   durable and stay queued for republication
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("event store unavailable: {0}")]
    Storage(String),

    #[error("sequence conflict on aggregate '{aggregate_id}': expected {expected}, found {found}")]
    Concurrency {
        aggregate_id: AggregateId,
        expected: u64,
        found: u64,
    },

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("event publication failed: {0}")]
    Publish(String),
}

impl EventStoreError {
    /// Whether repeating the same call (after backoff or refetch) can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Concurrency { .. })
    }
}

/// Append-only, per-aggregate event store.
///
/// ## Event Streams
///
/// Records are organized into **streams**, one per `aggregate_id`. Within a
/// stream, records carry strictly increasing sequence numbers (1, 2, 3, ...).
///
/// ## Append Semantics
///
/// `append()`:
/// - Validates caller-supplied sequences against the stream head (`head + 1`, no gaps)
/// - Skips records whose `id` is already stored (client retry) without a second effect
/// - Persists the whole batch atomically (all or nothing)
/// - Surfaces sequence conflicts as [`EventStoreError::Concurrency`], never reorders
///
/// `append_new()` assigns sequences itself, guarded by an [`ExpectedVersion`].
///
/// ## Implementation Requirements
///
/// Implementations must:
/// - serialize appends to the same aggregate
/// - let appends to different aggregates proceed independently
/// - never mutate or remove stored records
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append already-sequenced records (may span several aggregates).
    async fn append(&self, events: Vec<EventRecord>) -> Result<AppendOutcome, EventStoreError>;

    /// Append events to one aggregate stream, assigning `head + 1, head + 2, ...`.
    async fn append_new(
        &self,
        events: Vec<NewEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<AppendOutcome, EventStoreError>;

    /// Load one stream in sequence order (empty if the aggregate has no events).
    async fn load_stream(&self, aggregate_id: &AggregateId)
    -> Result<Vec<EventRecord>, EventStoreError>;

    /// Load every stream, each in sequence order (rebuild support).
    async fn load_all(&self) -> Result<Vec<EventRecord>, EventStoreError>;

    /// Highest committed sequence of a stream (0 for an empty stream).
    async fn head(&self, aggregate_id: &AggregateId) -> Result<u64, EventStoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn append(&self, events: Vec<EventRecord>) -> Result<AppendOutcome, EventStoreError> {
        (**self).append(events).await
    }

    async fn append_new(
        &self,
        events: Vec<NewEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<AppendOutcome, EventStoreError> {
        (**self).append_new(events, expected_version).await
    }

    async fn load_stream(
        &self,
        aggregate_id: &AggregateId,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        (**self).load_stream(aggregate_id).await
    }

    async fn load_all(&self) -> Result<Vec<EventRecord>, EventStoreError> {
        (**self).load_all().await
    }

    async fn head(&self, aggregate_id: &AggregateId) -> Result<u64, EventStoreError> {
        (**self).head(aggregate_id).await
    }
}
