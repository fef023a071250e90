//! Event handlers: the units the dispatcher delivers events to.
//!
//! [`ProjectionHandler`] is the read-side composition for one aggregate type:
//!
//! `received -> mapped -> projected -> cache-invalidated -> complete`
//!
//! Mapping is pure. Projection goes through the sequence-guarded synchronizer.
//! Invalidation only runs once the read model is updated, and its failure never
//! fails the event.

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use readsync_core::AggregateId;
use readsync_events::{EventRecord, MappingError, Projector};

use crate::cache::{CacheInvalidator, InvalidationReport};
use crate::projections::{ProjectionError, ProjectionSynchronizer, SyncOutcome};
use crate::read_model::{ReadModelError, ReadModelStore};

/// What the dispatcher should do with a failed delivery.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Transient failure: retry with backoff.
    Retry,
    /// A predecessor is missing: park until it has been applied.
    Defer,
    /// Redelivery cannot help: dead-letter immediately.
    Poison,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("mapping failed: {0}")]
    Mapping(#[from] MappingError),

    #[error("projection failed: {0}")]
    Projection(ProjectionError),

    #[error("deferred: aggregate {aggregate_id} last applied {last}, got {found}")]
    Deferred {
        aggregate_id: AggregateId,
        last: u64,
        found: u64,
    },
}

impl HandlerError {
    /// Shorthand for a retryable storage failure.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Projection(ProjectionError::Storage(ReadModelError::Storage(msg.into())))
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Mapping(_) => Disposition::Poison,
            Self::Projection(err) if err.is_retryable() => Disposition::Retry,
            Self::Projection(_) => Disposition::Poison,
            Self::Deferred { .. } => Disposition::Defer,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition() == Disposition::Retry
    }

    /// Last stage the event completed before this error stopped it.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Mapping(_) => Stage::Received,
            Self::Projection(_) | Self::Deferred { .. } => Stage::Mapped,
        }
    }
}

impl From<ProjectionError> for HandlerError {
    fn from(err: ProjectionError) -> Self {
        match err {
            ProjectionError::SequenceGap {
                aggregate_id,
                last,
                found,
            } => Self::Deferred {
                aggregate_id,
                last,
                found,
            },
            other => Self::Projection(other),
        }
    }
}

/// A handler registered with the dispatcher for a set of event types.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable name, used for logs, dead letters and deferral bookkeeping.
    fn name(&self) -> &str;

    fn event_types(&self) -> &[&'static str];

    /// Process one committed event. Must tolerate redelivery.
    async fn handle(&self, record: &EventRecord) -> Result<(), HandlerError>;
}

/// Processing stages of one event inside a [`ProjectionHandler`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Stage {
    Received,
    Mapped,
    Projected,
    CacheInvalidated,
    Complete,
}

impl core::fmt::Display for Stage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Self::Received => "received",
            Self::Mapped => "mapped",
            Self::Projected => "projected",
            Self::CacheInvalidated => "cache_invalidated",
            Self::Complete => "complete",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOutcome {
    pub projection: SyncOutcome,
    pub invalidation: InvalidationReport,
}

pub struct ProjectionHandler<P: Projector, S> {
    projector: P,
    synchronizer: ProjectionSynchronizer<P::Model, S>,
    invalidator: CacheInvalidator,
}

impl<P, S> ProjectionHandler<P, S>
where
    P: Projector,
    S: ReadModelStore<P::Model>,
{
    pub fn new(
        projector: P,
        synchronizer: ProjectionSynchronizer<P::Model, S>,
        invalidator: CacheInvalidator,
    ) -> Self {
        Self {
            projector,
            synchronizer,
            invalidator,
        }
    }

    pub fn synchronizer(&self) -> &ProjectionSynchronizer<P::Model, S> {
        &self.synchronizer
    }

    pub fn invalidator(&self) -> &CacheInvalidator {
        &self.invalidator
    }

    /// Run one event through every stage and report what happened.
    pub async fn process(&self, record: &EventRecord) -> Result<HandlerOutcome, HandlerError> {
        let handler = self.synchronizer.name();

        info!(
            handler,
            event_type = record.event_type(),
            aggregate_id = %record.aggregate_id(),
            sequence = record.sequence(),
            event_model = %record.payload(),
            "triggering event"
        );
        debug!(handler, event_id = %record.id(), stage = %Stage::Received);

        if record.aggregate_type() != self.projector.aggregate_type() {
            return Err(MappingError::Unsupported(format!(
                "{} event on a {} handler",
                record.aggregate_type(),
                self.projector.aggregate_type()
            ))
            .into());
        }

        let mutation = self.projector.map(record).inspect_err(|err| {
            warn!(handler, event_id = %record.id(), error = %err, "event could not be mapped");
        })?;
        debug!(handler, event_id = %record.id(), stage = %Stage::Mapped);

        let projection = self
            .synchronizer
            .apply(record.aggregate_id(), record.sequence(), mutation)
            .await?;
        debug!(handler, event_id = %record.id(), stage = %Stage::Projected, ?projection);

        let invalidation = self.invalidator.invalidate_for(record).await;
        debug!(
            handler,
            event_id = %record.id(),
            stage = %Stage::CacheInvalidated,
            invalidated = invalidation.succeeded()
        );

        debug!(handler, event_id = %record.id(), stage = %Stage::Complete);
        Ok(HandlerOutcome {
            projection,
            invalidation,
        })
    }
}

#[async_trait]
impl<P, S> EventHandler for ProjectionHandler<P, S>
where
    P: Projector,
    S: ReadModelStore<P::Model>,
{
    fn name(&self) -> &str {
        self.synchronizer.name()
    }

    fn event_types(&self) -> &[&'static str] {
        self.projector.event_types()
    }

    async fn handle(&self, record: &EventRecord) -> Result<(), HandlerError> {
        self.process(record).await.map(|_| ())
    }
}
