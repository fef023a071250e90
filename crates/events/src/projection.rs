//! Read-model projection contracts.
//!
//! A projection maps one committed event to one mutation of a denormalized read
//! model. The mapping is **pure**: it never touches storage. Applying the mutation
//! (and guarding it against duplicates and stale redeliveries) is the job of the
//! infrastructure-side synchronizer.

use std::sync::Arc;

use thiserror::Error;

use crate::EventRecord;

/// A denormalized read model row.
///
/// Every row embeds the sequence of the event that last wrote it. Stores use it to
/// refuse writes that would regress a row to an older state.
pub trait ReadModel: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Sequence of the event that produced this state.
    fn version(&self) -> u64;
}

/// Predicate selecting the read-model rows a mutation applies to.
///
/// The description is carried along for logs and debugging only.
pub struct Filter<M> {
    description: String,
    predicate: Arc<dyn Fn(&M) -> bool + Send + Sync>,
}

impl<M> Filter<M> {
    pub fn new(
        description: impl Into<String>,
        predicate: impl Fn(&M) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            description: description.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn matches(&self, model: &M) -> bool {
        (self.predicate)(model)
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl<M> Clone for Filter<M> {
    fn clone(&self) -> Self {
        Self {
            description: self.description.clone(),
            predicate: Arc::clone(&self.predicate),
        }
    }
}

impl<M> core::fmt::Debug for Filter<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Filter").field(&self.description).finish()
    }
}

/// The read-model change implied by one event.
#[derive(Debug, Clone)]
pub enum Mutation<M> {
    /// Replace the row matching `filter` with `model`, or insert `model` if none match.
    Upsert { model: M, filter: Filter<M> },
    /// Remove every row matching `filter` (zero matches is fine).
    Delete { filter: Filter<M> },
}

/// An event payload could not be turned into a read-model mutation.
///
/// Mapping errors are permanent: redelivering the same event cannot fix them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("failed to decode '{event_type}' payload: {reason}")]
    Decode { event_type: String, reason: String },

    #[error("record is tagged '{record}' but payload decodes as '{payload}'")]
    EventTypeMismatch { record: String, payload: String },

    #[error("payload targets aggregate '{payload}' but record belongs to '{record}'")]
    AggregateMismatch { record: String, payload: String },

    #[error("unsupported event type: {0}")]
    Unsupported(String),
}

/// Maps the events of one aggregate type onto one read model.
///
/// Implementations switch over the aggregate's closed set of event variants and
/// produce the target mutation without side effects.
pub trait Projector: Send + Sync + 'static {
    type Model: ReadModel;

    /// Aggregate type whose streams this projector understands (e.g. "customer").
    fn aggregate_type(&self) -> &'static str;

    /// Event types this projector maps.
    fn event_types(&self) -> &'static [&'static str];

    /// Map a committed event to its read-model mutation.
    fn map(&self, record: &EventRecord) -> Result<Mutation<Self::Model>, MappingError>;
}
