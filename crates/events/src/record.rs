use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use readsync_core::{AggregateId, EventId};

use crate::{Event, MappingError};

/// A committed event, as stored in the event log and delivered to handlers.
///
/// This is the unit the write side hands over to the pipeline.
///
/// Notes:
/// - **Immutable**: fields are private; there are no setters.
/// - **Append-only**: `sequence` is strictly increasing per `aggregate_id`.
/// - `payload` is the JSON form of the typed event named by `event_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    id: EventId,

    aggregate_id: AggregateId,
    aggregate_type: String,

    event_type: String,

    /// Monotonically increasing position in the aggregate stream (starts at 1).
    sequence: u64,

    occurred_at: DateTime<Utc>,

    payload: JsonValue,
}

impl EventRecord {
    pub fn new(
        id: EventId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
        sequence: u64,
        occurred_at: DateTime<Utc>,
        payload: JsonValue,
    ) -> Self {
        Self {
            id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event_type.into(),
            sequence,
            occurred_at,
            payload,
        }
    }

    /// Build a record from a typed event, capturing its type tag and business time.
    pub fn from_typed<E>(
        id: EventId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        sequence: u64,
        event: &E,
    ) -> Result<Self, serde_json::Error>
    where
        E: Event + Serialize,
    {
        let payload = serde_json::to_value(event)?;
        Ok(Self::new(
            id,
            aggregate_id,
            aggregate_type,
            event.event_type(),
            sequence,
            event.occurred_at(),
            payload,
        ))
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    /// Decode the payload back into its typed event.
    ///
    /// Fails with [`MappingError`] when the payload does not deserialize, or when it
    /// deserializes into a variant whose type tag differs from `event_type`.
    pub fn decode<E>(&self) -> Result<E, MappingError>
    where
        E: Event + DeserializeOwned,
    {
        let event: E = serde_json::from_value(self.payload.clone()).map_err(|e| {
            MappingError::Decode {
                event_type: self.event_type.clone(),
                reason: e.to_string(),
            }
        })?;

        if event.event_type() != self.event_type {
            return Err(MappingError::EventTypeMismatch {
                record: self.event_type.clone(),
                payload: event.event_type().to_string(),
            });
        }

        Ok(event)
    }
}

/// An event ready to be appended to a stream (not yet assigned a sequence number).
///
/// The event store assigns `sequence` during `append_new`, starting at the
/// stream head + 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_id: EventId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub event_type: String,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl NewEvent {
    /// Serialize a typed event into an uncommitted event.
    pub fn from_typed<E>(
        event_id: EventId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event: &E,
    ) -> Result<Self, serde_json::Error>
    where
        E: Event + Serialize,
    {
        Ok(Self {
            event_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_string(),
            occurred_at: event.occurred_at(),
            payload: serde_json::to_value(event)?,
        })
    }

    /// Commit this event at the given stream position.
    pub fn into_record(self, sequence: u64) -> EventRecord {
        EventRecord {
            id: self.event_id,
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type,
            event_type: self.event_type,
            sequence,
            occurred_at: self.occurred_at,
            payload: self.payload,
        }
    }
}
