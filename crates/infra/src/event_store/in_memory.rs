use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::{debug, instrument};

use readsync_core::{AggregateId, EventId, ExpectedVersion};
use readsync_events::{EventRecord, NewEvent};

use super::r#trait::{AppendOutcome, EventStore, EventStoreError};

#[derive(Debug, Default)]
struct Log {
    streams: HashMap<AggregateId, Vec<EventRecord>>,
    ids: HashSet<EventId>,
}

impl Log {
    fn head(&self, aggregate_id: &AggregateId) -> u64 {
        self.streams
            .get(aggregate_id)
            .and_then(|s| s.last())
            .map(|e| e.sequence())
            .unwrap_or(0)
    }

    fn stream_type(&self, aggregate_id: &AggregateId) -> Option<&str> {
        self.streams
            .get(aggregate_id)
            .and_then(|s| s.first())
            .map(|e| e.aggregate_type())
    }

    fn commit(&mut self, records: &[EventRecord]) {
        for e in records {
            self.ids.insert(e.id());
            self.streams
                .entry(e.aggregate_id().clone())
                .or_default()
                .push(e.clone());
        }
    }
}

/// In-memory append-only event store.
///
/// Intended for tests/dev. A batch is validated completely before anything is
/// written, which gives all-or-nothing appends; the write lock serializes
/// appends and is never held across an await point.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    log: RwLock<Log>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> EventStoreError {
        EventStoreError::Storage("lock poisoned".to_string())
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    #[instrument(skip(self, events), fields(batch = events.len()), err)]
    async fn append(&self, events: Vec<EventRecord>) -> Result<AppendOutcome, EventStoreError> {
        if events.is_empty() {
            return Ok(AppendOutcome::default());
        }

        if let Some(idx) = events.iter().position(|e| e.sequence() == 0) {
            return Err(EventStoreError::InvalidAppend(format!(
                "sequence numbers start at 1 (index {idx})"
            )));
        }

        let mut log = self.log.write().map_err(|_| Self::poisoned())?;

        // Pending heads/types for aggregates touched by this batch.
        let mut heads: HashMap<AggregateId, u64> = HashMap::new();
        let mut types: HashMap<AggregateId, String> = HashMap::new();
        let mut batch_ids: HashSet<EventId> = HashSet::new();
        let mut outcome = AppendOutcome::default();

        for e in events {
            if log.ids.contains(&e.id()) || !batch_ids.insert(e.id()) {
                debug!(event_id = %e.id(), "duplicate append ignored");
                outcome.duplicates.push(e.id());
                continue;
            }

            let aggregate_id = e.aggregate_id().clone();

            let known_type = types
                .get(&aggregate_id)
                .map(String::as_str)
                .or_else(|| log.stream_type(&aggregate_id));
            if let Some(known) = known_type {
                if known != e.aggregate_type() {
                    return Err(EventStoreError::InvalidAppend(format!(
                        "stream '{aggregate_id}' has aggregate_type '{known}', attempted append with '{}'",
                        e.aggregate_type()
                    )));
                }
            }

            let head = heads
                .get(&aggregate_id)
                .copied()
                .unwrap_or_else(|| log.head(&aggregate_id));
            let expected = head + 1;
            if e.sequence() != expected {
                return Err(EventStoreError::Concurrency {
                    aggregate_id,
                    expected,
                    found: e.sequence(),
                });
            }

            heads.insert(aggregate_id.clone(), e.sequence());
            types.insert(aggregate_id, e.aggregate_type().to_string());
            outcome.committed.push(e);
        }

        log.commit(&outcome.committed);
        Ok(outcome)
    }

    #[instrument(skip(self, events), fields(batch = events.len(), expected_version = ?expected_version), err)]
    async fn append_new(
        &self,
        events: Vec<NewEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<AppendOutcome, EventStoreError> {
        let Some(first) = events.first() else {
            return Ok(AppendOutcome::default());
        };

        // All events must target the same stream.
        let aggregate_id = first.aggregate_id.clone();
        let aggregate_type = first.aggregate_type.clone();
        for (idx, e) in events.iter().enumerate() {
            if e.aggregate_id != aggregate_id {
                return Err(EventStoreError::InvalidAppend(format!(
                    "batch contains multiple aggregate_ids (index {idx})"
                )));
            }
            if e.aggregate_type != aggregate_type {
                return Err(EventStoreError::InvalidAppend(format!(
                    "batch contains multiple aggregate_types (index {idx})"
                )));
            }
        }

        let mut log = self.log.write().map_err(|_| Self::poisoned())?;

        if let Some(known) = log.stream_type(&aggregate_id) {
            if known != aggregate_type {
                return Err(EventStoreError::InvalidAppend(format!(
                    "stream '{aggregate_id}' has aggregate_type '{known}', attempted append with '{aggregate_type}'"
                )));
            }
        }

        let mut outcome = AppendOutcome::default();
        let mut batch_ids: HashSet<EventId> = HashSet::new();
        let mut fresh = Vec::with_capacity(events.len());
        for e in events {
            if log.ids.contains(&e.event_id) || !batch_ids.insert(e.event_id) {
                outcome.duplicates.push(e.event_id);
            } else {
                fresh.push(e);
            }
        }

        // A pure retry of an already-committed batch succeeds without effect.
        if fresh.is_empty() {
            return Ok(outcome);
        }

        let current = log.head(&aggregate_id);
        if !expected_version.matches(current) {
            let expected = match expected_version {
                ExpectedVersion::Exact(v) => v,
                ExpectedVersion::NoStream | ExpectedVersion::Any => 0,
            };
            return Err(EventStoreError::Concurrency {
                aggregate_id,
                expected,
                found: current,
            });
        }

        // Assign sequence numbers and append (append-only).
        outcome.committed = fresh
            .into_iter()
            .zip(current + 1..)
            .map(|(e, seq)| e.into_record(seq))
            .collect();

        log.commit(&outcome.committed);
        Ok(outcome)
    }

    async fn load_stream(
        &self,
        aggregate_id: &AggregateId,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        let log = self.log.read().map_err(|_| Self::poisoned())?;
        Ok(log.streams.get(aggregate_id).cloned().unwrap_or_default())
    }

    async fn load_all(&self) -> Result<Vec<EventRecord>, EventStoreError> {
        let log = self.log.read().map_err(|_| Self::poisoned())?;

        let mut ids: Vec<&AggregateId> = log.streams.keys().collect();
        ids.sort();

        Ok(ids
            .into_iter()
            .flat_map(|id| log.streams[id].iter().cloned())
            .collect())
    }

    async fn head(&self, aggregate_id: &AggregateId) -> Result<u64, EventStoreError> {
        let log = self.log.read().map_err(|_| Self::poisoned())?;
        Ok(log.head(aggregate_id))
    }
}
