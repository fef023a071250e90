//! Append-only event store boundary.
//!
//! This module defines the storage-facing abstraction for committed event
//! streams without making any storage assumptions.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use r#trait::{AppendOutcome, EventStore, EventStoreError};

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use readsync_core::{AggregateId, ExpectedVersion};
use readsync_events::{EventPublisher, EventRecord, NewEvent};

/// Adapter that publishes committed records after a successful append.
///
/// Ordering invariants:
/// - **publish happens only after append succeeds**
/// - per aggregate, records are published in commit order: append and publish
///   run under one lock per touched aggregate
///
/// Records whose publication fails stay in an outbox and are published, ahead of
/// anything newer, by the next append touching the same aggregate (a retried
/// append included) or by [`PublishingEventStore::flush`]. Duplicates reported by
/// the inner store are not published a second time.
pub struct PublishingEventStore<S, P> {
    store: S,
    publisher: P,
    outbox: Outbox,
}

#[derive(Default)]
struct Outbox {
    locks: Mutex<HashMap<AggregateId, Arc<AsyncMutex<()>>>>,
    pending: Mutex<HashMap<AggregateId, VecDeque<EventRecord>>>,
}

fn poisoned() -> EventStoreError {
    EventStoreError::Storage("outbox lock poisoned".to_string())
}

impl Outbox {
    /// Acquire the locks of `ids` (sorted, deduplicated) in order.
    async fn lock(&self, ids: &[AggregateId]) -> Result<Vec<OwnedMutexGuard<()>>, EventStoreError> {
        let handles: Vec<Arc<AsyncMutex<()>>> = {
            let mut locks = self.locks.lock().map_err(|_| poisoned())?;
            ids.iter()
                .map(|id| locks.entry(id.clone()).or_default().clone())
                .collect()
        };

        let mut guards = Vec::with_capacity(handles.len());
        for handle in handles {
            guards.push(handle.lock_owned().await);
        }
        Ok(guards)
    }

    fn release(&self, guards: Vec<OwnedMutexGuard<()>>) {
        drop(guards);
        if let Ok(mut locks) = self.locks.lock() {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
    }

    fn take(&self, ids: &[AggregateId]) -> Result<VecDeque<EventRecord>, EventStoreError> {
        let mut pending = self.pending.lock().map_err(|_| poisoned())?;
        Ok(ids.iter().filter_map(|id| pending.remove(id)).flatten().collect())
    }

    fn park(&self, records: VecDeque<EventRecord>) -> Result<(), EventStoreError> {
        let mut pending = self.pending.lock().map_err(|_| poisoned())?;
        for record in records {
            pending
                .entry(record.aggregate_id().clone())
                .or_default()
                .push_back(record);
        }
        Ok(())
    }

    fn pending_ids(&self) -> Result<Vec<AggregateId>, EventStoreError> {
        let pending = self.pending.lock().map_err(|_| poisoned())?;
        let mut ids: Vec<AggregateId> = pending.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn pending_len(&self) -> usize {
        self.pending
            .lock()
            .map(|pending| pending.values().map(VecDeque::len).sum())
            .unwrap_or(0)
    }
}

fn sorted_ids<'a>(ids: impl Iterator<Item = &'a AggregateId>) -> Vec<AggregateId> {
    let mut ids: Vec<AggregateId> = ids.cloned().collect();
    ids.sort();
    ids.dedup();
    ids
}

impl<S, P> PublishingEventStore<S, P> {
    pub fn new(store: S, publisher: P) -> Self {
        Self {
            store,
            publisher,
            outbox: Outbox::default(),
        }
    }

    /// Committed records still waiting for publication.
    pub fn unpublished(&self) -> usize {
        self.outbox.pending_len()
    }
}

impl<S, P> PublishingEventStore<S, P>
where
    S: EventStore,
    P: EventPublisher,
{
    /// Publish the outbox of `ids`, then `committed`. Caller holds the locks of `ids`.
    async fn publish_in_order(
        &self,
        ids: &[AggregateId],
        committed: &[EventRecord],
    ) -> Result<(), EventStoreError> {
        let mut queue = self.outbox.take(ids)?;
        if !queue.is_empty() {
            debug!(pending = queue.len(), "republishing outbox");
        }
        queue.extend(committed.iter().cloned());

        while let Some(record) = queue.pop_front() {
            if let Err(err) = self.publisher.publish(record.clone()).await {
                warn!(event_id = %record.id(), error = %err, unpublished = queue.len() + 1, "publication failed after append");
                queue.push_front(record);
                self.outbox.park(queue)?;
                return Err(EventStoreError::Publish(err.to_string()));
            }
        }
        Ok(())
    }

    /// Publish every record left in the outbox by earlier publication failures.
    pub async fn flush(&self) -> Result<(), EventStoreError> {
        let ids = self.outbox.pending_ids()?;
        if ids.is_empty() {
            return Ok(());
        }

        let guards = self.outbox.lock(&ids).await?;
        let result = self.publish_in_order(&ids, &[]).await;
        self.outbox.release(guards);
        result
    }
}

#[async_trait]
impl<S, P> EventStore for PublishingEventStore<S, P>
where
    S: EventStore,
    P: EventPublisher,
{
    async fn append(&self, events: Vec<EventRecord>) -> Result<AppendOutcome, EventStoreError> {
        let ids = sorted_ids(events.iter().map(|e| e.aggregate_id()));
        let guards = self.outbox.lock(&ids).await?;

        // 1) Append (durable step), 2) publish, both under the aggregate locks
        let result = match self.store.append(events).await {
            Ok(outcome) => self
                .publish_in_order(&ids, &outcome.committed)
                .await
                .map(|()| outcome),
            Err(err) => Err(err),
        };

        self.outbox.release(guards);
        result
    }

    async fn append_new(
        &self,
        events: Vec<NewEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<AppendOutcome, EventStoreError> {
        let ids = sorted_ids(events.iter().map(|e| &e.aggregate_id));
        let guards = self.outbox.lock(&ids).await?;

        let result = match self.store.append_new(events, expected_version).await {
            Ok(outcome) => self
                .publish_in_order(&ids, &outcome.committed)
                .await
                .map(|()| outcome),
            Err(err) => Err(err),
        };

        self.outbox.release(guards);
        result
    }

    async fn load_stream(
        &self,
        aggregate_id: &AggregateId,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        self.store.load_stream(aggregate_id).await
    }

    async fn load_all(&self) -> Result<Vec<EventRecord>, EventStoreError> {
        self.store.load_all().await
    }

    async fn head(&self, aggregate_id: &AggregateId) -> Result<u64, EventStoreError> {
        self.store.head(aggregate_id).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use readsync_core::EventId;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        published: Mutex<Vec<EventRecord>>,
    }

    #[async_trait]
    impl EventPublisher for Recorder {
        type Error = String;

        async fn publish(&self, record: EventRecord) -> Result<(), Self::Error> {
            self.published.lock().unwrap().push(record);
            Ok(())
        }
    }

    struct Closed;

    #[async_trait]
    impl EventPublisher for Closed {
        type Error = String;

        async fn publish(&self, _record: EventRecord) -> Result<(), Self::Error> {
            Err("closed".to_string())
        }
    }

    /// Publisher that can fail at one sequence and stall at another.
    #[derive(Default)]
    struct Flaky {
        published: Mutex<Vec<u64>>,
        fail_at: Mutex<Option<u64>>,
        slow_at: Option<u64>,
    }

    impl Flaky {
        fn failing_at(sequence: u64) -> Self {
            Self {
                fail_at: Mutex::new(Some(sequence)),
                ..Self::default()
            }
        }

        fn heal(&self) {
            *self.fail_at.lock().unwrap() = None;
        }

        fn sequences(&self) -> Vec<u64> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventPublisher for Flaky {
        type Error = String;

        async fn publish(&self, record: EventRecord) -> Result<(), Self::Error> {
            if self.slow_at == Some(record.sequence()) {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
            let failing = *self.fail_at.lock().unwrap() == Some(record.sequence());
            if failing {
                return Err("lane closed".to_string());
            }
            self.published.lock().unwrap().push(record.sequence());
            Ok(())
        }
    }

    fn record(sequence: u64) -> EventRecord {
        EventRecord::new(
            EventId::new(),
            AggregateId::from(1_i64),
            "device",
            "device.updated",
            sequence,
            Utc::now(),
            serde_json::json!({}),
        )
    }

    #[tokio::test]
    async fn publishes_only_committed_records() {
        let recorder = Arc::new(Recorder::default());
        let store = PublishingEventStore::new(InMemoryEventStore::new(), recorder.clone());

        let first = record(1);
        store.append(vec![first.clone()]).await.unwrap();
        store.append(vec![first.clone(), record(2)]).await.unwrap();

        let published = recorder.published.lock().unwrap();
        let seqs: Vec<u64> = published.iter().map(|e| e.sequence()).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn failed_append_publishes_nothing() {
        let recorder = Arc::new(Recorder::default());
        let store = PublishingEventStore::new(InMemoryEventStore::new(), recorder.clone());

        assert!(store.append(vec![record(3)]).await.is_err());
        assert!(recorder.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn publication_failure_keeps_records_durable() {
        let store = PublishingEventStore::new(InMemoryEventStore::new(), Closed);

        let err = store.append(vec![record(1)]).await.unwrap_err();
        assert!(matches!(err, EventStoreError::Publish(_)));
        assert_eq!(store.head(&AggregateId::from(1_i64)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn retried_append_republishes_records_whose_publication_failed() {
        let publisher = Arc::new(Flaky::failing_at(1));
        let store = PublishingEventStore::new(InMemoryEventStore::new(), publisher.clone());
        let first = record(1);

        let err = store.append(vec![first.clone()]).await.unwrap_err();
        assert!(matches!(err, EventStoreError::Publish(_)));
        assert_eq!(store.unpublished(), 1);

        publisher.heal();
        let retry = store.append(vec![first.clone()]).await.unwrap();

        assert_eq!(retry.duplicates, vec![first.id()]);
        assert_eq!(publisher.sequences(), vec![1]);
        assert_eq!(store.unpublished(), 0);
    }

    #[tokio::test]
    async fn failure_mid_batch_keeps_the_rest_for_flush() {
        let publisher = Arc::new(Flaky::failing_at(2));
        let store = PublishingEventStore::new(InMemoryEventStore::new(), publisher.clone());

        assert!(store.append(vec![record(1), record(2), record(3)]).await.is_err());
        assert_eq!(publisher.sequences(), vec![1]);
        assert_eq!(store.unpublished(), 2);

        publisher.heal();
        store.flush().await.unwrap();

        assert_eq!(publisher.sequences(), vec![1, 2, 3]);
        assert_eq!(store.unpublished(), 0);
    }

    #[tokio::test]
    async fn outbox_is_drained_before_newer_records() {
        let publisher = Arc::new(Flaky::failing_at(1));
        let store = PublishingEventStore::new(InMemoryEventStore::new(), publisher.clone());

        assert!(store.append(vec![record(1)]).await.is_err());
        publisher.heal();
        store.append(vec![record(2)]).await.unwrap();

        assert_eq!(publisher.sequences(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_appends_publish_in_commit_order() {
        let publisher = Arc::new(Flaky {
            slow_at: Some(1),
            ..Flaky::default()
        });
        let store = PublishingEventStore::new(InMemoryEventStore::new(), publisher.clone());

        let (first, second) = tokio::join!(store.append(vec![record(1)]), store.append(vec![record(2)]));
        first.unwrap();
        second.unwrap();

        assert_eq!(publisher.sequences(), vec![1, 2]);
    }
}
