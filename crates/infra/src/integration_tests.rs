//! Integration tests for the full synchronization pipeline.
//!
//! Tests: EventStore → DispatchWorker → Dispatcher → ProjectionHandler → ReadModel + Cache
//!
//! Verifies:
//! - Committed events reach the read models and invalidate the affected cache keys
//! - Duplicate and out-of-order deliveries converge to the in-order state
//! - Failing deliveries are dead-lettered, not dropped

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{NaiveDate, TimeZone, Utc};
    use proptest::prelude::*;
    use serde_json::json;
    use uuid::Uuid;

    use readsync_core::{AggregateId, EventId, ExpectedVersion};
    use readsync_customers::{
        CustomerCreated, CustomerDeleted, CustomerEvent, CustomerQueryModel, CustomerUpdated, Gender,
    };
    use readsync_devices::{DeviceCreated, DeviceDeleted, DeviceEvent, DeviceId, DeviceQueryModel, DeviceUpdated};
    use readsync_events::{EventRecord, NewEvent};

    use crate::cache::{Cache, InMemoryCache, InvalidationPolicy, KeyTemplate};
    use crate::config::SyncConfig;
    use crate::dispatcher::{Dispatcher, InMemoryDeadLetterStore, RetryPolicy};
    use crate::event_store::{EventStore, InMemoryEventStore};
    use crate::handler::EventHandler;
    use crate::pipeline::{InMemoryReadSide, Pipeline};
    use crate::projections::{SequencePolicy, replay};
    use crate::read_model::ReadModelStore;

    fn created_at() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn device_created(id: i64, name: &str) -> DeviceEvent {
        DeviceEvent::DeviceCreated(DeviceCreated {
            id: DeviceId(id),
            name: name.to_string(),
            device_type: Some("Sensor".to_string()),
            created_at: created_at(),
        })
    }

    fn device_updated(id: i64, name: &str) -> DeviceEvent {
        DeviceEvent::DeviceUpdated(DeviceUpdated {
            id: DeviceId(id),
            name: name.to_string(),
            device_type: Some("Sensor".to_string()),
            created_at: created_at(),
            occurred_at: Utc::now(),
        })
    }

    fn device_deleted(id: i64) -> DeviceEvent {
        DeviceEvent::DeviceDeleted(DeviceDeleted {
            id: DeviceId(id),
            occurred_at: Utc::now(),
        })
    }

    fn new_device_event(id: i64, event: &DeviceEvent) -> NewEvent {
        NewEvent::from_typed(EventId::new(), DeviceId(id).into(), readsync_devices::AGGREGATE_TYPE, event).unwrap()
    }

    fn device_record(id: i64, seq: u64, event: &DeviceEvent) -> EventRecord {
        EventRecord::from_typed(EventId::new(), DeviceId(id).into(), readsync_devices::AGGREGATE_TYPE, seq, event).unwrap()
    }

    fn customer_created(id: Uuid, email: &str) -> CustomerEvent {
        CustomerEvent::CustomerCreated(CustomerCreated {
            id,
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            gender: Gender::Female,
            email: email.into(),
            date_of_birth: NaiveDate::from_ymd_opt(1990, 12, 10).unwrap(),
            occurred_at: Utc::now(),
        })
    }

    fn customer_updated(id: Uuid, email: &str, first_name: &str) -> CustomerEvent {
        CustomerEvent::CustomerUpdated(CustomerUpdated {
            id,
            first_name: first_name.into(),
            last_name: "Lovelace".into(),
            gender: Gender::Female,
            email: email.into(),
            date_of_birth: NaiveDate::from_ymd_opt(1990, 12, 10).unwrap(),
            occurred_at: Utc::now(),
        })
    }

    fn customer_deleted(id: Uuid, email: &str) -> CustomerEvent {
        CustomerEvent::CustomerDeleted(CustomerDeleted {
            id,
            email: email.into(),
            occurred_at: Utc::now(),
        })
    }

    fn customer_record(id: Uuid, seq: u64, event: &CustomerEvent) -> EventRecord {
        EventRecord::from_typed(EventId::new(), id.into(), readsync_customers::AGGREGATE_TYPE, seq, event).unwrap()
    }

    fn new_customer_event(id: Uuid, event: &CustomerEvent) -> NewEvent {
        NewEvent::from_typed(EventId::new(), id.into(), readsync_customers::AGGREGATE_TYPE, event).unwrap()
    }

    struct Harness {
        pipeline: Pipeline<Arc<InMemoryEventStore>>,
        events: Arc<InMemoryEventStore>,
        read_side: InMemoryReadSide,
        cache: Arc<InMemoryCache>,
    }

    fn start(config: SyncConfig) -> Harness {
        let events = Arc::new(InMemoryEventStore::new());
        let read_side = InMemoryReadSide::new();
        let cache = Arc::new(InMemoryCache::new().with_default_ttl(config.cache_ttl));
        let dispatcher = read_side.dispatcher(
            &config,
            cache.clone(),
            Dispatcher::new(Arc::new(InMemoryDeadLetterStore::new())),
        );
        let pipeline = Pipeline::start(&config, events.clone(), dispatcher);

        Harness {
            pipeline,
            events,
            read_side,
            cache,
        }
    }

    fn config() -> SyncConfig {
        SyncConfig::default()
            .with_lanes(2)
            .with_retry_policy(RetryPolicy::fixed(1, std::time::Duration::from_millis(5)))
    }

    async fn devices(read_side: &InMemoryReadSide) -> Vec<DeviceQueryModel> {
        read_side.devices.list().await.unwrap()
    }

    #[tokio::test]
    async fn created_device_is_projected_and_cache_invalidated() {
        readsync_observability::init();
        let h = start(config());
        h.cache.set("GetAllDeviceQuery", "[]".into(), None).await.unwrap();
        h.cache.set("GetDeviceByIdQuery_1", "{}".into(), None).await.unwrap();

        h.pipeline
            .store()
            .append_new(
                vec![new_device_event(1, &device_created(1, "Device1"))],
                ExpectedVersion::NoStream,
            )
            .await
            .unwrap();
        let stats = h.pipeline.shutdown().await;

        assert_eq!(stats.events_processed, 1);
        let rows = devices(&h.read_side).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, DeviceId(1));
        assert_eq!(rows[0].name, "Device1");
        assert_eq!(rows[0].device_type.as_deref(), Some("Sensor"));
        assert!(!h.cache.contains("GetAllDeviceQuery"));
        assert!(!h.cache.contains("GetDeviceByIdQuery_1"));
    }

    #[tokio::test]
    async fn update_invalidates_listing_and_by_id_keys() {
        let h = start(config());
        let store = h.pipeline.store();
        store
            .append_new(vec![new_device_event(7, &device_created(7, "A"))], ExpectedVersion::NoStream)
            .await
            .unwrap();
        h.cache.set("GetAllDeviceQuery", "[A]".into(), None).await.unwrap();
        h.cache.set("GetDeviceByIdQuery_7", "A".into(), None).await.unwrap();
        h.cache.set("GetDeviceByIdQuery_8", "other".into(), None).await.unwrap();

        store
            .append_new(vec![new_device_event(7, &device_updated(7, "B"))], ExpectedVersion::Exact(1))
            .await
            .unwrap();
        h.pipeline.shutdown().await;

        assert!(!h.cache.contains("GetAllDeviceQuery"));
        assert!(!h.cache.contains("GetDeviceByIdQuery_7"));
        assert!(h.cache.contains("GetDeviceByIdQuery_8"));
        assert_eq!(devices(&h.read_side).await[0].name, "B");
    }

    #[tokio::test]
    async fn extra_invalidation_keys_are_dropped_with_the_defaults() {
        let config = config();
        let events = Arc::new(InMemoryEventStore::new());
        let read_side = InMemoryReadSide::new().with_invalidation(InvalidationPolicy::new().on(
            DeviceEvent::UPDATED,
            [KeyTemplate::Pattern("GetAllDeviceQuery_page_1".into())],
        ));
        let cache = Arc::new(InMemoryCache::new());
        let dispatcher = read_side.dispatcher(
            &config,
            cache.clone(),
            Dispatcher::new(Arc::new(InMemoryDeadLetterStore::new())),
        );
        let pipeline = Pipeline::start(&config, events, dispatcher);
        cache.set("GetAllDeviceQuery", "[]".into(), None).await.unwrap();
        cache.set("GetAllDeviceQuery_page_1", "[]".into(), None).await.unwrap();

        pipeline
            .store()
            .append_new(
                vec![
                    new_device_event(4, &device_created(4, "A")),
                    new_device_event(4, &device_updated(4, "B")),
                ],
                ExpectedVersion::NoStream,
            )
            .await
            .unwrap();
        pipeline.shutdown().await;

        assert!(!cache.contains("GetAllDeviceQuery"));
        assert!(!cache.contains("GetAllDeviceQuery_page_1"));
    }

    #[tokio::test]
    async fn duplicate_deliveries_leave_a_single_row() {
        let h = start(config());
        let event = new_device_event(1, &device_created(1, "Device1"));

        // A retried append is deduplicated by the store...
        h.pipeline
            .store()
            .append_new(vec![event.clone()], ExpectedVersion::Any)
            .await
            .unwrap();
        let retry = h
            .pipeline
            .store()
            .append_new(vec![event.clone()], ExpectedVersion::Any)
            .await
            .unwrap();
        assert!(retry.is_noop());

        // ...and a redelivered record is absorbed by the projection.
        let committed = h.events.load_stream(&AggregateId::from(1_i64)).await.unwrap();
        h.pipeline.worker().submit(committed[0].clone()).await.unwrap();
        h.pipeline.worker().submit(committed[0].clone()).await.unwrap();
        let stats = h.pipeline.shutdown().await;

        assert_eq!(stats.events_processed, 3);
        assert_eq!(devices(&h.read_side).await.len(), 1);
    }

    #[tokio::test]
    async fn out_of_order_update_converges_under_last_writer_wins() {
        let h = start(config());
        let worker = h.pipeline.worker();

        worker.submit(device_record(1, 2, &device_updated(1, "B"))).await.unwrap();
        worker.submit(device_record(1, 1, &device_created(1, "A"))).await.unwrap();
        h.pipeline.shutdown().await;

        let rows = devices(&h.read_side).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "B");
        assert_eq!(rows[0].version, 2);
    }

    #[tokio::test]
    async fn out_of_order_update_is_deferred_under_contiguous_policy() {
        let h = start(config().with_sequence_policy(SequencePolicy::Contiguous));
        let worker = h.pipeline.worker();

        worker.submit(device_record(1, 2, &device_updated(1, "B"))).await.unwrap();
        worker.submit(device_record(1, 1, &device_created(1, "A"))).await.unwrap();
        let stats = h.pipeline.shutdown().await;

        assert_eq!(stats.deliveries_deferred, 1);
        assert_eq!(stats.parked_dead_lettered, 0);
        let rows = devices(&h.read_side).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "B");
    }

    #[tokio::test]
    async fn delete_by_email_removes_every_matching_row() {
        let h = start(config());
        let store = h.pipeline.store();
        let id = Uuid::from_u128(1);
        let email = "x@y.com";

        store
            .append_new(
                vec![
                    new_customer_event(id, &customer_created(id, email)),
                    new_customer_event(id, &customer_updated(id, email, "Augusta")),
                ],
                ExpectedVersion::NoStream,
            )
            .await
            .unwrap();
        store
            .append_new(
                vec![new_customer_event(
                    id,
                    &CustomerEvent::CustomerDeleted(CustomerDeleted {
                        id,
                        email: email.into(),
                        occurred_at: Utc::now(),
                    }),
                )],
                ExpectedVersion::Exact(2),
            )
            .await
            .unwrap();
        h.pipeline.shutdown().await;

        let remaining = h.read_side.customers.list().await.unwrap();
        assert!(remaining.iter().all(|c| c.email != email));
    }

    #[tokio::test]
    async fn delete_overtaking_an_email_change_still_removes_the_customer() {
        let h = start(config());
        let worker = h.pipeline.worker();
        let id = Uuid::from_u128(2);

        worker.submit(customer_record(id, 1, &customer_created(id, "a@x.com"))).await.unwrap();
        worker.submit(customer_record(id, 3, &customer_deleted(id, "b@x.com"))).await.unwrap();
        worker
            .submit(customer_record(id, 2, &customer_updated(id, "b@x.com", "Augusta")))
            .await
            .unwrap();
        h.pipeline.shutdown().await;

        assert!(h.read_side.customers.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unmappable_event_is_dead_lettered() {
        let h = start(config());
        let record = EventRecord::new(
            EventId::new(),
            AggregateId::from(3_i64),
            readsync_devices::AGGREGATE_TYPE,
            DeviceEvent::CREATED,
            1,
            Utc::now(),
            json!({ "unexpected": true }),
        );

        h.pipeline.store().append(vec![record.clone()]).await.unwrap();
        let dead_letters = h.pipeline.worker().dispatcher().dead_letters().clone();
        let stats = h.pipeline.shutdown().await;

        assert_eq!(stats.deliveries_failed, 1);
        let letters = dead_letters.list().await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].event.id(), record.id());
        assert_eq!(letters[0].handler, "devices");
        assert_eq!(letters[0].attempts, 1);
        assert!(devices(&h.read_side).await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_appends_to_one_stream_conflict_instead_of_reordering() {
        let h = start(config());
        let store = h.pipeline.store();
        store
            .append_new(vec![new_device_event(1, &device_created(1, "A"))], ExpectedVersion::NoStream)
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            store.append_new(vec![new_device_event(1, &device_updated(1, "B"))], ExpectedVersion::Exact(1)),
            store.append_new(vec![new_device_event(1, &device_updated(1, "C"))], ExpectedVersion::Exact(1)),
        );
        h.pipeline.shutdown().await;

        let failures: Vec<_> = [a, b].into_iter().filter_map(Result::err).collect();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].is_retryable());
        assert_eq!(h.events.head(&AggregateId::from(1_i64)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn rebuild_from_the_store_reproduces_the_read_model() {
        let h = start(config());
        h.pipeline
            .store()
            .append_new(
                vec![
                    new_device_event(1, &device_created(1, "A")),
                    new_device_event(1, &device_updated(1, "B")),
                ],
                ExpectedVersion::NoStream,
            )
            .await
            .unwrap();
        h.pipeline
            .store()
            .append_new(vec![new_device_event(2, &device_created(2, "Z"))], ExpectedVersion::NoStream)
            .await
            .unwrap();
        h.pipeline.shutdown().await;
        let before = devices(&h.read_side).await;

        let handler = h.read_side.device_handler(&config(), h.cache.clone());
        handler.synchronizer().reset().await.unwrap();
        assert!(devices(&h.read_side).await.is_empty());

        let progress = replay(h.events.as_ref(), &handler).await.unwrap();

        assert_eq!(progress.processed_events, 3);
        let mut after = devices(&h.read_side).await;
        let mut before = before;
        after.sort_by_key(|d| d.id);
        before.sort_by_key(|d| d.id);
        assert_eq!(after, before);
    }

    /// Canonical stream for device 1: create, `updates` renames, optional delete.
    fn canonical_stream(updates: usize, delete: bool) -> Vec<EventRecord> {
        let mut events = vec![device_record(1, 1, &device_created(1, "v1"))];
        for n in 0..updates {
            let seq = n as u64 + 2;
            events.push(device_record(1, seq, &device_updated(1, &format!("v{seq}"))));
        }
        if delete {
            let seq = events.len() as u64 + 1;
            events.push(device_record(1, seq, &device_deleted(1)));
        }
        events
    }

    /// Delivery order: every event at least once, some redelivered, shuffled.
    fn delivery_order() -> impl Strategy<Value = (usize, bool, Vec<usize>)> {
        (0usize..5, any::<bool>()).prop_flat_map(|(updates, delete)| {
            let len = 1 + updates + usize::from(delete);
            prop::collection::vec(0..len, 0..len * 2).prop_flat_map(move |extra| {
                let mut order: Vec<usize> = (0..len).collect();
                order.extend(extra);
                (Just(updates), Just(delete), Just(order).prop_shuffle())
            })
        })
    }

    async fn final_state(policy: SequencePolicy, deliveries: Vec<EventRecord>) -> Vec<DeviceQueryModel> {
        let config = SyncConfig::default().with_sequence_policy(policy);
        let read_side = InMemoryReadSide::new();
        let cache: Arc<dyn Cache> = Arc::new(InMemoryCache::new());
        let handler: Arc<dyn EventHandler> = Arc::new(read_side.device_handler(&config, cache));
        let dispatcher = Dispatcher::new(Arc::new(InMemoryDeadLetterStore::new()))
            .with_retry_policy(RetryPolicy::no_retry())
            .with_handler(handler);

        for record in &deliveries {
            dispatcher.dispatch(record).await;
        }
        assert_eq!(dispatcher.parked_count(), 0);

        read_side.devices.list().await.unwrap()
    }

    /// Canonical stream for one customer: every update changes the email, and the
    /// delete names the latest one.
    fn canonical_customer_stream(updates: usize, delete: bool) -> Vec<EventRecord> {
        let id = Uuid::from_u128(9);
        let mut events = vec![customer_record(id, 1, &customer_created(id, "v1@x.com"))];
        for n in 0..updates {
            let seq = n as u64 + 2;
            let email = format!("v{seq}@x.com");
            events.push(customer_record(id, seq, &customer_updated(id, &email, "Ada")));
        }
        if delete {
            let seq = events.len() as u64 + 1;
            let email = format!("v{}@x.com", seq - 1);
            events.push(customer_record(id, seq, &customer_deleted(id, &email)));
        }
        events
    }

    async fn final_customer_state(policy: SequencePolicy, deliveries: Vec<EventRecord>) -> Vec<CustomerQueryModel> {
        let config = SyncConfig::default().with_sequence_policy(policy);
        let read_side = InMemoryReadSide::new();
        let cache: Arc<dyn Cache> = Arc::new(InMemoryCache::new());
        let handler: Arc<dyn EventHandler> = Arc::new(read_side.customer_handler(&config, cache));
        let dispatcher = Dispatcher::new(Arc::new(InMemoryDeadLetterStore::new()))
            .with_retry_policy(RetryPolicy::no_retry())
            .with_handler(handler);

        for record in &deliveries {
            dispatcher.dispatch(record).await;
        }
        assert_eq!(dispatcher.parked_count(), 0);

        read_side.customers.list().await.unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn any_redelivery_order_converges_to_the_in_order_state((updates, delete, order) in delivery_order()) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let stream = canonical_stream(updates, delete);
            let shuffled: Vec<EventRecord> = order.iter().map(|&i| stream[i].clone()).collect();

            for policy in [SequencePolicy::LastWriterWins, SequencePolicy::Contiguous] {
                let expected = runtime.block_on(final_state(policy, stream.clone()));
                let actual = runtime.block_on(final_state(policy, shuffled.clone()));
                prop_assert_eq!(actual, expected);
            }
        }

        #[test]
        fn customer_email_changes_converge_in_any_redelivery_order((updates, delete, order) in delivery_order()) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let stream = canonical_customer_stream(updates, delete);
            let shuffled: Vec<EventRecord> = order.iter().map(|&i| stream[i].clone()).collect();

            for policy in [SequencePolicy::LastWriterWins, SequencePolicy::Contiguous] {
                let expected = runtime.block_on(final_customer_state(policy, stream.clone()));
                let actual = runtime.block_on(final_customer_state(policy, shuffled.clone()));
                prop_assert_eq!(actual, expected);
            }
        }
    }
}
