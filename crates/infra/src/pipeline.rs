//! End-to-end wiring: event store -> dispatcher lanes -> projection handlers.
//!
//! The pipeline owns its store and worker. `shutdown`/`cancel` consume it, so
//! both are released on every path; dropping a pipeline without calling either
//! lets the lanes drain and exit on their own.

use std::sync::Arc;

use tracing::warn;

use readsync_customers::CustomerQueryModel;
use readsync_devices::DeviceQueryModel;

use crate::cache::{Cache, CacheInvalidator, InvalidationPolicy};
use crate::config::SyncConfig;
use crate::dispatcher::Dispatcher;
use crate::event_store::{EventStore, PublishingEventStore};
use crate::handler::{EventHandler, ProjectionHandler};
use crate::projections::{
    CustomerProjector, DeviceProjector, InMemoryCursorStore, ProjectionCursorStore,
    ProjectionSynchronizer, customers, devices,
};
use crate::read_model::InMemoryReadModelStore;
use crate::workers::{DispatchHandle, DispatchSender, DispatchWorker, WorkerStats};

pub type CustomerHandler =
    ProjectionHandler<CustomerProjector, Arc<InMemoryReadModelStore<CustomerQueryModel>>>;
pub type DeviceHandler = ProjectionHandler<DeviceProjector, Arc<InMemoryReadModelStore<DeviceQueryModel>>>;

/// In-memory read models for the customer and device projections.
#[derive(Debug, Default, Clone)]
pub struct InMemoryReadSide {
    pub customers: Arc<InMemoryReadModelStore<CustomerQueryModel>>,
    pub devices: Arc<InMemoryReadModelStore<DeviceQueryModel>>,
    pub cursors: Arc<InMemoryCursorStore>,
    /// Keys invalidated on top of each projection's default set.
    extra_invalidation: InvalidationPolicy,
}

impl InMemoryReadSide {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invalidate `policy`'s keys in addition to the default listing / by-id keys.
    pub fn with_invalidation(mut self, policy: InvalidationPolicy) -> Self {
        self.extra_invalidation = self.extra_invalidation.merge(policy);
        self
    }

    pub fn customer_handler(&self, config: &SyncConfig, cache: Arc<dyn Cache>) -> CustomerHandler {
        let cursors: Arc<dyn ProjectionCursorStore> = self.cursors.clone();
        ProjectionHandler::new(
            CustomerProjector,
            ProjectionSynchronizer::new(customers::PROJECTION_NAME, self.customers.clone(), cursors)
                .with_policy(config.sequence_policy),
            CacheInvalidator::new(
                cache,
                customers::invalidation_policy().merge(self.extra_invalidation.clone()),
            ),
        )
    }

    pub fn device_handler(&self, config: &SyncConfig, cache: Arc<dyn Cache>) -> DeviceHandler {
        let cursors: Arc<dyn ProjectionCursorStore> = self.cursors.clone();
        ProjectionHandler::new(
            DeviceProjector,
            ProjectionSynchronizer::new(devices::PROJECTION_NAME, self.devices.clone(), cursors)
                .with_policy(config.sequence_policy),
            CacheInvalidator::new(
                cache,
                devices::invalidation_policy().merge(self.extra_invalidation.clone()),
            ),
        )
    }

    /// A dispatcher with both projection handlers registered.
    pub fn dispatcher(&self, config: &SyncConfig, cache: Arc<dyn Cache>, dispatcher: Dispatcher) -> Dispatcher {
        let customers: Arc<dyn EventHandler> = Arc::new(self.customer_handler(config, cache.clone()));
        let devices: Arc<dyn EventHandler> = Arc::new(self.device_handler(config, cache));
        dispatcher.with_handler(customers).with_handler(devices)
    }
}

pub struct Pipeline<S> {
    store: PublishingEventStore<S, DispatchSender>,
    worker: DispatchHandle,
}

impl<S: EventStore> Pipeline<S> {
    /// Start the lanes and route every committed append through them.
    ///
    /// The config's retry policy replaces the dispatcher's. Must be called
    /// within a tokio runtime.
    pub fn start(config: &SyncConfig, store: S, dispatcher: Dispatcher) -> Self {
        let dispatcher = Arc::new(dispatcher.with_retry_policy(config.retry.clone()));
        let worker = DispatchWorker::spawn("dispatcher", dispatcher, config.lanes, config.lane_capacity);
        let store = PublishingEventStore::new(store, worker.sender());
        Self { store, worker }
    }

    /// Append through this store to have events dispatched.
    pub fn store(&self) -> &PublishingEventStore<S, DispatchSender> {
        &self.store
    }

    pub fn worker(&self) -> &DispatchHandle {
        &self.worker
    }

    /// Publish any outbox leftovers, drain queued events, then release the worker
    /// and the store.
    pub async fn shutdown(self) -> WorkerStats {
        let Self { store, worker } = self;
        if let Err(err) = store.flush().await {
            warn!(error = %err, unpublished = store.unpublished(), "outbox not drained before shutdown");
        }
        let stats = worker.shutdown().await;
        drop(store);
        stats
    }

    /// Stop after in-flight events, then release the worker and the store.
    pub async fn cancel(self) -> WorkerStats {
        let Self { store, worker } = self;
        let stats = worker.cancel().await;
        drop(store);
        stats
    }
}
