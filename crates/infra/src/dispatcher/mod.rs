//! At-least-once event dispatch.
//!
//! The [`Dispatcher`] routes a committed event to every handler registered for
//! its event type. Each handler is isolated:
//! - transient failures are retried with backoff, up to the [`RetryPolicy`] bound
//! - permanent failures (and exhausted retries) become [`DeadLetter`]s
//! - deferrals are parked per (handler, aggregate) and released, in sequence
//!   order, once the handler accepts the missing predecessor
//!
//! Per-aggregate ordering comes from the caller: the lane workers in
//! [`crate::workers`] feed one aggregate's events to `dispatch` one at a time.

pub mod dead_letter;
pub mod retry;

pub use dead_letter::{DeadLetter, DeadLetterError, DeadLetterStore, InMemoryDeadLetterStore};
pub use retry::{BackoffStrategy, RetryPolicy};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error, instrument, warn};

use readsync_core::{AggregateId, EventId};
use readsync_events::EventRecord;

use crate::handler::{Disposition, EventHandler};

/// What happened to one (event, handler) delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Delivered { attempts: u32 },
    /// Parked until the handler has applied the missing predecessor.
    Deferred,
    /// Given up on; recorded as a dead letter.
    Failed { attempts: u32, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub handler: String,
    pub event_id: EventId,
    pub sequence: u64,
    pub delivery: Delivery,
}

/// Outcome of dispatching one event, including parked events it released.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub deliveries: Vec<DeliveryReport>,
}

impl DispatchReport {
    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    pub fn delivered(&self) -> usize {
        self.count(|d| matches!(d, Delivery::Delivered { .. }))
    }

    pub fn deferred(&self) -> usize {
        self.count(|d| matches!(d, Delivery::Deferred))
    }

    pub fn failed(&self) -> usize {
        self.count(|d| matches!(d, Delivery::Failed { .. }))
    }

    fn count(&self, pred: impl Fn(&Delivery) -> bool) -> usize {
        self.deliveries.iter().filter(|r| pred(&r.delivery)).count()
    }
}

type ParkingKey = (String, AggregateId);

pub struct Dispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
    routes: HashMap<String, Vec<usize>>,
    retry: RetryPolicy,
    dead_letters: Arc<dyn DeadLetterStore>,
    parked: Mutex<HashMap<ParkingKey, BTreeMap<u64, EventRecord>>>,
}

impl Dispatcher {
    pub fn new(dead_letters: Arc<dyn DeadLetterStore>) -> Self {
        Self {
            handlers: Vec::new(),
            routes: HashMap::new(),
            retry: RetryPolicy::default(),
            dead_letters,
            parked: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Register `handler` for every event type it declares.
    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        let idx = self.handlers.len();
        for event_type in handler.event_types() {
            self.routes.entry((*event_type).to_string()).or_default().push(idx);
        }
        self.handlers.push(handler);
    }

    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.register(handler);
        self
    }

    /// Names of the handlers registered for `event_type`, in delivery order.
    pub fn handlers_for(&self, event_type: &str) -> Vec<&str> {
        self.routes
            .get(event_type)
            .map(|idxs| idxs.iter().map(|&i| self.handlers[i].name()).collect())
            .unwrap_or_default()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn dead_letters(&self) -> &Arc<dyn DeadLetterStore> {
        &self.dead_letters
    }

    /// Deliver `record` to every handler registered for its event type.
    ///
    /// Never fails: every handler's result is captured in the report, and failed
    /// deliveries are dead-lettered.
    #[instrument(skip(self, record), fields(event_id = %record.id(), event_type = record.event_type(), sequence = record.sequence()))]
    pub async fn dispatch(&self, record: &EventRecord) -> DispatchReport {
        let mut report = DispatchReport::default();

        let Some(targets) = self.routes.get(record.event_type()) else {
            debug!("no handlers registered");
            return report;
        };

        for &idx in targets {
            let handler = &self.handlers[idx];
            let delivery = self.deliver(handler.as_ref(), record).await;
            let delivered = matches!(delivery, Delivery::Delivered { .. });
            report.deliveries.push(DeliveryReport {
                handler: handler.name().to_string(),
                event_id: record.id(),
                sequence: record.sequence(),
                delivery,
            });

            if delivered {
                self.release_parked(handler.as_ref(), record.aggregate_id(), &mut report)
                    .await;
            }
        }

        report
    }

    /// Re-attempt parked successors of an aggregate, lowest sequence first,
    /// until one is deferred again.
    async fn release_parked(
        &self,
        handler: &dyn EventHandler,
        aggregate_id: &AggregateId,
        report: &mut DispatchReport,
    ) {
        while let Some(next) = self.unpark_first(handler.name(), aggregate_id) {
            let delivery = self.deliver(handler, &next).await;
            let deferred = delivery == Delivery::Deferred;
            report.deliveries.push(DeliveryReport {
                handler: handler.name().to_string(),
                event_id: next.id(),
                sequence: next.sequence(),
                delivery,
            });
            if deferred {
                break;
            }
        }
    }

    async fn deliver(&self, handler: &dyn EventHandler, record: &EventRecord) -> Delivery {
        let mut retries = 0;

        loop {
            let err = match handler.handle(record).await {
                Ok(()) => return Delivery::Delivered { attempts: retries + 1 },
                Err(err) => err,
            };

            match err.disposition() {
                Disposition::Defer => {
                    debug!(handler = handler.name(), event_id = %record.id(), stage = %err.stage(), reason = %err, "delivery deferred");
                    if self.park(handler.name(), record.clone()) {
                        return Delivery::Deferred;
                    }
                    let attempts = retries + 1;
                    let reason = format!("{err}; parking lot unavailable");
                    self.dead_letter(handler.name(), record, &reason, attempts).await;
                    return Delivery::Failed { attempts, reason };
                }
                Disposition::Retry if self.retry.should_retry(retries) => {
                    retries += 1;
                    let delay = self.retry.delay_for_attempt(retries);
                    warn!(
                        handler = handler.name(),
                        event_id = %record.id(),
                        attempt = retries,
                        stage = %err.stage(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "handler failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Disposition::Retry | Disposition::Poison => {
                    let attempts = retries + 1;
                    let reason = err.to_string();
                    self.dead_letter(handler.name(), record, &reason, attempts).await;
                    return Delivery::Failed { attempts, reason };
                }
            }
        }
    }

    async fn dead_letter(&self, handler: &str, record: &EventRecord, reason: &str, attempts: u32) {
        error!(
            handler,
            event_id = %record.id(),
            aggregate_id = %record.aggregate_id(),
            sequence = record.sequence(),
            attempts,
            reason,
            "delivery failed; dead-lettering"
        );
        let letter = DeadLetter::new(record.clone(), handler, reason, attempts);
        if let Err(err) = self.dead_letters.record(letter).await {
            error!(handler, event_id = %record.id(), error = %err, "failed to record dead letter");
        }
    }

    /// Park `record`; `false` if the parking lot is unusable.
    fn park(&self, handler: &str, record: EventRecord) -> bool {
        let Ok(mut parked) = self.parked.lock() else {
            error!(handler, event_id = %record.id(), "parking lot poisoned");
            return false;
        };
        parked
            .entry((handler.to_string(), record.aggregate_id().clone()))
            .or_default()
            .insert(record.sequence(), record);
        true
    }

    fn unpark_first(&self, handler: &str, aggregate_id: &AggregateId) -> Option<EventRecord> {
        let mut parked = self.parked.lock().ok()?;
        let key = (handler.to_string(), aggregate_id.clone());
        let queue = parked.get_mut(&key)?;
        let next = queue.pop_first().map(|(_, record)| record);
        if queue.is_empty() {
            parked.remove(&key);
        }
        next
    }

    /// Number of events currently parked across all handlers.
    pub fn parked_count(&self) -> usize {
        self.parked
            .lock()
            .map(|parked| parked.values().map(BTreeMap::len).sum())
            .unwrap_or(0)
    }

    /// Dead-letter everything still parked (their predecessors never arrived).
    ///
    /// Called on shutdown so deferred events are reported rather than lost.
    pub async fn flush_parked(&self) -> usize {
        // Each park/unpark leaves the map consistent, so a poisoned lot is still drained.
        let drained: Vec<(String, EventRecord)> = self
            .parked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .flat_map(|((handler, _), queue)| {
                queue.into_values().map(move |record| (handler.clone(), record))
            })
            .collect();

        for (handler, record) in &drained {
            self.dead_letter(handler, record, "predecessor never delivered", 0)
                .await;
        }
        drained.len()
    }
}

impl core::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.handlers.iter().map(|h| h.name()).collect::<Vec<_>>())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
