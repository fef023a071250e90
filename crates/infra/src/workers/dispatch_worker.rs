use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use readsync_core::AggregateId;
use readsync_events::{EventPublisher, EventRecord};

use crate::dispatcher::Dispatcher;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatch worker is shut down")]
    Closed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum LaneSignal {
    Run,
    /// Stop accepting events, finish everything queued, then stop.
    Drain,
    /// Finish the in-flight event only.
    Cancel,
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub events_processed: u64,
    pub deliveries_succeeded: u64,
    pub deliveries_deferred: u64,
    pub deliveries_failed: u64,
    /// Queued events dropped by `cancel` (still durable in the event store).
    pub events_abandoned: u64,
    /// Parked events dead-lettered at shutdown.
    pub parked_dead_lettered: u64,
}

#[derive(Debug, Default)]
struct Counters {
    events_processed: AtomicU64,
    deliveries_succeeded: AtomicU64,
    deliveries_deferred: AtomicU64,
    deliveries_failed: AtomicU64,
    events_abandoned: AtomicU64,
    parked_dead_lettered: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            events_processed: self.events_processed.load(Ordering::Relaxed),
            deliveries_succeeded: self.deliveries_succeeded.load(Ordering::Relaxed),
            deliveries_deferred: self.deliveries_deferred.load(Ordering::Relaxed),
            deliveries_failed: self.deliveries_failed.load(Ordering::Relaxed),
            events_abandoned: self.events_abandoned.load(Ordering::Relaxed),
            parked_dead_lettered: self.parked_dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable entry point into the lanes.
///
/// Events of one aggregate always hash to the same lane, so they are dispatched
/// one at a time in submission order.
#[derive(Clone)]
pub struct DispatchSender {
    lanes: Arc<Vec<mpsc::Sender<EventRecord>>>,
}

impl DispatchSender {
    pub fn lane_for(&self, aggregate_id: &AggregateId) -> usize {
        let mut hasher = DefaultHasher::new();
        aggregate_id.hash(&mut hasher);
        (hasher.finish() % self.lanes.len() as u64) as usize
    }

    /// Queue `record` on its aggregate's lane; waits while the lane is full.
    pub async fn submit(&self, record: EventRecord) -> Result<(), DispatchError> {
        let lane = self.lane_for(record.aggregate_id());
        self.lanes[lane]
            .send(record)
            .await
            .map_err(|_| DispatchError::Closed)
    }
}

#[async_trait]
impl EventPublisher for DispatchSender {
    type Error = DispatchError;

    async fn publish(&self, record: EventRecord) -> Result<(), Self::Error> {
        self.submit(record).await
    }
}

/// Handle to control and join the lane tasks.
pub struct DispatchHandle {
    name: String,
    sender: DispatchSender,
    signal: watch::Sender<LaneSignal>,
    joins: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
    dispatcher: Arc<Dispatcher>,
}

impl DispatchHandle {
    pub fn sender(&self) -> DispatchSender {
        self.sender.clone()
    }

    pub async fn submit(&self, record: EventRecord) -> Result<(), DispatchError> {
        self.sender.submit(record).await
    }

    pub fn lanes(&self) -> usize {
        self.joins.len()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    /// Graceful shutdown: stop intake, dispatch everything already queued, then
    /// dead-letter events still parked waiting for a predecessor.
    pub async fn shutdown(self) -> WorkerStats {
        self.stop(LaneSignal::Drain).await
    }

    /// Stop after each lane's in-flight event. Queued events are not dispatched;
    /// they remain in the event store for replay.
    pub async fn cancel(self) -> WorkerStats {
        self.stop(LaneSignal::Cancel).await
    }

    async fn stop(self, signal: LaneSignal) -> WorkerStats {
        let _ = self.signal.send(signal);
        for join in self.joins {
            if let Err(err) = join.await {
                warn!(worker = %self.name, error = %err, "lane task ended abnormally");
            }
        }

        if signal == LaneSignal::Drain {
            let flushed = self.dispatcher.flush_parked().await;
            self.counters
                .parked_dead_lettered
                .fetch_add(flushed as u64, Ordering::Relaxed);
        }

        let stats = self.counters.snapshot();
        info!(worker = %self.name, ?stats, "dispatch worker stopped");
        stats
    }
}

/// Spawns the lane tasks feeding a [`Dispatcher`].
#[derive(Debug)]
pub struct DispatchWorker;

impl DispatchWorker {
    /// Spawn `lanes` tasks, each with a bounded queue of `capacity` events.
    ///
    /// Must be called within a tokio runtime.
    pub fn spawn(
        name: impl Into<String>,
        dispatcher: Arc<Dispatcher>,
        lanes: usize,
        capacity: usize,
    ) -> DispatchHandle {
        let name = name.into();
        let (signal_tx, signal_rx) = watch::channel(LaneSignal::Run);
        let counters = Arc::new(Counters::default());

        let mut senders = Vec::with_capacity(lanes.max(1));
        let mut joins = Vec::with_capacity(lanes.max(1));
        for lane in 0..lanes.max(1) {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            senders.push(tx);
            joins.push(tokio::spawn(run_lane(
                name.clone(),
                lane,
                rx,
                signal_rx.clone(),
                dispatcher.clone(),
                counters.clone(),
            )));
        }

        info!(worker = %name, lanes = joins.len(), capacity, "dispatch worker started");

        DispatchHandle {
            name,
            sender: DispatchSender {
                lanes: Arc::new(senders),
            },
            signal: signal_tx,
            joins,
            counters,
            dispatcher,
        }
    }
}

async fn run_lane(
    name: String,
    lane: usize,
    mut rx: mpsc::Receiver<EventRecord>,
    mut signal: watch::Receiver<LaneSignal>,
    dispatcher: Arc<Dispatcher>,
    counters: Arc<Counters>,
) {
    loop {
        // Dispatch runs in the arm body, after `select!` has resolved, so a signal
        // arriving mid-dispatch is only observed on the next iteration.
        tokio::select! {
            biased;

            changed = signal.changed() => {
                // A dropped handle is treated as a graceful shutdown.
                let next = match changed {
                    Ok(()) => *signal.borrow_and_update(),
                    Err(_) => LaneSignal::Drain,
                };
                match next {
                    LaneSignal::Run => continue,
                    LaneSignal::Drain => {
                        rx.close();
                        while let Some(record) = rx.recv().await {
                            process(&dispatcher, &record, &counters).await;
                        }
                        break;
                    }
                    LaneSignal::Cancel => {
                        rx.close();
                        let mut abandoned = 0_u64;
                        while rx.try_recv().is_ok() {
                            abandoned += 1;
                        }
                        if abandoned > 0 {
                            warn!(worker = %name, lane, abandoned, "cancelled with events queued");
                            counters.events_abandoned.fetch_add(abandoned, Ordering::Relaxed);
                        }
                        break;
                    }
                }
            }

            received = rx.recv() => match received {
                Some(record) => process(&dispatcher, &record, &counters).await,
                None => break,
            },
        }
    }

    debug!(worker = %name, lane, "lane stopped");
}

async fn process(dispatcher: &Dispatcher, record: &EventRecord, counters: &Counters) {
    let report = dispatcher.dispatch(record).await;

    counters.events_processed.fetch_add(1, Ordering::Relaxed);
    counters
        .deliveries_succeeded
        .fetch_add(report.delivered() as u64, Ordering::Relaxed);
    counters
        .deliveries_deferred
        .fetch_add(report.deferred() as u64, Ordering::Relaxed);
    counters
        .deliveries_failed
        .fetch_add(report.failed() as u64, Ordering::Relaxed);
}
