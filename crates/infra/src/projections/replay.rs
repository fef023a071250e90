//! Projection replay tooling for rebuilding read models from the event store.
//!
//! Replay re-drives a handler with every stored event it subscribes to, one
//! aggregate at a time in `sequence` order. Combined with
//! [`ProjectionSynchronizer::reset`](super::ProjectionSynchronizer::reset) this is a
//! deterministic rebuild; without a reset it is a harmless catch-up, since
//! already-applied events are superseded no-ops.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use readsync_events::EventRecord;

use crate::event_store::{EventStore, EventStoreError};
use crate::handler::{EventHandler, HandlerError};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("event store error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("handler '{handler}' failed on event {event_id}: {source}")]
    Handler {
        handler: String,
        event_id: String,
        source: HandlerError,
    },

    #[error("replay cancelled")]
    Cancelled,

    #[error("replay task stopped unexpectedly")]
    Aborted,
}

/// Phase of a replay operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayPhase {
    Loading,
    Replaying,
    Complete,
    Failed,
}

/// Progress information for a replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayProgress {
    pub total_events: u64,
    pub processed_events: u64,
    pub processed_aggregates: u64,
    pub phase: ReplayPhase,
}

impl ReplayProgress {
    fn loading() -> Self {
        Self {
            total_events: 0,
            processed_events: 0,
            processed_aggregates: 0,
            phase: ReplayPhase::Loading,
        }
    }
}

/// Handle for monitoring and controlling a spawned replay.
pub struct ReplayHandle {
    progress: watch::Receiver<ReplayProgress>,
    cancellation: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<Result<ReplayProgress, ReplayError>>,
}

impl ReplayHandle {
    pub fn progress(&self) -> ReplayProgress {
        self.progress.borrow().clone()
    }

    /// Stop before the next event. The event in flight is always finished.
    pub fn cancel(&self) {
        self.cancellation.store(true, Ordering::Relaxed);
    }

    pub async fn wait_for_completion(self) -> Result<ReplayProgress, ReplayError> {
        self.task.await.map_err(|_| ReplayError::Aborted)?
    }
}

/// Replay `handler` on a background task.
pub fn spawn_replay<S, H>(store: Arc<S>, handler: Arc<H>) -> ReplayHandle
where
    S: EventStore + ?Sized + 'static,
    H: EventHandler + ?Sized + 'static,
{
    let (tx, rx) = watch::channel(ReplayProgress::loading());
    let cancellation = Arc::new(AtomicBool::new(false));
    let cancel = cancellation.clone();

    let task = tokio::spawn(async move {
        run_replay(store.as_ref(), handler.as_ref(), &cancel, &tx).await
    });

    ReplayHandle {
        progress: rx,
        cancellation,
        task,
    }
}

/// Replay `handler` on the current task.
pub async fn replay<S, H>(store: &S, handler: &H) -> Result<ReplayProgress, ReplayError>
where
    S: EventStore + ?Sized,
    H: EventHandler + ?Sized,
{
    let (tx, _rx) = watch::channel(ReplayProgress::loading());
    run_replay(store, handler, &AtomicBool::new(false), &tx).await
}

async fn run_replay<S, H>(
    store: &S,
    handler: &H,
    cancellation: &AtomicBool,
    progress: &watch::Sender<ReplayProgress>,
) -> Result<ReplayProgress, ReplayError>
where
    S: EventStore + ?Sized,
    H: EventHandler + ?Sized,
{
    let result = replay_events(store, handler, cancellation, progress).await;

    let mut last = progress.borrow().clone();
    last.phase = match &result {
        Ok(()) => ReplayPhase::Complete,
        Err(_) => ReplayPhase::Failed,
    };
    progress.send_replace(last.clone());

    match result {
        Ok(()) => {
            info!(
                handler = handler.name(),
                events = last.processed_events,
                aggregates = last.processed_aggregates,
                "replay complete"
            );
            Ok(last)
        }
        Err(err) => {
            warn!(handler = handler.name(), error = %err, "replay stopped");
            Err(err)
        }
    }
}

async fn replay_events<S, H>(
    store: &S,
    handler: &H,
    cancellation: &AtomicBool,
    progress: &watch::Sender<ReplayProgress>,
) -> Result<(), ReplayError>
where
    S: EventStore + ?Sized,
    H: EventHandler + ?Sized,
{
    let subscribed = handler.event_types();
    let events: Vec<EventRecord> = store
        .load_all()
        .await?
        .into_iter()
        .filter(|e| subscribed.iter().any(|t| *t == e.event_type()))
        .collect();

    progress.send_modify(|p| {
        p.total_events = events.len() as u64;
        p.phase = ReplayPhase::Replaying;
    });

    // `load_all` yields whole streams in sequence order, grouped by aggregate.
    let mut last_aggregate = None;
    for event in &events {
        if cancellation.load(Ordering::Relaxed) {
            return Err(ReplayError::Cancelled);
        }

        handler
            .handle(event)
            .await
            .map_err(|source| ReplayError::Handler {
                handler: handler.name().to_string(),
                event_id: event.id().to_string(),
                source,
            })?;

        let new_aggregate = last_aggregate != Some(event.aggregate_id());
        last_aggregate = Some(event.aggregate_id());
        progress.send_modify(|p| {
            p.processed_events += 1;
            if new_aggregate {
                p.processed_aggregates += 1;
            }
        });
    }

    Ok(())
}
