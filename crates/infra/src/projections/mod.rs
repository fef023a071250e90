//! Read-model projections.
//!
//! Projections consume committed events and maintain query-optimized read models.
//! All projections are:
//! - **Rebuildable**: can be reconstructed from the event store (see [`replay`])
//! - **Idempotent**: safe for at-least-once delivery
//! - **Order-tolerant**: a row never regresses to an older sequence

pub mod cursor_store;
pub mod replay;
pub mod synchronizer;

pub mod customers;
pub mod devices;

pub use cursor_store::{InMemoryCursorStore, ProjectionCursorStore};
pub use customers::CustomerProjector;
pub use devices::DeviceProjector;
pub use replay::{ReplayError, ReplayHandle, ReplayPhase, ReplayProgress, replay, spawn_replay};
pub use synchronizer::{ProjectionError, ProjectionSynchronizer, SequencePolicy, SyncOutcome};
