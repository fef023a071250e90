//! `readsync-core` — shared building blocks for the read-model synchronization pipeline.
//!
//! This crate contains identifiers and small value types only (no IO, no async).

pub mod error;
pub mod id;
pub mod version;

pub use error::CoreError;
pub use id::{AggregateId, EventId};
pub use version::ExpectedVersion;
