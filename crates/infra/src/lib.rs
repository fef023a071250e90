//! Infrastructure layer: event store, read-model synchronization, cache
//! invalidation, dispatch, configuration.

pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod event_store;
pub mod handler;
pub mod pipeline;
pub mod projections;
pub mod read_model;
pub mod workers;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, SyncConfig};
pub use pipeline::{InMemoryReadSide, Pipeline};
