//! Read-model storage abstractions.

pub mod model_store;

pub use model_store::{InMemoryReadModelStore, ReadModelError, ReadModelStore, UpsertOutcome};
