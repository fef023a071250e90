//! Committed events and the read-model projection contracts built on them.

pub mod event;
pub mod projection;
pub mod publisher;
pub mod record;

pub use event::Event;
pub use projection::{Filter, MappingError, Mutation, Projector, ReadModel};
pub use publisher::EventPublisher;
pub use record::{EventRecord, NewEvent};
