//! Hand-off seam between the event store and the dispatcher.
//!
//! Records are **stored first**, then **published**. If publication fails, the
//! records are still in the store and can be republished (at-least-once), so
//! consumers must be idempotent.
//!
//! ```text
//! Write side → Event Store (append) → EventPublisher (publish) → Dispatcher
//!                                                                 ├─ customer handler
//!                                                                 └─ device handler
//! ```

use std::sync::Arc;

use async_trait::async_trait;

use crate::EventRecord;

/// Transport-agnostic publisher of committed records.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    async fn publish(&self, record: EventRecord) -> Result<(), Self::Error>;
}

#[async_trait]
impl<P> EventPublisher for Arc<P>
where
    P: EventPublisher + ?Sized,
{
    type Error = P::Error;

    async fn publish(&self, record: EventRecord) -> Result<(), Self::Error> {
        (**self).publish(record).await
    }
}
