use chrono::{DateTime, Utc};

/// A typed domain event, as decided and committed by the write side.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - tagged with a stable, per-aggregate-type `event_type`
/// - designed to be **append-only**
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "customer.created").
    fn event_type(&self) -> &'static str;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}
