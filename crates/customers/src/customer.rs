use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use readsync_events::Event;

/// Aggregate type tag carried by every customer event record.
pub const AGGREGATE_TYPE: &str = "customer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

/// Event: CustomerCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerCreated {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub gender: Gender,
    pub email: String,
    pub date_of_birth: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

/// Event: CustomerUpdated.
///
/// Carries the full customer state so the projection never needs the previous row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerUpdated {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub gender: Gender,
    pub email: String,
    pub date_of_birth: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

/// Event: CustomerDeleted.
///
/// Deletion is keyed by email, which is unique among customers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerDeleted {
    pub id: Uuid,
    pub email: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CustomerEvent {
    CustomerCreated(CustomerCreated),
    CustomerUpdated(CustomerUpdated),
    CustomerDeleted(CustomerDeleted),
}

impl CustomerEvent {
    pub const CREATED: &'static str = "customer.created";
    pub const UPDATED: &'static str = "customer.updated";
    pub const DELETED: &'static str = "customer.deleted";

    /// Every event type in the customer contract.
    pub const ALL: &'static [&'static str] = &[Self::CREATED, Self::UPDATED, Self::DELETED];

    /// The customer this event is about.
    pub fn customer_id(&self) -> Uuid {
        match self {
            CustomerEvent::CustomerCreated(e) => e.id,
            CustomerEvent::CustomerUpdated(e) => e.id,
            CustomerEvent::CustomerDeleted(e) => e.id,
        }
    }
}

impl Event for CustomerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CustomerEvent::CustomerCreated(_) => Self::CREATED,
            CustomerEvent::CustomerUpdated(_) => Self::UPDATED,
            CustomerEvent::CustomerDeleted(_) => Self::DELETED,
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            CustomerEvent::CustomerCreated(e) => e.occurred_at,
            CustomerEvent::CustomerUpdated(e) => e.occurred_at,
            CustomerEvent::CustomerDeleted(e) => e.occurred_at,
        }
    }
}
