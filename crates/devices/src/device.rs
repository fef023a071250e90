use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use readsync_core::AggregateId;
use readsync_events::Event;

/// Aggregate type tag carried by every device event record.
pub const AGGREGATE_TYPE: &str = "device";

/// Device identifier (database-assigned integer key on the write side).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub i64);

impl core::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<DeviceId> for AggregateId {
    fn from(value: DeviceId) -> Self {
        AggregateId::from(value.0)
    }
}

/// Event: DeviceCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCreated {
    pub id: DeviceId,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Event: DeviceUpdated.
///
/// `created_at` is repeated so an update observed before its create still
/// produces a complete row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceUpdated {
    pub id: DeviceId,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: DeviceDeleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDeleted {
    pub id: DeviceId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceEvent {
    DeviceCreated(DeviceCreated),
    DeviceUpdated(DeviceUpdated),
    DeviceDeleted(DeviceDeleted),
}

impl DeviceEvent {
    pub const CREATED: &'static str = "device.created";
    pub const UPDATED: &'static str = "device.updated";
    pub const DELETED: &'static str = "device.deleted";

    pub const ALL: &'static [&'static str] = &[Self::CREATED, Self::UPDATED, Self::DELETED];

    pub fn device_id(&self) -> DeviceId {
        match self {
            DeviceEvent::DeviceCreated(e) => e.id,
            DeviceEvent::DeviceUpdated(e) => e.id,
            DeviceEvent::DeviceDeleted(e) => e.id,
        }
    }
}

impl Event for DeviceEvent {
    fn event_type(&self) -> &'static str {
        match self {
            DeviceEvent::DeviceCreated(_) => Self::CREATED,
            DeviceEvent::DeviceUpdated(_) => Self::UPDATED,
            DeviceEvent::DeviceDeleted(_) => Self::DELETED,
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            DeviceEvent::DeviceCreated(e) => e.created_at,
            DeviceEvent::DeviceUpdated(e) => e.occurred_at,
            DeviceEvent::DeviceDeleted(e) => e.occurred_at,
        }
    }
}
