use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use readsync_core::AggregateId;
use readsync_events::{EventRecord, Filter, MappingError, Mutation, ReadModel};

use crate::device::{DeviceEvent, DeviceId};

/// Queryable device read model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceQueryModel {
    pub id: DeviceId,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub version: u64,
}

impl ReadModel for DeviceQueryModel {
    fn version(&self) -> u64 {
        self.version
    }
}

/// Map a device event record to its read-model mutation (all variants match by `id`).
pub fn project(record: &EventRecord) -> Result<Mutation<DeviceQueryModel>, MappingError> {
    let event: DeviceEvent = record.decode()?;

    let id = event.device_id();
    if &AggregateId::from(id) != record.aggregate_id() {
        return Err(MappingError::AggregateMismatch {
            record: record.aggregate_id().to_string(),
            payload: id.to_string(),
        });
    }

    let filter = Filter::new(format!("id = {id}"), move |m: &DeviceQueryModel| m.id == id);
    let version = record.sequence();

    let mutation = match event {
        DeviceEvent::DeviceCreated(e) => Mutation::Upsert {
            model: DeviceQueryModel {
                id: e.id,
                name: e.name,
                device_type: e.device_type,
                created_at: e.created_at,
                version,
            },
            filter,
        },
        DeviceEvent::DeviceUpdated(e) => Mutation::Upsert {
            model: DeviceQueryModel {
                id: e.id,
                name: e.name,
                device_type: e.device_type,
                created_at: e.created_at,
                version,
            },
            filter,
        },
        DeviceEvent::DeviceDeleted(_) => Mutation::Delete { filter },
    };

    Ok(mutation)
}
