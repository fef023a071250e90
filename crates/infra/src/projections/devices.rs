//! Device read-model projection.

use readsync_devices::{AGGREGATE_TYPE, DeviceEvent, DeviceQueryModel};
use readsync_events::{EventRecord, MappingError, Mutation, Projector};

use crate::cache::{InvalidationPolicy, KeyTemplate};

pub const PROJECTION_NAME: &str = "devices";

pub const GET_ALL_QUERY: &str = "GetAllDeviceQuery";
pub const GET_BY_ID_QUERY: &str = "GetDeviceByIdQuery";

#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceProjector;

impl Projector for DeviceProjector {
    type Model = DeviceQueryModel;

    fn aggregate_type(&self) -> &'static str {
        AGGREGATE_TYPE
    }

    fn event_types(&self) -> &'static [&'static str] {
        DeviceEvent::ALL
    }

    fn map(&self, record: &EventRecord) -> Result<Mutation<DeviceQueryModel>, MappingError> {
        readsync_devices::project(record)
    }
}

pub fn invalidation_policy() -> InvalidationPolicy {
    InvalidationPolicy::new().on_all(
        DeviceEvent::ALL,
        &[
            KeyTemplate::Static(GET_ALL_QUERY.to_string()),
            KeyTemplate::ById(GET_BY_ID_QUERY.to_string()),
        ],
    )
}
