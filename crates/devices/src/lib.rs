//! Devices: event contract and query model.

pub mod device;
pub mod query_model;

pub use device::{AGGREGATE_TYPE, DeviceCreated, DeviceDeleted, DeviceEvent, DeviceId, DeviceUpdated};
pub use query_model::{DeviceQueryModel, project};
