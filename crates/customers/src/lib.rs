//! Customers: event contract and query model.
//!
//! Pure domain data and mapping only (no IO, no storage, no async).

pub mod customer;
pub mod query_model;

pub use customer::{
    AGGREGATE_TYPE, CustomerCreated, CustomerDeleted, CustomerEvent, CustomerUpdated, Gender,
};
pub use query_model::{CustomerQueryModel, project};
