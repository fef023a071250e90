use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use readsync_core::AggregateId;
use readsync_events::{EventRecord, Filter, MappingError, Mutation, ReadModel};

use crate::customer::{CustomerEvent, Gender};

/// Queryable customer read model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerQueryModel {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub gender: Gender,
    pub email: String,
    pub date_of_birth: NaiveDate,
    /// Sequence of the event that produced this row.
    pub version: u64,
}

impl ReadModel for CustomerQueryModel {
    fn version(&self) -> u64 {
        self.version
    }
}

/// Map a customer event record to its read-model mutation.
///
/// - Created / Updated upsert the full row, matched by `id`.
/// - Deleted removes every row carrying the deleted email, and the customer's own
///   row even if an email change has not been projected yet.
pub fn project(record: &EventRecord) -> Result<Mutation<CustomerQueryModel>, MappingError> {
    let event: CustomerEvent = record.decode()?;

    let payload_aggregate = AggregateId::from(event.customer_id());
    if &payload_aggregate != record.aggregate_id() {
        return Err(MappingError::AggregateMismatch {
            record: record.aggregate_id().to_string(),
            payload: payload_aggregate.to_string(),
        });
    }

    let version = record.sequence();

    let mutation = match event {
        CustomerEvent::CustomerCreated(e) => upsert(CustomerQueryModel {
            id: e.id,
            first_name: e.first_name,
            last_name: e.last_name,
            gender: e.gender,
            email: e.email,
            date_of_birth: e.date_of_birth,
            version,
        }),
        CustomerEvent::CustomerUpdated(e) => upsert(CustomerQueryModel {
            id: e.id,
            first_name: e.first_name,
            last_name: e.last_name,
            gender: e.gender,
            email: e.email,
            date_of_birth: e.date_of_birth,
            version,
        }),
        CustomerEvent::CustomerDeleted(e) => {
            let (id, email) = (e.id, e.email);
            Mutation::Delete {
                filter: Filter::new(
                    format!("email = {email} or id = {id}"),
                    move |m: &CustomerQueryModel| m.email == email || m.id == id,
                ),
            }
        }
    };

    Ok(mutation)
}

fn upsert(model: CustomerQueryModel) -> Mutation<CustomerQueryModel> {
    let id = model.id;
    Mutation::Upsert {
        model,
        filter: Filter::new(format!("id = {id}"), move |m: &CustomerQueryModel| m.id == id),
    }
}
