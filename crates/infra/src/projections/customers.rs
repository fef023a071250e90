//! Customer read-model projection.

use readsync_customers::{AGGREGATE_TYPE, CustomerEvent, CustomerQueryModel};
use readsync_events::{EventRecord, MappingError, Mutation, Projector};

use crate::cache::{InvalidationPolicy, KeyTemplate};

pub const PROJECTION_NAME: &str = "customers";

/// Cache key of the "list all customers" query.
pub const GET_ALL_QUERY: &str = "GetAllCustomerQuery";
/// Prefix of the "get customer by id" query key (`GetCustomerByIdQuery_<id>`).
pub const GET_BY_ID_QUERY: &str = "GetCustomerByIdQuery";

#[derive(Debug, Default, Clone, Copy)]
pub struct CustomerProjector;

impl Projector for CustomerProjector {
    type Model = CustomerQueryModel;

    fn aggregate_type(&self) -> &'static str {
        AGGREGATE_TYPE
    }

    fn event_types(&self) -> &'static [&'static str] {
        CustomerEvent::ALL
    }

    fn map(&self, record: &EventRecord) -> Result<Mutation<CustomerQueryModel>, MappingError> {
        readsync_customers::project(record)
    }
}

/// Every customer event drops the listing and the customer's own entry.
pub fn invalidation_policy() -> InvalidationPolicy {
    InvalidationPolicy::new().on_all(
        CustomerEvent::ALL,
        &[
            KeyTemplate::Static(GET_ALL_QUERY.to_string()),
            KeyTemplate::ById(GET_BY_ID_QUERY.to_string()),
        ],
    )
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use readsync_core::AggregateId;

    use super::*;

    #[test]
    fn default_policy_covers_the_listing_and_by_id_queries() {
        let id = Uuid::from_u128(7);
        let aggregate = AggregateId::from(id);

        for event_type in CustomerEvent::ALL {
            assert_eq!(
                invalidation_policy().keys(event_type, &aggregate),
                vec![GET_ALL_QUERY.to_string(), format!("GetCustomerByIdQuery_{id}")]
            );
        }
    }
}
