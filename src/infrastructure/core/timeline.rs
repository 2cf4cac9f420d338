use async_trait::async_trait;
use eventstore::{Client, ExpectedRevision};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{
    core::{BookingId, RequestId, ResourceId, Timeline, TimelineEvent, TimelineRepository},
    Aggregation, DataAccessError, Entity,
};
use crate::infrastructure::{load, store};

use super::{append_index, read_index};

/// Points a booking id at the timeline holding it.
#[derive(Debug, Serialize, Deserialize)]
struct BookingLocated {
    resource_id: ResourceId,
}

fn booking_stream(booking_id: BookingId) -> String {
    format!("booking-{}", booking_id)
}

fn request_bookings_stream(request_id: RequestId) -> String {
    format!("request_bookings-{}", request_id)
}

#[derive(Clone)]
pub struct EventStoreTimelineRepository {
    client: Client,
}

impl EventStoreTimelineRepository {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TimelineRepository for EventStoreTimelineRepository {
    async fn find_by_id(&self, id: ResourceId) -> Result<Option<Timeline>, DataAccessError> {
        load(&self.client, id).await
    }

    async fn find_resource_by_booking(
        &self,
        booking_id: BookingId,
    ) -> Result<Option<ResourceId>, DataAccessError> {
        let located: Vec<BookingLocated> =
            read_index(&self.client, &booking_stream(booking_id)).await?;
        Ok(located.first().map(|l| l.resource_id))
    }

    async fn find_resources_by_request(
        &self,
        request_id: RequestId,
    ) -> Result<Vec<ResourceId>, DataAccessError> {
        let located: Vec<BookingLocated> =
            read_index(&self.client, &request_bookings_stream(request_id)).await?;
        let mut resources = located.into_iter().map(|l| l.resource_id).collect::<Vec<_>>();
        resources.sort_by_key(|id| **id);
        resources.dedup();
        Ok(resources)
    }

    /// Index entries go first. One left behind by a lost append points at a timeline
    /// without that booking, which reads as not found.
    async fn save(&self, entity: &mut Timeline) -> Result<bool, DataAccessError> {
        let scheduled = entity
            .events()
            .iter()
            .filter_map(|e| match e {
                TimelineEvent::BookingScheduled { booking, .. } => {
                    Some((booking.id(), booking.request_id()))
                }
                _ => None,
            })
            .collect::<Vec<_>>();
        for (booking_id, request_id) in scheduled {
            let record = BookingLocated {
                resource_id: entity.id(),
            };
            append_index(
                &self.client,
                &request_bookings_stream(request_id),
                "BookingLocated",
                &record,
                ExpectedRevision::Any,
            )
            .await?;
            match append_index(
                &self.client,
                &booking_stream(booking_id),
                "BookingLocated",
                &record,
                ExpectedRevision::NoStream,
            )
            .await
            {
                Ok(()) | Err(DataAccessError::ConcurrencyError(_)) => {}
                Err(e) => return Err(e),
            }
            debug!("booking {} indexed under timeline {}", booking_id, entity.id());
        }
        store(&self.client, entity).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_streams_stay_out_of_entity_streams() {
        assert_eq!(request_bookings_stream(5.into()), "request_bookings-5");
        assert_eq!(booking_stream(9.into()), "booking-9");
        assert_ne!(
            request_bookings_stream(5.into()).split('-').next(),
            Some(<crate::domain::core::ServiceRequest as Entity>::ENTITY_NAME)
        );
    }
}
