use std::{ops::Range, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::domain::{
    core::{
        window, Booking, BookingId, BookingStatus, RequestId, ResourceId, ServiceTypeId, Timeline,
        TimelineRepository,
    },
    Aggregation, Clock, DataAccessError, IdGenerator,
};

use super::{bounded, ServiceError, ServiceResult};

/// Attempts at committing against a timeline that keeps moving under us.
const MAX_ATTEMPTS: usize = 3;

/// Outcome of [`BookingLedger::create_booking`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reservation {
    pub booking: Booking,
    /// False when an identical booking of the same request was already in place.
    pub created: bool,
}

/// Outcome of [`BookingLedger::update_status`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusChange {
    pub booking: Booking,
    pub changed: bool,
}

/// Sole writer of bookings. Every write re-checks overlaps against the timeline it
/// commits to, and the store rejects the append if anyone else wrote in between.
pub struct BookingLedger {
    timelines: Arc<dyn TimelineRepository>,
    ids: Arc<IdGenerator>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl BookingLedger {
    pub fn new(
        timelines: Arc<dyn TimelineRepository>,
        ids: Arc<IdGenerator>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            timelines,
            ids,
            clock,
            timeout,
        }
    }

    pub async fn create_booking(
        &self,
        resource_id: ResourceId,
        request_id: RequestId,
        service_type_id: ServiceTypeId,
        start: DateTime<Utc>,
        duration_minutes: u32,
    ) -> ServiceResult<Reservation> {
        let time = window(start, duration_minutes)?;
        let reservation = self
            .modify(resource_id, |timeline| {
                if let Some(existing) = timeline.active_for_request(request_id) {
                    return match existing.time() == time
                        && existing.status() == BookingStatus::Scheduled
                    {
                        true => Ok(Reservation {
                            booking: existing.clone(),
                            created: false,
                        }),
                        false => Err(ServiceError::Conflict(format!(
                            "request {} already holds booking {}",
                            request_id,
                            existing.id()
                        ))),
                    };
                }
                let booking = Booking::create(
                    self.ids.generate(),
                    resource_id,
                    request_id,
                    service_type_id,
                    start,
                    duration_minutes,
                    self.clock.now(),
                )?;
                timeline.schedule(booking.clone()).map_err(|e| {
                    warn!("resource {} busy for {:?}: {}", resource_id, time, e);
                    ServiceError::from(e)
                })?;
                Ok(Reservation {
                    booking,
                    created: true,
                })
            })
            .await?;
        if reservation.created {
            info!(
                "booking {} scheduled for resource {} from {} to {}",
                reservation.booking.id(),
                resource_id,
                reservation.booking.start_time(),
                reservation.booking.end_time()
            );
        }
        Ok(reservation)
    }

    /// Moves a booking on the ledger's side. Bookings already at `status` are reported unchanged.
    pub async fn update_status(
        &self,
        resource_id: ResourceId,
        booking_id: BookingId,
        status: BookingStatus,
    ) -> ServiceResult<StatusChange> {
        let change = self
            .modify(resource_id, |timeline| {
                let current = timeline
                    .booking(booking_id)
                    .map(Booking::status)
                    .ok_or_else(|| ServiceError::not_found("booking", *booking_id))?;
                let changed = current != status;
                if changed {
                    timeline.change_status(booking_id, status, self.clock.now())?;
                }
                let booking = timeline
                    .booking(booking_id)
                    .cloned()
                    .ok_or_else(|| ServiceError::not_found("booking", *booking_id))?;
                Ok(StatusChange { booking, changed })
            })
            .await?;
        if change.changed {
            info!("booking {} is now {}", booking_id, status);
        }
        Ok(change)
    }

    /// Shifts a scheduled booking to `time`. Only other bookings can conflict with it.
    pub async fn move_booking(
        &self,
        resource_id: ResourceId,
        booking_id: BookingId,
        time: Range<DateTime<Utc>>,
    ) -> ServiceResult<Booking> {
        let booking = self
            .modify(resource_id, |timeline| {
                timeline.move_booking(booking_id, time.clone(), self.clock.now())?;
                timeline
                    .booking(booking_id)
                    .cloned()
                    .ok_or_else(|| ServiceError::not_found("booking", *booking_id))
            })
            .await?;
        info!(
            "booking {} moved to {} - {}",
            booking_id,
            booking.start_time(),
            booking.end_time()
        );
        Ok(booking)
    }

    pub async fn timeline(&self, resource_id: ResourceId) -> ServiceResult<Timeline> {
        Ok(bounded(self.timeout, self.timelines.find_by_id(resource_id))
            .await?
            .unwrap_or_else(|| Timeline::open(resource_id)))
    }

    /// Resource whose timeline holds `booking_id`.
    pub async fn locate(&self, booking_id: BookingId) -> ServiceResult<ResourceId> {
        bounded(
            self.timeout,
            self.timelines.find_resource_by_booking(booking_id),
        )
        .await?
        .ok_or_else(|| ServiceError::not_found("booking", *booking_id))
    }

    /// Bookings of `request_id` that still hold a slot, on any resource.
    pub async fn live_bookings(&self, request_id: RequestId) -> ServiceResult<Vec<Booking>> {
        let resources = bounded(
            self.timeout,
            self.timelines.find_resources_by_request(request_id),
        )
        .await?;
        let mut live = Vec::new();
        for resource_id in resources {
            if let Some(booking) = self.timeline(resource_id).await?.active_for_request(request_id) {
                live.push(booking.clone());
            }
        }
        Ok(live)
    }

    pub async fn booking(&self, booking_id: BookingId) -> ServiceResult<Booking> {
        let resource_id = self.locate(booking_id).await?;
        self.timeline(resource_id)
            .await?
            .booking(booking_id)
            .cloned()
            .ok_or_else(|| ServiceError::not_found("booking", *booking_id))
    }

    /// Loads the timeline, applies `change` and commits it at the revision it was read at.
    /// A concurrent append discards the attempt and `change` runs again on fresh state.
    async fn modify<T, F>(&self, resource_id: ResourceId, mut change: F) -> ServiceResult<T>
    where
        F: FnMut(&mut Timeline) -> ServiceResult<T>,
    {
        for attempt in 1..=MAX_ATTEMPTS {
            let mut timeline = self.timeline(resource_id).await?;
            let outcome = change(&mut timeline)?;
            if !timeline.has_changes() {
                return Ok(outcome);
            }
            match bounded(self.timeout, self.timelines.save(&mut timeline)).await {
                Ok(_) => return Ok(outcome),
                Err(DataAccessError::ConcurrencyError(stream)) => {
                    debug!("{} moved on, attempt {}/{}", stream, attempt, MAX_ATTEMPTS);
                }
                Err(e) => return Err(e.into()),
            }
        }
        warn!("gave up writing timeline of resource {}", resource_id);
        Err(ServiceError::Conflict(format!(
            "bookings of resource {} are changing too quickly, try again",
            resource_id
        )))
    }
}
