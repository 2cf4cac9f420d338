use std::ops::Range;

use async_trait::async_trait;
use bio::data_structures::interval_tree::IntervalTree;
use chrono::{DateTime, Duration, Utc};
use derive_more::{Deref, Display, Error, From};
use serde::{Deserialize, Serialize};

use crate::domain::{Aggregation, DataAccessError, Entity, Event, EventQueue, Id};

use super::{RequestId, ResourceId, ServiceTypeId};

/// Booking ledger storage, one timeline per resource.
///
/// `save` must fail with [`DataAccessError::ConcurrencyError`] when the timeline was
/// appended to since it was loaded. This is what keeps two writers from both committing
/// overlapping bookings for the same resource.
#[async_trait]
pub trait TimelineRepository: Send + Sync {
    async fn find_by_id(&self, id: ResourceId) -> Result<Option<Timeline>, DataAccessError>;
    async fn find_resource_by_booking(
        &self,
        booking_id: BookingId,
    ) -> Result<Option<ResourceId>, DataAccessError>;
    /// Every resource that ever scheduled a booking for `request_id`, in no particular order.
    async fn find_resources_by_request(
        &self,
        request_id: RequestId,
    ) -> Result<Vec<ResourceId>, DataAccessError>;
    async fn save(&self, entity: &mut Timeline) -> Result<bool, DataAccessError>;
}

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Deref, Default,
)]
pub struct BookingId(u64);

impl Id for BookingId {
    type Inner = u64;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    #[default]
    #[display(fmt = "scheduled")]
    Scheduled,
    #[display(fmt = "in_progress")]
    InProgress,
    #[display(fmt = "completed")]
    Completed,
    #[display(fmt = "cancelled")]
    Cancelled,
}

impl BookingStatus {
    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        matches!(
            (self, next),
            (BookingStatus::Scheduled, BookingStatus::InProgress)
                | (BookingStatus::InProgress, BookingStatus::Completed)
                | (BookingStatus::Scheduled, BookingStatus::Cancelled)
                | (BookingStatus::InProgress, BookingStatus::Cancelled)
        )
    }

    /// Cancelled bookings stay for history but no longer hold the slot.
    pub fn holds_slot(self) -> bool {
        self != BookingStatus::Cancelled
    }
}

/// A committed reservation of a resource's time, `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    id: BookingId,
    resource_id: ResourceId,
    request_id: RequestId,
    service_type_id: ServiceTypeId,
    time: Range<DateTime<Utc>>,
    duration_minutes: u32,
    status: BookingStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn create(
        id: BookingId,
        resource_id: ResourceId,
        request_id: RequestId,
        service_type_id: ServiceTypeId,
        start: DateTime<Utc>,
        duration_minutes: u32,
        created_at: DateTime<Utc>,
    ) -> Result<Self, TimelineError> {
        let time = window(start, duration_minutes)?;
        Ok(Self {
            id,
            resource_id,
            request_id,
            service_type_id,
            time,
            duration_minutes,
            status: BookingStatus::Scheduled,
            created_at,
            updated_at: created_at,
        })
    }

    pub fn id(&self) -> BookingId {
        self.id
    }

    pub fn resource_id(&self) -> ResourceId {
        self.resource_id
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn service_type_id(&self) -> ServiceTypeId {
        self.service_type_id
    }

    pub fn time(&self) -> Range<DateTime<Utc>> {
        self.time.clone()
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.time.start
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.time.end
    }

    pub fn duration_minutes(&self) -> u32 {
        self.duration_minutes
    }

    pub fn status(&self) -> BookingStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

/// Builds `[start, start + duration_minutes)`.
pub fn window(
    start: DateTime<Utc>,
    duration_minutes: u32,
) -> Result<Range<DateTime<Utc>>, TimelineError> {
    if duration_minutes == 0 {
        return Err(TimelineError::InvalidDuration);
    }
    Ok(start..start + Duration::minutes(i64::from(duration_minutes)))
}

/// Whole-minute length of a window.
pub fn window_minutes(time: &Range<DateTime<Utc>>) -> Result<u32, TimelineError> {
    let length = time.end - time.start;
    if length <= Duration::zero() {
        return Err(TimelineError::InvalidDuration);
    }
    if length != Duration::minutes(length.num_minutes()) {
        return Err(TimelineError::FractionalDuration);
    }
    u32::try_from(length.num_minutes()).map_err(|_| TimelineError::InvalidDuration)
}

/// Half-open overlap test.
pub fn overlaps(a: &Range<DateTime<Utc>>, b: &Range<DateTime<Utc>>) -> bool {
    a.start < b.end && a.end > b.start
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimelineEvent {
    BookingScheduled {
        id: ResourceId,
        booking: Booking,
    },
    BookingMoved {
        id: ResourceId,
        booking_id: BookingId,
        time: Range<DateTime<Utc>>,
        at: DateTime<Utc>,
    },
    BookingStatusChanged {
        id: ResourceId,
        booking_id: BookingId,
        status: BookingStatus,
        at: DateTime<Utc>,
    },
}

impl Event for TimelineEvent {
    type Id = ResourceId;
}

/// All bookings of one resource. The aggregate boundary for the no-double-booking rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timeline {
    id: ResourceId,
    bookings: Vec<Booking>,
    #[serde(skip)]
    revision: Option<u64>,
    #[serde(skip)]
    events: EventQueue<TimelineEvent>,
}

impl Timeline {
    /// An empty timeline that has not been written yet.
    pub fn open(id: ResourceId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn schedule(&mut self, booking: Booking) -> Result<(), TimelineError> {
        self.record(TimelineEvent::BookingScheduled { id: self.id, booking })
    }

    pub fn move_booking(
        &mut self,
        booking_id: BookingId,
        time: Range<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<(), TimelineError> {
        self.record(TimelineEvent::BookingMoved {
            id: self.id,
            booking_id,
            time,
            at,
        })
    }

    pub fn change_status(
        &mut self,
        booking_id: BookingId,
        status: BookingStatus,
        at: DateTime<Utc>,
    ) -> Result<(), TimelineError> {
        self.record(TimelineEvent::BookingStatusChanged {
            id: self.id,
            booking_id,
            status,
            at,
        })
    }

    pub fn bookings(&self) -> &[Booking] {
        &self.bookings
    }

    pub fn booking(&self, booking_id: BookingId) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == booking_id)
    }

    /// The slot-holding booking of a request, if any.
    pub fn active_for_request(&self, request_id: RequestId) -> Option<&Booking> {
        self.bookings
            .iter()
            .find(|b| b.request_id == request_id && b.status.holds_slot())
    }

    /// Slot-holding bookings intersecting `time`, ignoring those of `exclude`.
    pub fn conflicts(
        &self,
        time: &Range<DateTime<Utc>>,
        exclude: Option<RequestId>,
    ) -> Vec<&Booking> {
        if time.start >= time.end {
            return Vec::new();
        }
        let tree = IntervalTree::from_iter(
            self.bookings
                .iter()
                .filter(|b| b.status.holds_slot())
                .filter(|b| Some(b.request_id) != exclude)
                .map(|b| (b.time.clone(), b)),
        );
        let mut found = tree
            .find(time.clone())
            .map(|entry| *entry.data())
            .filter(|b| overlaps(&b.time, time))
            .collect::<Vec<_>>();
        found.sort_by_key(|b| b.time.start);
        found
    }

    pub fn is_free(&self, time: &Range<DateTime<Utc>>, exclude: Option<RequestId>) -> bool {
        self.conflicts(time, exclude).is_empty()
    }

    fn validate_id(&self, id: &ResourceId) -> Result<(), TimelineError> {
        match self.id == *id {
            true => Ok(()),
            false => Err(TimelineError::MismatchedId),
        }
    }

    fn validate_scheduled(&self, booking: &Booking) -> Result<(), TimelineError> {
        if booking.resource_id != self.id {
            return Err(TimelineError::MismatchedId);
        }
        if booking.time.start >= booking.time.end {
            return Err(TimelineError::InvalidDuration);
        }
        if self.booking(booking.id).is_some() {
            return Err(TimelineError::DuplicateBooking);
        }
        if booking.status != BookingStatus::Scheduled {
            return Err(TimelineError::InvalidStatusTransition {
                from: BookingStatus::Scheduled,
                to: booking.status,
            });
        }
        match self.conflicts(&booking.time, None).first() {
            Some(existing) => Err(TimelineError::Overlapping {
                booking_id: existing.id,
            }),
            None => Ok(()),
        }
    }

    fn validate_moved(
        &self,
        booking_id: &BookingId,
        time: &Range<DateTime<Utc>>,
    ) -> Result<(), TimelineError> {
        let booking = self
            .booking(*booking_id)
            .ok_or(TimelineError::BookingNotFound {
                booking_id: *booking_id,
            })?;
        if booking.status != BookingStatus::Scheduled {
            return Err(TimelineError::NotMovable);
        }
        window_minutes(time)?;
        match self
            .conflicts(time, None)
            .into_iter()
            .find(|b| b.id != *booking_id)
        {
            Some(existing) => Err(TimelineError::Overlapping {
                booking_id: existing.id,
            }),
            None => Ok(()),
        }
    }

    fn validate_status_changed(
        &self,
        booking_id: &BookingId,
        status: &BookingStatus,
    ) -> Result<(), TimelineError> {
        let booking = self
            .booking(*booking_id)
            .ok_or(TimelineError::BookingNotFound {
                booking_id: *booking_id,
            })?;
        match booking.status.can_transition_to(*status) {
            true => Ok(()),
            false => Err(TimelineError::InvalidStatusTransition {
                from: booking.status,
                to: *status,
            }),
        }
    }
}

impl Entity for Timeline {
    type Id = ResourceId;

    const ENTITY_NAME: &'static str = "timeline";

    fn id(&self) -> Self::Id {
        self.id
    }
}

impl Aggregation for Timeline {
    type Event = TimelineEvent;
    type Error = TimelineError;

    fn validate(&self, event: &Self::Event) -> Result<(), Self::Error> {
        match event {
            TimelineEvent::BookingScheduled { id, booking } => {
                self.validate_id(id)?;
                self.validate_scheduled(booking)
            }
            TimelineEvent::BookingMoved {
                id,
                booking_id,
                time,
                ..
            } => {
                self.validate_id(id)?;
                self.validate_moved(booking_id, time)
            }
            TimelineEvent::BookingStatusChanged {
                id,
                booking_id,
                status,
                ..
            } => {
                self.validate_id(id)?;
                self.validate_status_changed(booking_id, status)
            }
        }
    }

    fn apply(&mut self, event: Self::Event) {
        match event {
            TimelineEvent::BookingScheduled { id, booking } => {
                self.id = id;
                self.bookings.push(booking);
            }
            TimelineEvent::BookingMoved {
                booking_id,
                time,
                at,
                ..
            } => {
                if let Some(b) = self.bookings.iter_mut().find(|b| b.id == booking_id) {
                    if let Ok(minutes) = window_minutes(&time) {
                        b.duration_minutes = minutes;
                    }
                    b.time = time;
                    b.updated_at = at;
                }
            }
            TimelineEvent::BookingStatusChanged {
                booking_id,
                status,
                at,
                ..
            } => {
                if let Some(b) = self.bookings.iter_mut().find(|b| b.id == booking_id) {
                    b.status = status;
                    b.updated_at = at;
                }
            }
        }
    }

    fn events(&self) -> &EventQueue<Self::Event> {
        &self.events
    }

    fn events_mut(&mut self) -> &mut EventQueue<Self::Event> {
        &mut self.events
    }

    fn revision(&self) -> Option<u64> {
        self.revision
    }

    fn set_revision(&mut self, revision: Option<u64>) {
        self.revision = revision;
    }
}

impl PartialEq for Timeline {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.bookings == other.bookings
    }
}

impl Eq for Timeline {}

#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
pub enum TimelineError {
    #[display(fmt = "Mismatched id")]
    MismatchedId,
    #[display(fmt = "Booking duration must be a positive number of minutes")]
    InvalidDuration,
    #[display(fmt = "Booking window must be a whole number of minutes")]
    FractionalDuration,
    #[display(fmt = "Booking already exists on this timeline")]
    DuplicateBooking,
    #[display(fmt = "Booking {} does not exist on this timeline", booking_id)]
    BookingNotFound { booking_id: BookingId },
    #[display(fmt = "Only scheduled bookings can be moved")]
    NotMovable,
    #[display(fmt = "Time slot overlaps booking {}", booking_id)]
    Overlapping { booking_id: BookingId },
    #[display(fmt = "Booking cannot move from {} to {}", from, to)]
    InvalidStatusTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
}
