use std::ops::Range;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use derive_more::{Deref, Display, Error, From};
use serde::{Deserialize, Serialize};

use crate::domain::{Aggregation, DataAccessError, Entity, Event, EventQueue, Id};

use super::{AgencyId, BookingId, Location, ResourceId, ServiceTypeId, UserId};

/// Service request repository
#[async_trait]
pub trait ServiceRequestRepository: Send + Sync {
    async fn find_by_id(&self, id: RequestId) -> Result<Option<ServiceRequest>, DataAccessError>;
    /// Fails with [`DataAccessError::ConcurrencyError`] if the request changed since it was loaded.
    async fn save(&self, entity: &mut ServiceRequest) -> Result<bool, DataAccessError>;
}

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Deref, Default,
)]
pub struct RequestId(u64);

impl Id for RequestId {
    type Inner = u64;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    #[default]
    #[display(fmt = "pending")]
    Pending,
    #[display(fmt = "matched")]
    Matched,
    #[display(fmt = "accepted")]
    Accepted,
    #[display(fmt = "in_progress")]
    InProgress,
    #[display(fmt = "completed")]
    Completed,
    #[display(fmt = "cancelled")]
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Cancelled)
    }
}

/// Who is assigned to do the work. Agency assignment always names the member.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Assignment {
    Provider {
        resource_id: ResourceId,
    },
    AgencyMember {
        agency_id: AgencyId,
        resource_id: ResourceId,
    },
}

impl Assignment {
    pub fn resource_id(&self) -> ResourceId {
        match self {
            Assignment::Provider { resource_id } => *resource_id,
            Assignment::AgencyMember { resource_id, .. } => *resource_id,
        }
    }

    pub fn agency_id(&self) -> Option<AgencyId> {
        match self {
            Assignment::Provider { .. } => None,
            Assignment::AgencyMember { agency_id, .. } => Some(*agency_id),
        }
    }
}

/// Confirmed time window of a request together with the booking holding it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub booking_id: BookingId,
    pub time: Range<DateTime<Utc>>,
    pub duration_minutes: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ServiceRequestEvent {
    RequestCreated {
        id: RequestId,
        requester: UserId,
        service_type_id: ServiceTypeId,
        description: String,
        location: Location,
        status: RequestStatus,
        assignment: Option<Assignment>,
        scheduled_at: Option<DateTime<Utc>>,
        estimated_duration_minutes: Option<u32>,
        slot: Option<Slot>,
        at: DateTime<Utc>,
    },
    RequestAccepted {
        id: RequestId,
        assignment: Assignment,
        slot: Slot,
        at: DateTime<Utc>,
    },
    RequestRescheduled {
        id: RequestId,
        slot: Slot,
        at: DateTime<Utc>,
    },
    RequestStarted {
        id: RequestId,
        at: DateTime<Utc>,
    },
    RequestCompleted {
        id: RequestId,
        at: DateTime<Utc>,
    },
    RequestCancelled {
        id: RequestId,
        by: UserId,
        at: DateTime<Utc>,
    },
}

impl Event for ServiceRequestEvent {
    type Id = RequestId;
}

/// Everything needed to open a request, decided by the caller's role.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestDraft {
    pub requester: UserId,
    pub service_type_id: ServiceTypeId,
    pub description: String,
    pub location: Location,
    pub assignment: Option<Assignment>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub estimated_duration_minutes: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceRequest {
    id: RequestId,
    requester: UserId,
    service_type_id: ServiceTypeId,
    assignment: Option<Assignment>,
    status: RequestStatus,
    description: String,
    location: Option<Location>,
    scheduled_at: Option<DateTime<Utc>>,
    estimated_duration_minutes: Option<u32>,
    estimated_end_time: Option<DateTime<Utc>>,
    booking_id: Option<BookingId>,
    completed_at: Option<DateTime<Utc>>,
    cancelled_by: Option<UserId>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(skip)]
    revision: Option<u64>,
    #[serde(skip)]
    events: EventQueue<ServiceRequestEvent>,
}

impl ServiceRequest {
    /// Opens a request with nobody assigned, or pre-paired with a resource.
    pub fn create(
        id: RequestId,
        draft: RequestDraft,
        at: DateTime<Utc>,
    ) -> Result<Self, RequestError> {
        let status = match draft.assignment {
            Some(_) => RequestStatus::Matched,
            None => RequestStatus::Pending,
        };
        Self::create_with(id, draft, status, None, at)
    }

    /// Opens a request that is accepted from the start, holding `slot` for the assigned resource.
    pub fn create_accepted(
        id: RequestId,
        draft: RequestDraft,
        slot: Slot,
        at: DateTime<Utc>,
    ) -> Result<Self, RequestError> {
        Self::create_with(id, draft, RequestStatus::Accepted, Some(slot), at)
    }

    fn create_with(
        id: RequestId,
        draft: RequestDraft,
        status: RequestStatus,
        slot: Option<Slot>,
        at: DateTime<Utc>,
    ) -> Result<Self, RequestError> {
        let mut entity = ServiceRequest::default();
        entity.record(ServiceRequestEvent::RequestCreated {
            id,
            requester: draft.requester,
            service_type_id: draft.service_type_id,
            description: draft.description,
            location: draft.location,
            status,
            assignment: draft.assignment,
            scheduled_at: draft.scheduled_at,
            estimated_duration_minutes: draft.estimated_duration_minutes,
            slot,
            at,
        })?;
        Ok(entity)
    }

    pub fn accept(
        &mut self,
        assignment: Assignment,
        slot: Slot,
        at: DateTime<Utc>,
    ) -> Result<(), RequestError> {
        self.record(ServiceRequestEvent::RequestAccepted {
            id: self.id,
            assignment,
            slot,
            at,
        })
    }

    pub fn reschedule(&mut self, slot: Slot, at: DateTime<Utc>) -> Result<(), RequestError> {
        self.record(ServiceRequestEvent::RequestRescheduled {
            id: self.id,
            slot,
            at,
        })
    }

    pub fn start(&mut self, at: DateTime<Utc>) -> Result<(), RequestError> {
        self.record(ServiceRequestEvent::RequestStarted { id: self.id, at })
    }

    pub fn complete(&mut self, at: DateTime<Utc>) -> Result<(), RequestError> {
        self.record(ServiceRequestEvent::RequestCompleted { id: self.id, at })
    }

    pub fn cancel(&mut self, by: UserId, at: DateTime<Utc>) -> Result<(), RequestError> {
        self.record(ServiceRequestEvent::RequestCancelled { id: self.id, by, at })
    }

    /// Checks that an accept for `assignment` could be recorded right now.
    pub fn validate_accept(&self, assignment: &Assignment) -> Result<(), RequestError> {
        self.validate_transition(RequestStatus::Accepted)?;
        self.validate_assignment(assignment)
    }

    pub fn requester(&self) -> UserId {
        self.requester
    }

    pub fn service_type_id(&self) -> ServiceTypeId {
        self.service_type_id
    }

    pub fn assignment(&self) -> Option<Assignment> {
        self.assignment
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn location(&self) -> Option<&Location> {
        self.location.as_ref()
    }

    pub fn scheduled_at(&self) -> Option<DateTime<Utc>> {
        self.scheduled_at
    }

    pub fn estimated_duration_minutes(&self) -> Option<u32> {
        self.estimated_duration_minutes
    }

    pub fn estimated_end_time(&self) -> Option<DateTime<Utc>> {
        self.estimated_end_time
    }

    /// The requested window, when both start and duration are known.
    pub fn window(&self) -> Option<Range<DateTime<Utc>>> {
        Some(self.scheduled_at?..self.estimated_end_time?)
    }

    pub fn booking_id(&self) -> Option<BookingId> {
        self.booking_id
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn cancelled_by(&self) -> Option<UserId> {
        self.cancelled_by
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn validate_id(&self, id: &RequestId) -> Result<(), RequestError> {
        match self.id == *id {
            true => Ok(()),
            false => Err(RequestError::MismatchedId),
        }
    }

    fn validate_transition(&self, to: RequestStatus) -> Result<(), RequestError> {
        use RequestStatus::*;
        if self.status.is_terminal() {
            return Err(RequestError::AlreadyTerminal {
                status: self.status,
            });
        }
        let legal = match to {
            Accepted => matches!(self.status, Pending | Matched),
            InProgress => self.status == Accepted,
            Completed => self.status == InProgress,
            Cancelled => true,
            Pending | Matched => false,
        };
        match legal {
            true => Ok(()),
            false => Err(RequestError::InvalidTransition {
                from: self.status,
                to,
            }),
        }
    }

    /// A pre-paired request can only be accepted by the resource it was paired with.
    fn validate_assignment(&self, assignment: &Assignment) -> Result<(), RequestError> {
        match self.assignment {
            Some(current) if current.resource_id() != assignment.resource_id() => {
                Err(RequestError::AssignmentMismatch)
            }
            _ => Ok(()),
        }
    }

    fn validate_slot(slot: &Slot) -> Result<(), RequestError> {
        let length = slot.time.end - slot.time.start;
        if slot.duration_minutes == 0
            || length != Duration::minutes(i64::from(slot.duration_minutes))
        {
            return Err(RequestError::InvalidSchedule);
        }
        Ok(())
    }

    fn validate_created(
        &self,
        description: &str,
        status: RequestStatus,
        assignment: &Option<Assignment>,
        estimated_duration_minutes: Option<u32>,
        slot: &Option<Slot>,
    ) -> Result<(), RequestError> {
        if self.revision.is_some() || self.has_changes() {
            return Err(RequestError::AlreadyCreated);
        }
        if description.trim().is_empty() {
            return Err(RequestError::DescriptionRequired);
        }
        if estimated_duration_minutes == Some(0) {
            return Err(RequestError::InvalidSchedule);
        }
        match (status, assignment, slot) {
            (RequestStatus::Pending, None, None) => Ok(()),
            (RequestStatus::Matched, Some(_), None) => Ok(()),
            (RequestStatus::Accepted, Some(_), Some(slot)) => Self::validate_slot(slot),
            (RequestStatus::Matched | RequestStatus::Accepted, None, _) => {
                Err(RequestError::MissingAssignment)
            }
            (RequestStatus::Accepted, Some(_), None) => Err(RequestError::InvalidSchedule),
            (from, _, _) => Err(RequestError::InvalidTransition {
                from,
                to: status,
            }),
        }
    }

    fn set_slot(&mut self, slot: Slot) {
        self.booking_id = Some(slot.booking_id);
        self.scheduled_at = Some(slot.time.start);
        self.estimated_duration_minutes = Some(slot.duration_minutes);
        self.estimated_end_time = Some(slot.time.end);
    }
}

impl Entity for ServiceRequest {
    type Id = RequestId;

    const ENTITY_NAME: &'static str = "request";

    fn id(&self) -> Self::Id {
        self.id
    }
}

impl Aggregation for ServiceRequest {
    type Event = ServiceRequestEvent;
    type Error = RequestError;

    fn validate(&self, event: &Self::Event) -> Result<(), Self::Error> {
        match event {
            ServiceRequestEvent::RequestCreated {
                description,
                status,
                assignment,
                estimated_duration_minutes,
                slot,
                ..
            } => self.validate_created(
                description,
                *status,
                assignment,
                *estimated_duration_minutes,
                slot,
            ),
            ServiceRequestEvent::RequestAccepted {
                id,
                assignment,
                slot,
                ..
            } => {
                self.validate_id(id)?;
                self.validate_accept(assignment)?;
                Self::validate_slot(slot)
            }
            ServiceRequestEvent::RequestRescheduled { id, slot, .. } => {
                self.validate_id(id)?;
                if self.status.is_terminal() {
                    return Err(RequestError::AlreadyTerminal {
                        status: self.status,
                    });
                }
                if self.status != RequestStatus::Accepted {
                    return Err(RequestError::InvalidTransition {
                        from: self.status,
                        to: RequestStatus::Accepted,
                    });
                }
                if self.booking_id != Some(slot.booking_id) {
                    return Err(RequestError::AssignmentMismatch);
                }
                Self::validate_slot(slot)
            }
            ServiceRequestEvent::RequestStarted { id, .. } => {
                self.validate_id(id)?;
                self.validate_transition(RequestStatus::InProgress)
            }
            ServiceRequestEvent::RequestCompleted { id, .. } => {
                self.validate_id(id)?;
                self.validate_transition(RequestStatus::Completed)
            }
            ServiceRequestEvent::RequestCancelled { id, .. } => {
                self.validate_id(id)?;
                self.validate_transition(RequestStatus::Cancelled)
            }
        }
    }

    fn apply(&mut self, event: Self::Event) {
        match event {
            ServiceRequestEvent::RequestCreated {
                id,
                requester,
                service_type_id,
                description,
                location,
                status,
                assignment,
                scheduled_at,
                estimated_duration_minutes,
                slot,
                at,
            } => {
                self.id = id;
                self.requester = requester;
                self.service_type_id = service_type_id;
                self.description = description;
                self.location = Some(location);
                self.status = status;
                self.assignment = assignment;
                self.scheduled_at = scheduled_at;
                self.estimated_duration_minutes = estimated_duration_minutes;
                self.estimated_end_time = match (scheduled_at, estimated_duration_minutes) {
                    (Some(start), Some(minutes)) => {
                        Some(start + Duration::minutes(i64::from(minutes)))
                    }
                    _ => None,
                };
                if let Some(slot) = slot {
                    self.set_slot(slot);
                }
                self.created_at = at;
                self.updated_at = at;
            }
            ServiceRequestEvent::RequestAccepted {
                assignment,
                slot,
                at,
                ..
            } => {
                self.status = RequestStatus::Accepted;
                self.assignment = Some(assignment);
                self.set_slot(slot);
                self.updated_at = at;
            }
            ServiceRequestEvent::RequestRescheduled { slot, at, .. } => {
                self.set_slot(slot);
                self.updated_at = at;
            }
            ServiceRequestEvent::RequestStarted { at, .. } => {
                self.status = RequestStatus::InProgress;
                self.updated_at = at;
            }
            ServiceRequestEvent::RequestCompleted { at, .. } => {
                self.status = RequestStatus::Completed;
                self.completed_at = Some(at);
                self.updated_at = at;
            }
            ServiceRequestEvent::RequestCancelled { by, at, .. } => {
                self.status = RequestStatus::Cancelled;
                self.cancelled_by = Some(by);
                self.updated_at = at;
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

impl PartialEq for ServiceRequest {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.requester == other.requester
            && self.service_type_id == other.service_type_id
            && self.assignment == other.assignment
            && self.status == other.status
            && self.description == other.description
            && self.location == other.location
            && self.scheduled_at == other.scheduled_at
            && self.estimated_duration_minutes == other.estimated_duration_minutes
            && self.estimated_end_time == other.estimated_end_time
            && self.booking_id == other.booking_id
            && self.completed_at == other.completed_at
            && self.cancelled_by == other.cancelled_by
    }
}

#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[display(fmt = "Mismatched id")]
    MismatchedId,
    #[display(fmt = "Request already exists")]
    AlreadyCreated,
    #[display(fmt = "Description is not specified")]
    DescriptionRequired,
    #[display(fmt = "A resource must be assigned")]
    MissingAssignment,
    #[display(fmt = "Scheduled window and duration do not agree")]
    InvalidSchedule,
    #[display(fmt = "Request is paired with another resource")]
    AssignmentMismatch,
    #[display(fmt = "Request is already {}", status)]
    AlreadyTerminal { status: RequestStatus },
    #[display(fmt = "Request cannot move from {} to {}", from, to)]
    InvalidTransition {
        from: RequestStatus,
        to: RequestStatus,
    },
}
