use std::{ops::Range, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    domain::{
        core::{
            window_minutes, Agency, AgencyId, AgencyRepository, Assignment, Booking, BookingId,
            BookingStatus, Contact, GeoPoint, Location, Rating, RatingSummary, RequestDraft,
            RequestError, RequestId, RequestStatus, Resource, ResourceError, ResourceId,
            ResourceKind, ResourceRepository, ResourceSearch, Review, ReviewEdit, ReviewId,
            ReviewRepository, ServiceOffering, ServiceRequest, ServiceRequestRepository,
            ServiceTypeId, Slot, TimelineError, TimelineRepository, UserId,
        },
        Aggregation, Clock, DataAccessError, Entity, IdGenerator,
    },
    Booking as BookingConfig,
};

use super::{
    authorize, bounded, Actor, AuthContext, AvailabilityReport, AvailabilityResolver,
    BookingLedger, Command, GeoQuery, NearbyResource, Notification, Notifier, Permission,
    RatingAggregator, Role, SearchFilters, ServiceError, ServiceResult,
};

/// Storage collaborators of the marketplace.
#[derive(Clone)]
pub struct Repositories {
    pub agencies: Arc<dyn AgencyRepository>,
    pub resources: Arc<dyn ResourceRepository>,
    pub requests: Arc<dyn ServiceRequestRepository>,
    pub timelines: Arc<dyn TimelineRepository>,
    pub reviews: Arc<dyn ReviewRepository>,
    pub search: Arc<dyn ResourceSearch>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct NewRequest {
    pub requester: UserId,
    pub service_type_id: ServiceTypeId,
    pub description: String,
    pub location: Location,
    #[serde(default)]
    pub resource_id: Option<ResourceId>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub estimated_duration_minutes: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct NewResource {
    pub display_name: String,
    #[serde(default)]
    pub contact: Contact,
    pub kind: ResourceKind,
    #[serde(default)]
    pub offerings: Vec<ServiceOffering>,
}

/// A request together with the booking that holds its slot.
#[derive(Clone, Debug, Serialize)]
pub struct Acceptance {
    pub request: ServiceRequest,
    pub booking: Booking,
}

/// The operation surface of the booking core. Stateless between calls; every caller
/// passes the acting user explicitly.
pub struct Marketplace {
    repos: Repositories,
    geo: GeoQuery,
    availability: AvailabilityResolver,
    ledger: BookingLedger,
    ratings: RatingAggregator,
    notifier: Arc<dyn Notifier>,
    ids: Arc<IdGenerator>,
    clock: Arc<dyn Clock>,
    settings: BookingConfig,
}

impl Marketplace {
    pub fn new(
        repos: Repositories,
        notifier: Arc<dyn Notifier>,
        ids: Arc<IdGenerator>,
        clock: Arc<dyn Clock>,
        settings: BookingConfig,
    ) -> Self {
        let timeout = settings.store_timeout();
        Self {
            geo: GeoQuery::new(
                repos.search.clone(),
                repos.resources.clone(),
                repos.agencies.clone(),
                timeout,
                settings.search_limit,
            ),
            availability: AvailabilityResolver::new(
                repos.resources.clone(),
                repos.timelines.clone(),
                timeout,
            ),
            ledger: BookingLedger::new(repos.timelines.clone(), ids.clone(), clock.clone(), timeout),
            ratings: RatingAggregator::new(
                repos.reviews.clone(),
                repos.resources.clone(),
                notifier.clone(),
                timeout,
            ),
            repos,
            notifier,
            ids,
            clock,
            settings,
        }
    }

    pub async fn search_resources(
        &self,
        point: GeoPoint,
        radius_meters: f64,
        service_type_id: Option<ServiceTypeId>,
        filters: SearchFilters,
    ) -> ServiceResult<Vec<NearbyResource>> {
        self.geo
            .find_nearby(point, radius_meters, service_type_id, filters)
            .await
    }

    pub async fn check_availability(
        &self,
        resource_ids: &[ResourceId],
        service_type_id: ServiceTypeId,
        window: Range<DateTime<Utc>>,
        exclude_request: Option<RequestId>,
    ) -> ServiceResult<AvailabilityReport> {
        self.availability
            .check(resource_ids, service_type_id, &window, exclude_request)
            .await
    }

    /// Opens a request. Customers and admins create `pending` or pre-paired `matched` requests;
    /// a provider naming its own resource creates an `accepted` request holding a booking.
    pub async fn create_request(
        &self,
        actor: &Actor,
        new: NewRequest,
    ) -> ServiceResult<ServiceRequest> {
        if new.description.trim().is_empty() {
            return Err(ServiceError::Validation("description is required".to_owned()));
        }
        if new.estimated_duration_minutes == Some(0) {
            return Err(ServiceError::Validation(
                "estimated duration must be positive".to_owned(),
            ));
        }

        let target = match new.resource_id {
            Some(resource_id) => {
                let resource = self.resource(resource_id).await?;
                let agency = self.agency_of(&resource).await?;
                Some((resource, agency))
            }
            None => None,
        };
        let self_service =
            matches!(actor.role, Role::Provider | Role::Agency) && target.is_some();
        let command = match self_service {
            true => Command::SelfServiceRequest,
            false => Command::CreateRequest,
        };
        ensure(
            actor,
            command,
            &AuthContext {
                requester: Some(new.requester),
                resource: target.as_ref().map(|(r, _)| r),
                agency: target.as_ref().and_then(|(_, a)| a.as_ref()),
                ..Default::default()
            },
        )?;

        let assignment = match &target {
            Some((resource, _)) => {
                if !resource.offers(new.service_type_id) {
                    return Err(not_offered(resource, new.service_type_id));
                }
                Some(assignment_for(resource))
            }
            None => None,
        };
        let draft = RequestDraft {
            requester: new.requester,
            service_type_id: new.service_type_id,
            description: new.description,
            location: new.location,
            assignment,
            scheduled_at: new.scheduled_at,
            estimated_duration_minutes: new.estimated_duration_minutes,
        };
        let id: RequestId = self.ids.generate();
        let now = self.clock.now();

        let request = match self_service {
            true => self.create_self_service(id, draft, now).await?,
            false => {
                let mut request = ServiceRequest::create(id, draft, now)?;
                self.save_request(&mut request).await?;
                request
            }
        };
        info!(
            "request {} opened by user {} as {}",
            id,
            actor.user_id,
            request.status()
        );
        self.request_changed(&request);
        Ok(request)
    }

    async fn create_self_service(
        &self,
        id: RequestId,
        draft: RequestDraft,
        now: DateTime<Utc>,
    ) -> ServiceResult<ServiceRequest> {
        let (start, minutes) = match (draft.scheduled_at, draft.estimated_duration_minutes) {
            (Some(start), Some(minutes)) => (start, minutes),
            _ => {
                return Err(ServiceError::Validation(
                    "self-service requests need a start time and a duration".to_owned(),
                ))
            }
        };
        let resource_id = draft
            .assignment
            .map(|a| a.resource_id())
            .ok_or_else(|| ServiceError::from(RequestError::MissingAssignment))?;

        let booking = self
            .ledger
            .create_booking(resource_id, id, draft.service_type_id, start, minutes)
            .await?
            .booking;
        let mut request = match ServiceRequest::create_accepted(id, draft, slot_of(&booking), now) {
            Ok(request) => request,
            Err(e) => {
                self.release(&booking).await;
                return Err(e.into());
            }
        };
        match self.save_request(&mut request).await {
            Ok(_) => {}
            Err(DataAccessError::Timeout) => return Err(ServiceError::StoreTimeout),
            Err(e) => {
                self.release(&booking).await;
                return Err(e.into());
            }
        }
        self.slot_changed(&booking, false);
        Ok(request)
    }

    /// Pairs a request with a resource and window, creating exactly one booking.
    ///
    /// Repeating an accept that already succeeded returns the existing booking.
    pub async fn accept_request(
        &self,
        actor: &Actor,
        request_id: RequestId,
        resource_id: ResourceId,
        window: Range<DateTime<Utc>>,
    ) -> ServiceResult<Acceptance> {
        let minutes = window_minutes(&window)?;
        let mut request = self.request(request_id).await?;
        let resource = self.resource(resource_id).await?;
        let agency = self.agency_of(&resource).await?;
        ensure(
            actor,
            Command::AcceptRequest,
            &AuthContext {
                requester: Some(request.requester()),
                resource: Some(&resource),
                agency: agency.as_ref(),
                ..Default::default()
            },
        )?;

        if let Some(booking) = self.accepted_booking(&request, resource_id, &window).await? {
            debug!("request {} already accepted for this window", request_id);
            return Ok(Acceptance { request, booking });
        }
        if request.status() == RequestStatus::Accepted {
            return Err(ServiceError::Conflict(format!(
                "request {} is already accepted",
                request_id
            )));
        }
        let assignment = assignment_for(&resource);
        request.validate_accept(&assignment)?;
        if !resource.offers(request.service_type_id()) {
            return Err(not_offered(&resource, request.service_type_id()));
        }

        let reservation = self
            .ledger
            .create_booking(
                resource_id,
                request_id,
                request.service_type_id(),
                window.start,
                minutes,
            )
            .await?;
        let booking = reservation.booking;
        let committed = match request.accept(assignment, slot_of(&booking), self.clock.now()) {
            Ok(()) => self.save_request(&mut request).await.map_err(ServiceError::from),
            Err(e) => Err(e.into()),
        };
        match committed {
            Ok(_) => {}
            Err(ServiceError::StoreTimeout) => return Err(ServiceError::StoreTimeout),
            Err(e) => {
                if reservation.created && !self.booking_claimed(request_id, booking.id()).await {
                    self.release(&booking).await;
                }
                warn!("accept of request {} lost: {}", request_id, e);
                return Err(e);
            }
        }

        info!(
            "request {} accepted by resource {} with booking {}",
            request_id,
            resource_id,
            booking.id()
        );
        self.release_strays(request_id, Some(booking.id())).await;
        self.request_changed(&request);
        self.slot_changed(&booking, false);
        Ok(Acceptance { request, booking })
    }

    /// Advances a booking and mirrors the change onto its request.
    pub async fn update_booking_status(
        &self,
        actor: &Actor,
        booking_id: BookingId,
        status: BookingStatus,
    ) -> ServiceResult<Booking> {
        if status == BookingStatus::Scheduled {
            return Err(ServiceError::InvalidTransition(
                "bookings never return to scheduled".to_owned(),
            ));
        }
        let resource_id = self.ledger.locate(booking_id).await?;
        let booking = self
            .ledger
            .timeline(resource_id)
            .await?
            .booking(booking_id)
            .cloned()
            .ok_or_else(|| ServiceError::not_found("booking", *booking_id))?;
        let resource = self.resource(resource_id).await?;
        let agency = self.agency_of(&resource).await?;
        let mut request = self.request(booking.request_id()).await?;
        ensure(
            actor,
            Command::UpdateBooking,
            &AuthContext {
                requester: Some(request.requester()),
                resource: Some(&resource),
                agency: agency.as_ref(),
                ..Default::default()
            },
        )?;

        let current = request.booking_id() == Some(booking_id)
            && request.assignment().map(|a| a.resource_id()) == Some(resource_id);
        if !current {
            return self.cancel_stray(&request, booking, status).await;
        }

        let repair = booking.status() == status;
        if repair && mirrors(request.status(), status) {
            return Err(ServiceError::InvalidTransition(format!(
                "booking {} is already {}",
                booking_id, status
            )));
        }
        if !repair && !booking.status().can_transition_to(status) {
            return Err(TimelineError::InvalidStatusTransition {
                from: booking.status(),
                to: status,
            }
            .into());
        }
        let now = self.clock.now();
        mirror(&mut request, status, actor.user_id, now)?;

        let booking = match repair {
            true => {
                warn!(
                    "request {} lagged behind booking {}, repairing",
                    request.id(),
                    booking_id
                );
                booking
            }
            false => {
                self.ledger
                    .update_status(resource_id, booking_id, status)
                    .await?
                    .booking
            }
        };
        let request = self.commit_mirror(request, status, actor.user_id).await?;

        self.request_changed(&request);
        if status == BookingStatus::Cancelled {
            self.slot_changed(&booking, true);
        }
        Ok(booking)
    }

    /// A booking its request no longer points at can only be cancelled, and that leaves
    /// the request alone.
    async fn cancel_stray(
        &self,
        request: &ServiceRequest,
        booking: Booking,
        status: BookingStatus,
    ) -> ServiceResult<Booking> {
        if status != BookingStatus::Cancelled {
            return Err(ServiceError::Conflict(format!(
                "booking {} is not the current booking of request {}",
                booking.id(),
                request.id()
            )));
        }
        if !booking.status().can_transition_to(status) {
            return Err(TimelineError::InvalidStatusTransition {
                from: booking.status(),
                to: status,
            }
            .into());
        }
        let released = self
            .ledger
            .update_status(booking.resource_id(), booking.id(), status)
            .await?;
        warn!(
            "cancelled booking {} left behind by request {}",
            booking.id(),
            request.id()
        );
        if released.changed {
            self.slot_changed(&released.booking, true);
        }
        Ok(released.booking)
    }

    /// Saves a mirrored request, re-deriving the mirror if the request moved meanwhile.
    async fn commit_mirror(
        &self,
        mut request: ServiceRequest,
        status: BookingStatus,
        by: UserId,
    ) -> ServiceResult<ServiceRequest> {
        for _ in 0..3 {
            match self.save_request(&mut request).await {
                Ok(_) => return Ok(request),
                Err(DataAccessError::ConcurrencyError(_)) => {
                    request = self.request(request.id()).await?;
                    if mirrors(request.status(), status) {
                        return Ok(request);
                    }
                    mirror(&mut request, status, by, self.clock.now())?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ServiceError::Conflict(format!(
            "request {} kept changing, booking is {} but the request lags",
            request.id(),
            status
        )))
    }

    /// Moves an accepted request, and its booking, to another window of the same resource.
    pub async fn reschedule_request(
        &self,
        actor: &Actor,
        request_id: RequestId,
        window: Range<DateTime<Utc>>,
    ) -> ServiceResult<Acceptance> {
        let minutes = window_minutes(&window)?;
        let mut request = self.request(request_id).await?;
        let resource_id = request
            .assignment()
            .map(|a| a.resource_id())
            .ok_or_else(|| {
                ServiceError::InvalidTransition(format!(
                    "request {} has no resource to reschedule with",
                    request_id
                ))
            })?;
        let resource = self.resource(resource_id).await?;
        let agency = self.agency_of(&resource).await?;
        ensure(
            actor,
            Command::RescheduleRequest,
            &AuthContext {
                requester: Some(request.requester()),
                resource: Some(&resource),
                agency: agency.as_ref(),
                ..Default::default()
            },
        )?;

        let booking_id = match (request.status(), request.booking_id()) {
            (RequestStatus::Accepted, Some(booking_id)) => booking_id,
            (status, _) if status.is_terminal() => {
                return Err(RequestError::AlreadyTerminal { status }.into())
            }
            (status, _) => {
                return Err(RequestError::InvalidTransition {
                    from: status,
                    to: RequestStatus::Accepted,
                }
                .into())
            }
        };
        let previous = request.window();
        if previous.as_ref() == Some(&window) {
            let booking = self.ledger.booking(booking_id).await?;
            return Ok(Acceptance { request, booking });
        }

        request.reschedule(
            Slot {
                booking_id,
                time: window.clone(),
                duration_minutes: minutes,
            },
            self.clock.now(),
        )?;
        let booking = self
            .ledger
            .move_booking(resource_id, booking_id, window)
            .await?;
        match self.save_request(&mut request).await {
            Ok(_) => {}
            Err(DataAccessError::Timeout) => return Err(ServiceError::StoreTimeout),
            Err(e) => {
                if let Some(previous) = previous {
                    if let Err(undo) = self
                        .ledger
                        .move_booking(resource_id, booking_id, previous)
                        .await
                    {
                        warn!("booking {} left at new window: {}", booking_id, undo);
                    }
                }
                return Err(e.into());
            }
        }

        info!(
            "request {} rescheduled to {} - {}",
            request_id,
            booking.start_time(),
            booking.end_time()
        );
        if let Some(previous) = previous {
            self.notifier.emit(Notification::AvailabilityChanged {
                resource_id,
                time: previous,
                available: true,
            });
        }
        self.slot_changed(&booking, false);
        self.request_changed(&request);
        Ok(Acceptance { request, booking })
    }

    /// Cancels a request and releases its booking.
    pub async fn cancel_request(
        &self,
        actor: &Actor,
        request_id: RequestId,
    ) -> ServiceResult<ServiceRequest> {
        let mut request = self.request(request_id).await?;
        let target = match request.assignment() {
            Some(assignment) => {
                let resource = self.resource(assignment.resource_id()).await?;
                let agency = self.agency_of(&resource).await?;
                Some((resource, agency))
            }
            None => None,
        };
        ensure(
            actor,
            Command::CancelRequest,
            &AuthContext {
                requester: Some(request.requester()),
                resource: target.as_ref().map(|(r, _)| r),
                agency: target.as_ref().and_then(|(_, a)| a.as_ref()),
                ..Default::default()
            },
        )?;
        let held = request
            .assignment()
            .zip(request.booking_id())
            .map(|(a, b)| (a.resource_id(), b));

        if request.status() == RequestStatus::Cancelled {
            // an earlier cancel may have stopped before releasing the booking
            let released = match held {
                Some((resource_id, booking_id)) => {
                    self.ledger
                        .update_status(resource_id, booking_id, BookingStatus::Cancelled)
                        .await?
                }
                None => return Err(already_cancelled()),
            };
            if !released.changed {
                return Err(already_cancelled());
            }
            warn!("finished releasing booking {}", released.booking.id());
            self.slot_changed(&released.booking, true);
            return Ok(request);
        }

        request.cancel(actor.user_id, self.clock.now())?;
        self.save_request(&mut request).await?;
        info!("request {} cancelled by user {}", request_id, actor.user_id);

        if let Some((resource_id, booking_id)) = held {
            let released = self
                .ledger
                .update_status(resource_id, booking_id, BookingStatus::Cancelled)
                .await?;
            if released.changed {
                self.slot_changed(&released.booking, true);
            }
        }
        self.release_strays(request_id, None).await;
        self.request_changed(&request);
        Ok(request)
    }

    /// Reviews a finished request. One review per request.
    pub async fn submit_review(
        &self,
        actor: &Actor,
        request_id: RequestId,
        rating: u8,
        comment: Option<String>,
    ) -> ServiceResult<Review> {
        let rating = Rating::new(rating)?;
        let comment = comment
            .map(|c| c.trim().to_owned())
            .filter(|c| !c.is_empty());
        let request = self.request(request_id).await?;
        ensure(
            actor,
            Command::SubmitReview,
            &AuthContext {
                requester: Some(request.requester()),
                ..Default::default()
            },
        )?;
        let resource_id = match (request.status().is_terminal(), request.assignment()) {
            (true, Some(assignment)) => assignment.resource_id(),
            _ => {
                return Err(ServiceError::Conflict(format!(
                    "request {} is {} and cannot be reviewed yet",
                    request_id,
                    request.status()
                )))
            }
        };
        if bounded(self.timeout(), self.repos.reviews.find_by_request(request_id))
            .await?
            .is_some()
        {
            return Err(already_reviewed(request_id));
        }

        let mut review = Review::submit(
            request_id,
            resource_id,
            actor.user_id,
            rating,
            comment,
            self.clock.now(),
        )?;
        match bounded(self.timeout(), self.repos.reviews.save(&mut review)).await {
            Ok(_) => {}
            Err(DataAccessError::ConcurrencyError(_)) => return Err(already_reviewed(request_id)),
            Err(e) => return Err(e.into()),
        }
        info!(
            "review {} of resource {} rated {}",
            review.id(),
            resource_id,
            rating
        );
        self.refresh_rating(resource_id).await;
        Ok(review)
    }

    /// Author-only edit within the configured window. A changed rating is re-aggregated.
    pub async fn edit_review(
        &self,
        actor: &Actor,
        review_id: ReviewId,
        edit: ReviewEdit,
    ) -> ServiceResult<Review> {
        let mut review = self.review(review_id).await?;
        ensure(
            actor,
            Command::EditReview,
            &AuthContext {
                review_author: Some(review.author()),
                ..Default::default()
            },
        )?;
        let rating_changed =
            review.edit(edit, self.clock.now(), self.settings.review_edit_window())?;
        if review.has_changes() {
            bounded(self.timeout(), self.repos.reviews.save(&mut review)).await?;
            info!("review {} edited", review_id);
        }
        if rating_changed {
            self.refresh_rating(review.resource_id()).await;
        }
        Ok(review)
    }

    /// One-time public answer from the reviewed resource.
    pub async fn respond_to_review(
        &self,
        actor: &Actor,
        review_id: ReviewId,
        text: String,
    ) -> ServiceResult<Review> {
        let mut review = self.review(review_id).await?;
        let resource = self.resource(review.resource_id()).await?;
        let agency = self.agency_of(&resource).await?;
        ensure(
            actor,
            Command::RespondToReview,
            &AuthContext {
                resource: Some(&resource),
                agency: agency.as_ref(),
                ..Default::default()
            },
        )?;
        review.respond(text.trim().to_owned(), self.clock.now())?;
        bounded(self.timeout(), self.repos.reviews.save(&mut review)).await?;
        info!("review {} answered", review_id);
        Ok(review)
    }

    pub async fn recompute_rating(
        &self,
        actor: &Actor,
        resource_id: ResourceId,
    ) -> ServiceResult<RatingSummary> {
        let resource = self.resource(resource_id).await?;
        let agency = self.agency_of(&resource).await?;
        ensure(
            actor,
            Command::RecomputeRating,
            &AuthContext {
                resource: Some(&resource),
                agency: agency.as_ref(),
                ..Default::default()
            },
        )?;
        self.ratings.recompute(resource_id).await
    }

    pub async fn register_agency(
        &self,
        actor: &Actor,
        name: String,
        location: Location,
    ) -> ServiceResult<Agency> {
        ensure(actor, Command::RegisterAgency, &AuthContext::default())?;
        let mut agency = Agency::register(self.ids.generate(), name, actor.user_id, location)?;
        bounded(self.timeout(), self.repos.agencies.save(&mut agency)).await?;
        info!("agency {} registered by user {}", agency.id(), actor.user_id);
        Ok(agency)
    }

    pub async fn register_resource(
        &self,
        actor: &Actor,
        new: NewResource,
    ) -> ServiceResult<Resource> {
        let mut resource = Resource::register(
            self.ids.generate(),
            new.display_name,
            new.contact,
            new.kind,
            new.offerings,
        )?;
        let agency = self.agency_of(&resource).await?;
        ensure(
            actor,
            Command::RegisterResource,
            &AuthContext {
                resource: Some(&resource),
                agency: agency.as_ref(),
                ..Default::default()
            },
        )?;
        bounded(self.timeout(), self.repos.resources.save(&mut resource)).await?;
        info!("resource {} registered", resource.id());
        Ok(resource)
    }

    pub async fn set_availability(
        &self,
        actor: &Actor,
        resource_id: ResourceId,
        is_available: bool,
    ) -> ServiceResult<Resource> {
        self.update_resource(actor, resource_id, Command::ManageResource, |r| {
            r.change_availability(is_available)
        })
        .await
    }

    pub async fn add_offering(
        &self,
        actor: &Actor,
        resource_id: ResourceId,
        offering: ServiceOffering,
    ) -> ServiceResult<Resource> {
        self.update_resource(actor, resource_id, Command::ManageResource, |r| {
            r.add_offering(offering)
        })
        .await
    }

    pub async fn remove_offering(
        &self,
        actor: &Actor,
        resource_id: ResourceId,
        service_type_id: ServiceTypeId,
    ) -> ServiceResult<Resource> {
        self.update_resource(actor, resource_id, Command::ManageResource, |r| {
            r.remove_offering(service_type_id)
        })
        .await
    }

    pub async fn verify_resource(
        &self,
        actor: &Actor,
        resource_id: ResourceId,
    ) -> ServiceResult<Resource> {
        let now = self.clock.now();
        self.update_resource(actor, resource_id, Command::VerifyResource, |r| {
            r.verify(actor.user_id, now)
        })
        .await
    }

    pub async fn get_request(&self, request_id: RequestId) -> ServiceResult<ServiceRequest> {
        self.request(request_id).await
    }

    pub async fn get_booking(&self, booking_id: BookingId) -> ServiceResult<Booking> {
        self.ledger.booking(booking_id).await
    }

    pub async fn get_resource(&self, resource_id: ResourceId) -> ServiceResult<Resource> {
        self.resource(resource_id).await
    }

    /// Bookings of a resource in start order, cancelled ones included.
    pub async fn list_resource_bookings(
        &self,
        resource_id: ResourceId,
    ) -> ServiceResult<Vec<Booking>> {
        self.resource(resource_id).await?;
        let mut bookings = self.ledger.timeline(resource_id).await?.bookings().to_vec();
        bookings.sort_by_key(|b| (b.start_time(), *b.id()));
        Ok(bookings)
    }

    async fn update_resource<F>(
        &self,
        actor: &Actor,
        resource_id: ResourceId,
        command: Command,
        change: F,
    ) -> ServiceResult<Resource>
    where
        F: FnOnce(&mut Resource) -> Result<(), ResourceError>,
    {
        let mut resource = self.resource(resource_id).await?;
        let agency = self.agency_of(&resource).await?;
        ensure(
            actor,
            command,
            &AuthContext {
                resource: Some(&resource),
                agency: agency.as_ref(),
                ..Default::default()
            },
        )?;
        change(&mut resource)?;
        bounded(self.timeout(), self.repos.resources.save(&mut resource)).await?;
        info!("resource {} updated by user {}", resource_id, actor.user_id);
        Ok(resource)
    }

    /// The live booking of an already accepted request, if it matches this accept exactly.
    async fn accepted_booking(
        &self,
        request: &ServiceRequest,
        resource_id: ResourceId,
        window: &Range<DateTime<Utc>>,
    ) -> ServiceResult<Option<Booking>> {
        let same = request.status() == RequestStatus::Accepted
            && request.assignment().map(|a| a.resource_id()) == Some(resource_id)
            && request.window().as_ref() == Some(window);
        let booking_id = match (same, request.booking_id()) {
            (true, Some(booking_id)) => booking_id,
            _ => return Ok(None),
        };
        Ok(self
            .ledger
            .timeline(resource_id)
            .await?
            .booking(booking_id)
            .filter(|b| b.status().holds_slot())
            .cloned())
    }

    /// Whether a racing accept committed `booking_id` to the request. Unknown counts as claimed.
    async fn booking_claimed(&self, request_id: RequestId, booking_id: BookingId) -> bool {
        match self.request(request_id).await {
            Ok(request) => request.booking_id() == Some(booking_id),
            Err(e) => {
                warn!("keeping booking {}, request {} unreadable: {}", booking_id, request_id, e);
                true
            }
        }
    }

    /// Best-effort compensation for a booking whose request never committed.
    async fn release(&self, booking: &Booking) -> bool {
        match self
            .ledger
            .update_status(booking.resource_id(), booking.id(), BookingStatus::Cancelled)
            .await
        {
            Ok(change) => {
                warn!("released orphaned booking {}", booking.id());
                change.changed
            }
            Err(e) => {
                warn!("could not release booking {}: {}", booking.id(), e);
                false
            }
        }
    }

    /// Cancels live bookings of a committed request other than `keep`. They are left by
    /// accepts whose request write timed out or lost, possibly on another resource.
    async fn release_strays(&self, request_id: RequestId, keep: Option<BookingId>) {
        let live = match self.ledger.live_bookings(request_id).await {
            Ok(live) => live,
            Err(e) => {
                warn!("could not look up bookings of request {}: {}", request_id, e);
                return;
            }
        };
        for booking in live.iter().filter(|b| Some(b.id()) != keep) {
            if self.release(booking).await {
                self.slot_changed(booking, true);
            }
        }
    }

    /// Rating recompute is idempotent and can be rerun, so a failure here only logs.
    async fn refresh_rating(&self, resource_id: ResourceId) {
        if let Err(e) = self.ratings.recompute(resource_id).await {
            warn!("rating of resource {} is stale: {}", resource_id, e);
        }
    }

    async fn request(&self, id: RequestId) -> ServiceResult<ServiceRequest> {
        bounded(self.timeout(), self.repos.requests.find_by_id(id))
            .await?
            .ok_or_else(|| ServiceError::not_found("request", *id))
    }

    async fn resource(&self, id: ResourceId) -> ServiceResult<Resource> {
        bounded(self.timeout(), self.repos.resources.find_by_id(id))
            .await?
            .ok_or_else(|| ServiceError::not_found("resource", *id))
    }

    async fn review(&self, id: ReviewId) -> ServiceResult<Review> {
        bounded(self.timeout(), self.repos.reviews.find_by_id(id))
            .await?
            .ok_or_else(|| ServiceError::not_found("review", *id))
    }

    async fn agency(&self, id: AgencyId) -> ServiceResult<Agency> {
        bounded(self.timeout(), self.repos.agencies.find_by_id(id))
            .await?
            .ok_or_else(|| ServiceError::not_found("agency", *id))
    }

    async fn agency_of(&self, resource: &Resource) -> ServiceResult<Option<Agency>> {
        match resource.agency_id() {
            Some(agency_id) => Ok(Some(self.agency(agency_id).await?)),
            None => Ok(None),
        }
    }

    async fn save_request(&self, request: &mut ServiceRequest) -> Result<bool, DataAccessError> {
        bounded(self.timeout(), self.repos.requests.save(request)).await
    }

    fn timeout(&self) -> Duration {
        self.settings.store_timeout()
    }

    fn request_changed(&self, request: &ServiceRequest) {
        self.notifier.emit(Notification::RequestStatusChanged {
            request_id: request.id(),
            resource_id: request.assignment().map(|a| a.resource_id()),
            status: request.status(),
        });
    }

    fn slot_changed(&self, booking: &Booking, available: bool) {
        self.notifier.emit(Notification::AvailabilityChanged {
            resource_id: booking.resource_id(),
            time: booking.time(),
            available,
        });
    }
}

fn ensure(actor: &Actor, command: Command, ctx: &AuthContext<'_>) -> ServiceResult<()> {
    match authorize(actor, command, ctx) {
        Permission::Allow => Ok(()),
        Permission::Deny(reason) => {
            warn!("{:?} denied to user {}: {}", command, actor.user_id, reason);
            Err(ServiceError::Forbidden(reason))
        }
    }
}

fn assignment_for(resource: &Resource) -> Assignment {
    match resource.agency_id() {
        Some(agency_id) => Assignment::AgencyMember {
            agency_id,
            resource_id: resource.id(),
        },
        None => Assignment::Provider {
            resource_id: resource.id(),
        },
    }
}

fn slot_of(booking: &Booking) -> Slot {
    Slot {
        booking_id: booking.id(),
        time: booking.time(),
        duration_minutes: booking.duration_minutes(),
    }
}

fn not_offered(resource: &Resource, service_type_id: ServiceTypeId) -> ServiceError {
    ServiceError::Validation(format!(
        "resource {} does not offer service type {}",
        resource.id(),
        service_type_id
    ))
}

fn already_cancelled() -> ServiceError {
    RequestError::AlreadyTerminal {
        status: RequestStatus::Cancelled,
    }
    .into()
}

fn already_reviewed(request_id: RequestId) -> ServiceError {
    ServiceError::Conflict(format!("request {} was already reviewed", request_id))
}

/// Whether a request already reflects a booking status.
fn mirrors(request: RequestStatus, booking: BookingStatus) -> bool {
    matches!(
        (request, booking),
        (RequestStatus::InProgress, BookingStatus::InProgress)
            | (RequestStatus::Completed, BookingStatus::Completed)
            | (RequestStatus::Cancelled, BookingStatus::Cancelled)
    )
}

fn mirror(
    request: &mut ServiceRequest,
    status: BookingStatus,
    by: UserId,
    at: DateTime<Utc>,
) -> Result<(), RequestError> {
    match status {
        BookingStatus::InProgress => request.start(at),
        BookingStatus::Completed => request.complete(at),
        BookingStatus::Cancelled => request.cancel(by, at),
        BookingStatus::Scheduled => Err(RequestError::InvalidTransition {
            from: request.status(),
            to: RequestStatus::Accepted,
        }),
    }
}
