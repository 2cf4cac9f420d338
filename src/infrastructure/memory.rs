//! Process-local repositories for tests and single-node runs.
//!
//! Each aggregate keeps its committed events and replays them on load, and saves are
//! checked against the revision the aggregate was loaded at, like the EventStoreDB streams.

use std::{collections::HashMap, sync::Arc, sync::Mutex};

use async_trait::async_trait;

use crate::{
    domain::{
        core::{
            Agency, AgencyId, AgencyRepository, BookingId, GeoPoint, RequestId, Resource,
            ResourceId, ResourceRepository, ResourceSearch, Review, ReviewId, ReviewRepository,
            SearchFilters, ServiceRequest, ServiceRequestRepository, ServiceTypeId, Timeline,
            TimelineRepository,
        },
        Aggregation, DataAccessError, Entity,
    },
    usecase::Repositories,
};

use super::stream_name;

struct Streams<A: Aggregation> {
    streams: Mutex<HashMap<A::Id, Vec<A::Event>>>,
}

impl<A: Aggregation> Default for Streams<A> {
    fn default() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
        }
    }
}

impl<A: Aggregation> Streams<A> {
    fn load(&self, id: A::Id) -> Option<A> {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        streams
            .get(&id)
            .and_then(|events| A::replay(events.iter().cloned()))
    }

    fn all(&self) -> Vec<A> {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        streams
            .values()
            .filter_map(|events| A::replay(events.iter().cloned()))
            .collect()
    }

    fn store(&self, entity: &mut A) -> Result<bool, DataAccessError> {
        if !entity.has_changes() {
            return Ok(false);
        }
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let current = streams
            .get(&entity.id())
            .map(|events| events.len() as u64 - 1);
        if current != entity.revision() {
            return Err(DataAccessError::ConcurrencyError(stream_name::<A>(
                entity.id(),
            )));
        }
        let stream = streams.entry(entity.id()).or_default();
        stream.extend(entity.pop_all());
        entity.set_revision(Some(stream.len() as u64 - 1));
        Ok(true)
    }
}

#[derive(Default)]
pub struct InMemoryAgencyRepository(Streams<Agency>);

#[async_trait]
impl AgencyRepository for InMemoryAgencyRepository {
    async fn find_by_id(&self, id: AgencyId) -> Result<Option<Agency>, DataAccessError> {
        Ok(self.0.load(id))
    }

    async fn save(&self, entity: &mut Agency) -> Result<bool, DataAccessError> {
        self.0.store(entity)
    }
}

#[derive(Default)]
pub struct InMemoryResourceRepository(Streams<Resource>);

#[async_trait]
impl ResourceRepository for InMemoryResourceRepository {
    async fn find_by_id(&self, id: ResourceId) -> Result<Option<Resource>, DataAccessError> {
        Ok(self.0.load(id))
    }

    async fn save(&self, entity: &mut Resource) -> Result<bool, DataAccessError> {
        self.0.store(entity)
    }
}

#[derive(Default)]
pub struct InMemoryServiceRequestRepository(Streams<ServiceRequest>);

#[async_trait]
impl ServiceRequestRepository for InMemoryServiceRequestRepository {
    async fn find_by_id(&self, id: RequestId) -> Result<Option<ServiceRequest>, DataAccessError> {
        Ok(self.0.load(id))
    }

    async fn save(&self, entity: &mut ServiceRequest) -> Result<bool, DataAccessError> {
        self.0.store(entity)
    }
}

#[derive(Default)]
pub struct InMemoryTimelineRepository(Streams<Timeline>);

#[async_trait]
impl TimelineRepository for InMemoryTimelineRepository {
    async fn find_by_id(&self, id: ResourceId) -> Result<Option<Timeline>, DataAccessError> {
        Ok(self.0.load(id))
    }

    async fn find_resource_by_booking(
        &self,
        booking_id: BookingId,
    ) -> Result<Option<ResourceId>, DataAccessError> {
        Ok(self
            .0
            .all()
            .into_iter()
            .find(|t| t.booking(booking_id).is_some())
            .map(|t| t.id()))
    }

    async fn find_resources_by_request(
        &self,
        request_id: RequestId,
    ) -> Result<Vec<ResourceId>, DataAccessError> {
        Ok(self
            .0
            .all()
            .into_iter()
            .filter(|t| t.bookings().iter().any(|b| b.request_id() == request_id))
            .map(|t| t.id())
            .collect())
    }

    async fn save(&self, entity: &mut Timeline) -> Result<bool, DataAccessError> {
        self.0.store(entity)
    }
}

#[derive(Default)]
pub struct InMemoryReviewRepository(Streams<Review>);

#[async_trait]
impl ReviewRepository for InMemoryReviewRepository {
    async fn find_by_id(&self, id: ReviewId) -> Result<Option<Review>, DataAccessError> {
        Ok(self.0.load(id))
    }

    async fn find_by_request(
        &self,
        request_id: RequestId,
    ) -> Result<Option<Review>, DataAccessError> {
        Ok(self.0.load(ReviewId::from(*request_id)))
    }

    async fn find_by_resource(
        &self,
        resource_id: ResourceId,
    ) -> Result<Vec<Review>, DataAccessError> {
        Ok(self
            .0
            .all()
            .into_iter()
            .filter(|r| r.resource_id() == resource_id)
            .collect())
    }

    async fn save(&self, entity: &mut Review) -> Result<bool, DataAccessError> {
        self.0.store(entity)
    }
}

/// Linear scan over the in-memory resources, nearest first.
pub struct InMemoryResourceSearch {
    resources: Arc<InMemoryResourceRepository>,
    agencies: Arc<InMemoryAgencyRepository>,
}

impl InMemoryResourceSearch {
    pub fn new(
        resources: Arc<InMemoryResourceRepository>,
        agencies: Arc<InMemoryAgencyRepository>,
    ) -> Self {
        Self {
            resources,
            agencies,
        }
    }

    fn point_of(&self, resource: &Resource) -> Option<GeoPoint> {
        match resource.agency_id() {
            Some(agency_id) => self
                .agencies
                .0
                .load(agency_id)
                .and_then(|a| a.location().map(|l| l.point)),
            None => resource.location().map(|l| l.point),
        }
    }
}

#[async_trait]
impl ResourceSearch for InMemoryResourceSearch {
    async fn within_radius(
        &self,
        point: GeoPoint,
        radius_meters: f64,
        service_type_id: Option<ServiceTypeId>,
        filters: SearchFilters,
        limit: usize,
    ) -> Result<Vec<ResourceId>, DataAccessError> {
        let mut found = self
            .resources
            .0
            .all()
            .into_iter()
            .filter(|r| service_type_id.map_or(true, |s| r.offers(s)))
            .filter(|r| filters.admits(r))
            .filter_map(|r| {
                let distance = point.distance_to(&self.point_of(&r)?);
                (distance <= radius_meters).then_some((distance, r.id()))
            })
            .collect::<Vec<_>>();
        found.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(found.into_iter().take(limit).map(|(_, id)| id).collect())
    }
}

/// One process-local store shared by all repositories.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    pub agencies: Arc<InMemoryAgencyRepository>,
    pub resources: Arc<InMemoryResourceRepository>,
    pub requests: Arc<InMemoryServiceRequestRepository>,
    pub timelines: Arc<InMemoryTimelineRepository>,
    pub reviews: Arc<InMemoryReviewRepository>,
}

impl InMemoryStore {
    pub fn repositories(&self) -> Repositories {
        Repositories {
            agencies: self.agencies.clone(),
            resources: self.resources.clone(),
            requests: self.requests.clone(),
            timelines: self.timelines.clone(),
            reviews: self.reviews.clone(),
            search: Arc::new(InMemoryResourceSearch::new(
                self.resources.clone(),
                self.agencies.clone(),
            )),
        }
    }
}
