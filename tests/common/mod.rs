#![allow(dead_code)]

use std::{
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hireloop::{
    domain::{
        core::{
            AgencyMember, BookingId, Contact, GeoPoint, IndividualProfile, Location, Membership,
            RequestId, Resource, ResourceId, ResourceKind, ServiceOffering, ServiceRequest,
            ServiceRequestRepository, Timeline, TimelineRepository,
        },
        DataAccessError, FixedClock, IdGenerator,
    },
    infrastructure::memory::{
        InMemoryServiceRequestRepository, InMemoryStore, InMemoryTimelineRepository,
    },
    usecase::{Actor, Marketplace, NewRequest, NewResource, Notification, Notifier, Repositories, Role},
    Booking as BookingConfig,
};

pub const PLUMBING: u64 = 3;

pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, hour, minute, 0).unwrap()
}

pub fn point(lat: f64, lon: f64) -> GeoPoint {
    GeoPoint::new(lat, lon).unwrap()
}

pub fn berlin() -> GeoPoint {
    point(52.52, 13.405)
}

pub fn admin() -> Actor {
    Actor::new(1.into(), Role::Admin)
}

pub fn customer() -> Actor {
    Actor::new(5.into(), Role::Customer)
}

pub fn provider() -> Actor {
    Actor::new(7.into(), Role::Provider)
}

pub fn other_provider() -> Actor {
    Actor::new(8.into(), Role::Provider)
}

#[derive(Default)]
pub struct Recorder(Mutex<Vec<Notification>>);

impl Recorder {
    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl Notifier for Recorder {
    fn emit(&self, notification: Notification) {
        self.0.lock().unwrap().push(notification);
    }
}

pub struct World {
    pub market: Marketplace,
    pub clock: Arc<FixedClock>,
    pub notes: Arc<Recorder>,
}

pub fn world_with(repos: Repositories, settings: BookingConfig) -> World {
    let clock = Arc::new(FixedClock::new(at(8, 0)));
    let notes = Arc::new(Recorder::default());
    let market = Marketplace::new(
        repos,
        notes.clone(),
        Arc::new(IdGenerator::default()),
        clock.clone(),
        settings,
    );
    World {
        market,
        clock,
        notes,
    }
}

pub fn world() -> World {
    world_with(
        InMemoryStore::default().repositories(),
        BookingConfig::default(),
    )
}

pub fn offering(service_type_id: u64) -> ServiceOffering {
    ServiceOffering {
        service_type_id: service_type_id.into(),
        hourly_rate_cents: Some(4_500),
    }
}

pub fn individual(owner: &Actor, name: &str, at: GeoPoint) -> NewResource {
    NewResource {
        display_name: name.to_owned(),
        contact: Contact::default(),
        kind: ResourceKind::Individual(IndividualProfile {
            owner: owner.user_id,
            location: Location::from(at),
            is_available: true,
        }),
        offerings: vec![offering(PLUMBING)],
    }
}

pub fn member(agency_id: u64, name: &str) -> NewResource {
    NewResource {
        display_name: name.to_owned(),
        contact: Contact::default(),
        kind: ResourceKind::AgencyMember(AgencyMember {
            agency_id: agency_id.into(),
            membership: Membership::External,
        }),
        offerings: vec![offering(PLUMBING)],
    }
}

impl World {
    pub async fn plumber(&self) -> Resource {
        self.market
            .register_resource(&provider(), individual(&provider(), "Pia", berlin()))
            .await
            .unwrap()
    }

    pub async fn request(&self) -> ServiceRequest {
        self.market
            .create_request(&customer(), new_request(None))
            .await
            .unwrap()
    }

    pub async fn bookings(&self, resource_id: ResourceId) -> usize {
        self.market
            .list_resource_bookings(resource_id)
            .await
            .unwrap()
            .iter()
            .filter(|b| b.status().holds_slot())
            .count()
    }
}

pub fn new_request(resource_id: Option<ResourceId>) -> NewRequest {
    NewRequest {
        requester: customer().user_id,
        service_type_id: PLUMBING.into(),
        description: "Kitchen sink is leaking".to_owned(),
        location: Location::from(berlin()),
        resource_id,
        scheduled_at: None,
        estimated_duration_minutes: None,
    }
}

/// Hands out timelines and then yields, so concurrent callers work on stale copies.
pub struct YieldingTimelines(pub Arc<InMemoryTimelineRepository>);

#[async_trait]
impl TimelineRepository for YieldingTimelines {
    async fn find_by_id(&self, id: ResourceId) -> Result<Option<Timeline>, DataAccessError> {
        let timeline = self.0.find_by_id(id).await;
        tokio::task::yield_now().await;
        timeline
    }

    async fn find_resource_by_booking(
        &self,
        booking_id: BookingId,
    ) -> Result<Option<ResourceId>, DataAccessError> {
        self.0.find_resource_by_booking(booking_id).await
    }

    async fn find_resources_by_request(
        &self,
        request_id: RequestId,
    ) -> Result<Vec<ResourceId>, DataAccessError> {
        self.0.find_resources_by_request(request_id).await
    }

    async fn save(&self, entity: &mut Timeline) -> Result<bool, DataAccessError> {
        self.0.save(entity).await
    }
}

/// Request store that never answers in time.
pub struct StalledRequests(pub Arc<InMemoryServiceRequestRepository>);

#[async_trait]
impl ServiceRequestRepository for StalledRequests {
    async fn find_by_id(&self, id: RequestId) -> Result<Option<ServiceRequest>, DataAccessError> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        self.0.find_by_id(id).await
    }

    async fn save(&self, entity: &mut ServiceRequest) -> Result<bool, DataAccessError> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        self.0.save(entity).await
    }
}

/// Request store whose next save, once armed, never answers in time and is not applied.
pub struct StallNextSave {
    inner: Arc<InMemoryServiceRequestRepository>,
    armed: AtomicBool,
}

impl StallNextSave {
    pub fn new(inner: Arc<InMemoryServiceRequestRepository>) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(false),
        }
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ServiceRequestRepository for StallNextSave {
    async fn find_by_id(&self, id: RequestId) -> Result<Option<ServiceRequest>, DataAccessError> {
        self.inner.find_by_id(id).await
    }

    async fn save(&self, entity: &mut ServiceRequest) -> Result<bool, DataAccessError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        self.inner.save(entity).await
    }
}
