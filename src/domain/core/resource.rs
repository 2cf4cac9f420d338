use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, Error, From};
use serde::{Deserialize, Serialize};

use crate::domain::{Aggregation, DataAccessError, Entity, Event, EventQueue, Id};

use super::{AgencyId, GeoPoint, Location, RatingSummary, ServiceTypeId, UserId};

/// Repository of schedulable resources
#[async_trait]
pub trait ResourceRepository: Send + Sync {
    async fn find_by_id(&self, id: ResourceId) -> Result<Option<Resource>, DataAccessError>;
    async fn save(&self, entity: &mut Resource) -> Result<bool, DataAccessError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Drop resources that were never verified.
    #[serde(default)]
    pub verified_only: bool,
    /// Drop individual providers that switched themselves off.
    #[serde(default)]
    pub available_only: bool,
}

impl SearchFilters {
    pub fn admits(&self, resource: &Resource) -> bool {
        (!self.verified_only || resource.is_verified())
            && (!self.available_only || resource.is_available())
    }
}

/// Point-radius lookup over resource locations.
#[async_trait]
pub trait ResourceSearch: Send + Sync {
    /// Ids of resources that may lie within `radius_meters` of `point`, nearest first.
    ///
    /// Implementations may return extra candidates but must not miss any inside the radius
    /// that passes `filters`. The limit counts only resources passing `filters`.
    async fn within_radius(
        &self,
        point: GeoPoint,
        radius_meters: f64,
        service_type_id: Option<ServiceTypeId>,
        filters: SearchFilters,
        limit: usize,
    ) -> Result<Vec<ResourceId>, DataAccessError>;
}

/// Schedulable resource id, shared by individual providers and agency members.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Deref, Default,
)]
pub struct ResourceId(u64);

impl Id for ResourceId {
    type Inner = u64;
}

/// A service the resource can perform, optionally with its own hourly rate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOffering {
    pub service_type_id: ServiceTypeId,
    pub hourly_rate_cents: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Contact {
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub verified_at: DateTime<Utc>,
    pub verified_by: UserId,
}

/// A provider registered on their own behalf.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndividualProfile {
    pub owner: UserId,
    pub location: Location,
    pub is_available: bool,
}

/// Whether an agency member has a platform account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Membership {
    Internal { user_id: UserId },
    External,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgencyMember {
    pub agency_id: AgencyId,
    pub membership: Membership,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ResourceKind {
    Individual(IndividualProfile),
    AgencyMember(AgencyMember),
}

impl Default for ResourceKind {
    fn default() -> Self {
        ResourceKind::AgencyMember(AgencyMember {
            agency_id: AgencyId::default(),
            membership: Membership::External,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ResourceEvent {
    ResourceRegistered {
        id: ResourceId,
        display_name: String,
        contact: Contact,
        kind: ResourceKind,
        offerings: Vec<ServiceOffering>,
    },
    AvailabilityChanged {
        id: ResourceId,
        is_available: bool,
    },
    ResourceVerified {
        id: ResourceId,
        verification: Verification,
    },
    OfferingAdded {
        id: ResourceId,
        offering: ServiceOffering,
    },
    OfferingRemoved {
        id: ResourceId,
        service_type_id: ServiceTypeId,
    },
    ResourceRelocated {
        id: ResourceId,
        location: Location,
    },
    RatingRecomputed {
        id: ResourceId,
        summary: RatingSummary,
    },
}

impl Event for ResourceEvent {
    type Id = ResourceId;
}

/// Individual provider or agency member that can be booked.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resource {
    id: ResourceId,
    display_name: String,
    contact: Contact,
    kind: ResourceKind,
    offerings: Vec<ServiceOffering>,
    verification: Option<Verification>,
    rating: RatingSummary,
    #[serde(skip)]
    revision: Option<u64>,
    #[serde(skip)]
    events: EventQueue<ResourceEvent>,
}

impl Resource {
    pub fn register(
        id: ResourceId,
        display_name: String,
        contact: Contact,
        kind: ResourceKind,
        offerings: Vec<ServiceOffering>,
    ) -> Result<Self, ResourceError> {
        let mut entity = Resource::default();
        entity.record(ResourceEvent::ResourceRegistered {
            id,
            display_name,
            contact,
            kind,
            offerings,
        })?;
        Ok(entity)
    }

    pub fn change_availability(&mut self, is_available: bool) -> Result<(), ResourceError> {
        self.record(ResourceEvent::AvailabilityChanged {
            id: self.id,
            is_available,
        })
    }

    pub fn verify(&mut self, verified_by: UserId, verified_at: DateTime<Utc>) -> Result<(), ResourceError> {
        self.record(ResourceEvent::ResourceVerified {
            id: self.id,
            verification: Verification {
                verified_at,
                verified_by,
            },
        })
    }

    pub fn add_offering(&mut self, offering: ServiceOffering) -> Result<(), ResourceError> {
        self.record(ResourceEvent::OfferingAdded {
            id: self.id,
            offering,
        })
    }

    pub fn remove_offering(&mut self, service_type_id: ServiceTypeId) -> Result<(), ResourceError> {
        self.record(ResourceEvent::OfferingRemoved {
            id: self.id,
            service_type_id,
        })
    }

    pub fn relocate(&mut self, location: Location) -> Result<(), ResourceError> {
        self.record(ResourceEvent::ResourceRelocated {
            id: self.id,
            location,
        })
    }

    /// Stores a freshly computed rating. Recording the same summary twice is a no-op.
    pub fn record_rating(&mut self, summary: RatingSummary) -> Result<bool, ResourceError> {
        if self.rating == summary {
            return Ok(false);
        }
        self.record(ResourceEvent::RatingRecomputed {
            id: self.id,
            summary,
        })?;
        Ok(true)
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    pub fn offerings(&self) -> &[ServiceOffering] {
        &self.offerings
    }

    pub fn verification(&self) -> Option<&Verification> {
        self.verification.as_ref()
    }

    pub fn rating(&self) -> RatingSummary {
        self.rating
    }

    pub fn offers(&self, service_type_id: ServiceTypeId) -> bool {
        self.offerings
            .iter()
            .any(|o| o.service_type_id == service_type_id)
    }

    pub fn is_verified(&self) -> bool {
        self.verification.is_some()
    }

    /// Agency members have no manual toggle and are always open for booking.
    pub fn is_available(&self) -> bool {
        match &self.kind {
            ResourceKind::Individual(profile) => profile.is_available,
            ResourceKind::AgencyMember(_) => true,
        }
    }

    /// Own location of an individual provider; agency members use their agency's.
    pub fn location(&self) -> Option<&Location> {
        match &self.kind {
            ResourceKind::Individual(profile) => Some(&profile.location),
            ResourceKind::AgencyMember(_) => None,
        }
    }

    pub fn agency_id(&self) -> Option<AgencyId> {
        match &self.kind {
            ResourceKind::Individual(_) => None,
            ResourceKind::AgencyMember(member) => Some(member.agency_id),
        }
    }

    /// Platform user acting as this resource, if any.
    pub fn user_id(&self) -> Option<UserId> {
        match &self.kind {
            ResourceKind::Individual(profile) => Some(profile.owner),
            ResourceKind::AgencyMember(AgencyMember {
                membership: Membership::Internal { user_id },
                ..
            }) => Some(*user_id),
            ResourceKind::AgencyMember(_) => None,
        }
    }

    fn validate_id(&self, id: &ResourceId) -> Result<(), ResourceError> {
        match self.id == *id {
            true => Ok(()),
            false => Err(ResourceError::MismatchedId),
        }
    }

    fn validate_individual(&self) -> Result<(), ResourceError> {
        match self.kind {
            ResourceKind::Individual(_) => Ok(()),
            ResourceKind::AgencyMember(_) => Err(ResourceError::NotAnIndividual),
        }
    }

    fn validate_offerings(offerings: &[ServiceOffering]) -> Result<(), ResourceError> {
        for (i, offering) in offerings.iter().enumerate() {
            if offerings[..i]
                .iter()
                .any(|o| o.service_type_id == offering.service_type_id)
            {
                return Err(ResourceError::DuplicateOffering);
            }
        }
        Ok(())
    }
}

impl Entity for Resource {
    type Id = ResourceId;

    const ENTITY_NAME: &'static str = "resource";

    fn id(&self) -> Self::Id {
        self.id
    }
}

impl Aggregation for Resource {
    type Event = ResourceEvent;
    type Error = ResourceError;

    fn validate(&self, event: &Self::Event) -> Result<(), Self::Error> {
        match event {
            ResourceEvent::ResourceRegistered {
                display_name,
                offerings,
                ..
            } => {
                if self.revision.is_some() || self.has_changes() {
                    return Err(ResourceError::AlreadyRegistered);
                }
                if display_name.trim().is_empty() {
                    return Err(ResourceError::NameRequired);
                }
                Self::validate_offerings(offerings)
            }
            ResourceEvent::AvailabilityChanged { id, .. }
            | ResourceEvent::ResourceRelocated { id, .. } => {
                self.validate_id(id)?;
                self.validate_individual()
            }
            ResourceEvent::ResourceVerified { id, .. } => self.validate_id(id),
            ResourceEvent::OfferingAdded { id, offering } => {
                self.validate_id(id)?;
                match self.offers(offering.service_type_id) {
                    true => Err(ResourceError::DuplicateOffering),
                    false => Ok(()),
                }
            }
            ResourceEvent::OfferingRemoved {
                id,
                service_type_id,
            } => {
                self.validate_id(id)?;
                match self.offers(*service_type_id) {
                    true => Ok(()),
                    false => Err(ResourceError::OfferingNotFound),
                }
            }
            ResourceEvent::RatingRecomputed { id, summary } => {
                self.validate_id(id)?;
                if !(0.0..=5.0).contains(&summary.average_rating) {
                    return Err(ResourceError::InvalidRating);
                }
                Ok(())
            }
        }
    }

    fn apply(&mut self, event: Self::Event) {
        match event {
            ResourceEvent::ResourceRegistered {
                id,
                display_name,
                contact,
                kind,
                offerings,
            } => {
                self.id = id;
                self.display_name = display_name;
                self.contact = contact;
                self.kind = kind;
                self.offerings = offerings;
            }
            ResourceEvent::AvailabilityChanged { is_available, .. } => {
                if let ResourceKind::Individual(profile) = &mut self.kind {
                    profile.is_available = is_available;
                }
            }
            ResourceEvent::ResourceVerified { verification, .. } => {
                self.verification = Some(verification)
            }
            ResourceEvent::OfferingAdded { offering, .. } => self.offerings.push(offering),
            ResourceEvent::OfferingRemoved {
                service_type_id, ..
            } => self
                .offerings
                .retain(|o| o.service_type_id != service_type_id),
            ResourceEvent::ResourceRelocated { location, .. } => {
                if let ResourceKind::Individual(profile) = &mut self.kind {
                    profile.location = location;
                }
            }
            ResourceEvent::RatingRecomputed { summary, .. } => self.rating = summary,
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

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.display_name == other.display_name
            && self.contact == other.contact
            && self.kind == other.kind
            && self.offerings == other.offerings
            && self.verification == other.verification
            && self.rating == other.rating
    }
}

#[derive(Error, Display, Debug, PartialEq, Eq)]
pub enum ResourceError {
    #[display(fmt = "Mismatched id")]
    MismatchedId,
    #[display(fmt = "Resource is already registered")]
    AlreadyRegistered,
    #[display(fmt = "Display name is not specified")]
    NameRequired,
    #[display(fmt = "Only individual providers have a location and availability toggle")]
    NotAnIndividual,
    #[display(fmt = "Service is already offered")]
    DuplicateOffering,
    #[display(fmt = "Service is not offered")]
    OfferingNotFound,
    #[display(fmt = "Average rating must be within 0..=5")]
    InvalidRating,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::core::GeoPoint;

    fn offering(id: u64) -> ServiceOffering {
        ServiceOffering {
            service_type_id: id.into(),
            hourly_rate_cents: None,
        }
    }

    fn individual() -> Resource {
        let kind = ResourceKind::Individual(IndividualProfile {
            owner: 10.into(),
            location: GeoPoint::new(52.52, 13.40).unwrap().into(),
            is_available: true,
        });
        let mut resource = Resource::register(
            1.into(),
            "Ada Plumbing".to_owned(),
            Contact::default(),
            kind,
            vec![offering(100)],
        )
        .unwrap();
        resource.clear();
        resource
    }

    fn member(membership: Membership) -> Resource {
        let kind = ResourceKind::AgencyMember(AgencyMember {
            agency_id: 5.into(),
            membership,
        });
        Resource::register(2.into(), "Crew #1".to_owned(), Contact::default(), kind, vec![])
            .unwrap()
    }

    #[test]
    fn test_offers() {
        let mut resource = individual();
        assert!(resource.offers(100.into()));
        assert!(!resource.offers(200.into()));

        resource.add_offering(offering(200)).unwrap();
        assert!(resource.offers(200.into()));
        assert_eq!(
            resource.add_offering(offering(200)),
            Err(ResourceError::DuplicateOffering)
        );
        resource.remove_offering(100.into()).unwrap();
        assert!(!resource.offers(100.into()));
        assert_eq!(
            resource.remove_offering(100.into()),
            Err(ResourceError::OfferingNotFound)
        );
    }

    #[test]
    fn test_duplicate_offerings_rejected_at_registration() {
        let kind = ResourceKind::AgencyMember(AgencyMember {
            agency_id: 5.into(),
            membership: Membership::External,
        });
        assert_eq!(
            Resource::register(
                3.into(),
                "Crew".to_owned(),
                Contact::default(),
                kind,
                vec![offering(1), offering(1)],
            )
            .unwrap_err(),
            ResourceError::DuplicateOffering
        );
    }

    #[test]
    fn test_availability_toggle_is_individual_only() {
        let mut resource = individual();
        resource.change_availability(false).unwrap();
        assert!(!resource.is_available());

        let mut member = member(Membership::External);
        assert!(member.is_available());
        assert_eq!(
            member.change_availability(false),
            Err(ResourceError::NotAnIndividual)
        );
        assert!(member.location().is_none());
    }

    #[test]
    fn test_user_id() {
        assert_eq!(individual().user_id(), Some(10.into()));
        assert_eq!(
            member(Membership::Internal { user_id: 11.into() }).user_id(),
            Some(11.into())
        );
        assert_eq!(member(Membership::External).user_id(), None);
        assert_eq!(member(Membership::External).agency_id(), Some(5.into()));
    }

    #[test]
    fn test_verify() {
        let mut resource = individual();
        assert!(!resource.is_verified());
        resource.verify(99.into(), Utc::now()).unwrap();
        assert!(resource.is_verified());
        assert_eq!(resource.verification().unwrap().verified_by, 99.into());
    }

    #[test]
    fn test_record_rating_skips_unchanged_summary() {
        let mut resource = individual();
        let summary = RatingSummary {
            average_rating: 4.5,
            total_reviews: 2,
        };
        assert_eq!(resource.record_rating(summary), Ok(true));
        assert_eq!(resource.record_rating(summary), Ok(false));
        assert_eq!(resource.events().len(), 1);
        assert_eq!(resource.rating(), summary);
    }

    #[test]
    fn test_replay_matches_live_state() {
        let mut live = individual();
        live.verify(99.into(), Utc::now()).unwrap();
        live.change_availability(false).unwrap();
        let mut events = vec![ResourceEvent::ResourceRegistered {
            id: live.id(),
            display_name: live.display_name().to_owned(),
            contact: live.contact().clone(),
            kind: ResourceKind::Individual(IndividualProfile {
                owner: 10.into(),
                location: GeoPoint::new(52.52, 13.40).unwrap().into(),
                is_available: true,
            }),
            offerings: vec![offering(100)],
        }];
        events.extend(live.pop_all());
        let replayed = Resource::replay(events).unwrap();
        assert_eq!(replayed, live);
        assert_eq!(replayed.revision(), Some(2));
    }
}
