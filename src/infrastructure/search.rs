use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{
    core::{
        AgencyId, GeoPoint, Resource, ResourceEvent, ResourceId, ResourceKind, ResourceSearch,
        SearchFilters, ServiceTypeId,
    },
    DataAccessError, Entity,
};

pub static RESOURCE_INDEX: &str = "resource";
pub static AGENCY_INDEX: &str = "agency";

/// Meilisearch's reserved geo field.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeiliGeo {
    pub lat: f64,
    pub lng: f64,
}

impl From<GeoPoint> for MeiliGeo {
    fn from(value: GeoPoint) -> Self {
        Self {
            lat: value.lat(),
            lng: value.lon(),
        }
    }
}

/// Searchable projection of a resource. Agency members carry their agency's position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceDocument {
    pub id: ResourceId,
    pub display_name: String,
    pub agency_id: Option<AgencyId>,
    pub service_type_ids: Vec<ServiceTypeId>,
    pub verified: bool,
    pub is_available: bool,
    pub average_rating: f64,
    pub total_reviews: u32,
    #[serde(rename = "_geo", default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<MeiliGeo>,
}

impl ResourceDocument {
    pub fn new(resource: &Resource, agency_point: Option<GeoPoint>) -> Self {
        let point = match resource.agency_id() {
            Some(_) => agency_point,
            None => resource.location().map(|l| l.point),
        };
        Self {
            id: resource.id(),
            display_name: resource.display_name().to_owned(),
            agency_id: resource.agency_id(),
            service_type_ids: resource
                .offerings()
                .iter()
                .map(|o| o.service_type_id)
                .collect(),
            verified: resource.is_verified(),
            is_available: resource.is_available(),
            average_rating: resource.rating().average_rating,
            total_reviews: resource.rating().total_reviews,
            geo: point.map(MeiliGeo::from),
        }
    }

    /// Folds a later resource event into the document.
    pub fn apply(&mut self, event: &ResourceEvent) {
        match event {
            ResourceEvent::ResourceRegistered { kind, .. } => {
                if let ResourceKind::Individual(profile) = kind {
                    self.geo = Some(profile.location.point.into());
                }
            }
            ResourceEvent::AvailabilityChanged { is_available, .. } => {
                self.is_available = *is_available
            }
            ResourceEvent::ResourceVerified { .. } => self.verified = true,
            ResourceEvent::OfferingAdded { offering, .. } => {
                if !self.service_type_ids.contains(&offering.service_type_id) {
                    self.service_type_ids.push(offering.service_type_id);
                }
            }
            ResourceEvent::OfferingRemoved {
                service_type_id, ..
            } => self.service_type_ids.retain(|s| s != service_type_id),
            ResourceEvent::ResourceRelocated { location, .. } => {
                if self.agency_id.is_none() {
                    self.geo = Some(location.point.into());
                }
            }
            ResourceEvent::RatingRecomputed { summary, .. } => {
                self.average_rating = summary.average_rating;
                self.total_reviews = summary.total_reviews;
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgencyDocument {
    pub id: AgencyId,
    pub name: String,
    #[serde(rename = "_geo", default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<MeiliGeo>,
}

impl AgencyDocument {
    pub fn point(&self) -> Option<GeoPoint> {
        self.geo.and_then(|g| GeoPoint::new(g.lat, g.lng).ok())
    }
}

fn radius_filter(
    point: GeoPoint,
    radius_meters: f64,
    service_type_id: Option<ServiceTypeId>,
    filters: SearchFilters,
) -> String {
    let mut filter = format!(
        "_geoRadius({}, {}, {})",
        point.lat(),
        point.lon(),
        radius_meters.ceil() as u64
    );
    if let Some(service_type_id) = service_type_id {
        filter.push_str(&format!(" AND service_type_ids = {}", service_type_id));
    }
    if filters.verified_only {
        filter.push_str(" AND verified = true");
    }
    if filters.available_only {
        filter.push_str(" AND is_available = true");
    }
    filter
}

/// Prefilters resources through the meilisearch geo index kept by the sync daemon.
pub struct MeiliResourceSearch {
    client: meilisearch_sdk::Client,
}

impl MeiliResourceSearch {
    pub fn new(client: meilisearch_sdk::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResourceSearch for MeiliResourceSearch {
    async fn within_radius(
        &self,
        point: GeoPoint,
        radius_meters: f64,
        service_type_id: Option<ServiceTypeId>,
        filters: SearchFilters,
        limit: usize,
    ) -> Result<Vec<ResourceId>, DataAccessError> {
        let index = self.client.index(RESOURCE_INDEX);
        let filter = radius_filter(point, radius_meters, service_type_id, filters);
        let sort = format!("_geoPoint({}, {}):asc", point.lat(), point.lon());
        let sort = [sort.as_str()];
        let results = index
            .search()
            .with_filter(&filter)
            .with_sort(&sort)
            .with_limit(limit)
            .execute::<ResourceDocument>()
            .await
            .map_err(|e| DataAccessError::QueryError(Box::new(e)))?;
        debug!("{} returned {} hits", filter, results.hits.len());
        Ok(results.hits.into_iter().map(|hit| hit.result.id).collect())
    }
}
