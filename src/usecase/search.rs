use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::future::try_join_all;
use serde::Serialize;
use tracing::debug;

pub use crate::domain::core::SearchFilters;
use crate::domain::core::{
    validate_radius, AgencyId, AgencyRepository, GeoPoint, Resource, ResourceRepository,
    ResourceSearch, ServiceTypeId,
};

use super::{bounded, ServiceResult};

/// Index lookups may round coordinates; widen the prefilter so nothing on the edge is lost.
const RADIUS_SLACK: f64 = 1.01;

#[derive(Clone, Debug, Serialize)]
pub struct NearbyResource {
    pub resource: Resource,
    pub distance_meters: f64,
}

/// Point-radius search over resources, ordered by geodesic distance.
pub struct GeoQuery {
    search: Arc<dyn ResourceSearch>,
    resources: Arc<dyn ResourceRepository>,
    agencies: Arc<dyn AgencyRepository>,
    timeout: Duration,
    limit: usize,
}

impl GeoQuery {
    pub fn new(
        search: Arc<dyn ResourceSearch>,
        resources: Arc<dyn ResourceRepository>,
        agencies: Arc<dyn AgencyRepository>,
        timeout: Duration,
        limit: usize,
    ) -> Self {
        Self {
            search,
            resources,
            agencies,
            timeout,
            limit: limit.max(1),
        }
    }

    pub async fn find_nearby(
        &self,
        point: GeoPoint,
        radius_meters: f64,
        service_type_id: Option<ServiceTypeId>,
        filters: SearchFilters,
    ) -> ServiceResult<Vec<NearbyResource>> {
        let radius = validate_radius(radius_meters)?;
        let candidates = bounded(
            self.timeout,
            self.search
                .within_radius(
                    point,
                    radius * RADIUS_SLACK,
                    service_type_id,
                    filters,
                    self.limit,
                ),
        )
        .await?;
        debug!(
            "{} candidates within {}m of ({}, {})",
            candidates.len(),
            radius,
            point.lat(),
            point.lon()
        );

        let loaded = try_join_all(
            candidates
                .into_iter()
                .map(|id| bounded(self.timeout, self.resources.find_by_id(id))),
        )
        .await?;

        let matching = loaded
            .into_iter()
            .flatten()
            .filter(|r| service_type_id.map_or(true, |s| r.offers(s)))
            .filter(|r| filters.admits(r))
            .collect::<Vec<_>>();

        let agency_points = self.agency_points(&matching).await?;
        let mut found = matching
            .into_iter()
            .filter_map(|resource| {
                let location = match resource.agency_id() {
                    Some(agency_id) => agency_points.get(&agency_id).copied().flatten(),
                    None => resource.location().map(|l| l.point),
                }?;
                let distance_meters = point.distance_to(&location);
                (distance_meters <= radius).then_some(NearbyResource {
                    resource,
                    distance_meters,
                })
            })
            .collect::<Vec<_>>();

        found.sort_by(|a, b| a.distance_meters.total_cmp(&b.distance_meters));
        found.truncate(self.limit);
        Ok(found)
    }

    /// Agency members are located at their agency.
    async fn agency_points(
        &self,
        resources: &[Resource],
    ) -> ServiceResult<HashMap<AgencyId, Option<GeoPoint>>> {
        let mut ids = resources
            .iter()
            .filter_map(Resource::agency_id)
            .collect::<Vec<_>>();
        ids.sort_by_key(|id| **id);
        ids.dedup();

        let agencies = try_join_all(
            ids.iter()
                .map(|id| bounded(self.timeout, self.agencies.find_by_id(*id))),
        )
        .await?;
        Ok(ids
            .into_iter()
            .zip(agencies)
            .map(|(id, agency)| {
                let point = agency.and_then(|a| a.location().map(|l| l.point));
                (id, point)
            })
            .collect())
    }
}
