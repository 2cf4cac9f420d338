use std::{ops::Range, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::Serialize;
use tracing::debug;

use crate::domain::{
    core::{
        BookingId, RequestId, Resource, ResourceId, ResourceRepository, ServiceTypeId,
        TimelineRepository,
    },
    Entity,
};

use super::{bounded, ServiceError, ServiceResult};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum UnavailableReason {
    /// The resource has no offering for the requested service type.
    NotOffered,
    /// An active booking already holds part of the window.
    Overlaps {
        booking_id: BookingId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct Unavailable {
    pub resource: Resource,
    #[serde(flatten)]
    pub reason: UnavailableReason,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct AvailabilityReport {
    pub available: Vec<Resource>,
    pub unavailable: Vec<Unavailable>,
    pub has_availability: bool,
}

/// Advisory free/busy check. The booking ledger re-checks on commit.
pub struct AvailabilityResolver {
    resources: Arc<dyn ResourceRepository>,
    timelines: Arc<dyn TimelineRepository>,
    timeout: Duration,
}

impl AvailabilityResolver {
    pub fn new(
        resources: Arc<dyn ResourceRepository>,
        timelines: Arc<dyn TimelineRepository>,
        timeout: Duration,
    ) -> Self {
        Self {
            resources,
            timelines,
            timeout,
        }
    }

    pub async fn check(
        &self,
        resource_ids: &[ResourceId],
        service_type_id: ServiceTypeId,
        window: &Range<DateTime<Utc>>,
        exclude_request: Option<RequestId>,
    ) -> ServiceResult<AvailabilityReport> {
        if window.start >= window.end {
            return Err(ServiceError::Validation(
                "availability window must have a positive duration".to_owned(),
            ));
        }
        let mut ids = Vec::with_capacity(resource_ids.len());
        for id in resource_ids {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
        if ids.is_empty() {
            return Ok(AvailabilityReport::default());
        }

        let resources = try_join_all(ids.iter().map(|id| self.load(*id))).await?;
        let mut report = AvailabilityReport::default();
        let mut offering = Vec::new();
        for resource in resources {
            match resource.offers(service_type_id) {
                true => offering.push(resource),
                false => report.unavailable.push(Unavailable {
                    resource,
                    reason: UnavailableReason::NotOffered,
                }),
            }
        }

        let timelines = try_join_all(
            offering
                .iter()
                .map(|r| bounded(self.timeout, self.timelines.find_by_id(r.id()))),
        )
        .await?;
        for (resource, timeline) in offering.into_iter().zip(timelines) {
            let conflict = timeline.as_ref().and_then(|t| {
                t.conflicts(window, exclude_request)
                    .first()
                    .map(|b| UnavailableReason::Overlaps {
                        booking_id: b.id(),
                        start: b.start_time(),
                        end: b.end_time(),
                    })
            });
            match conflict {
                Some(reason) => report.unavailable.push(Unavailable { resource, reason }),
                None => report.available.push(resource),
            }
        }

        report.has_availability = !report.available.is_empty();
        debug!(
            "{} of {} resources free for {} - {}",
            report.available.len(),
            ids.len(),
            window.start,
            window.end
        );
        Ok(report)
    }

    async fn load(&self, id: ResourceId) -> ServiceResult<Resource> {
        bounded(self.timeout, self.resources.find_by_id(id))
            .await?
            .ok_or_else(|| ServiceError::not_found("resource", *id))
    }
}
