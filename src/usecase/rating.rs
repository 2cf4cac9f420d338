use std::{sync::Arc, time::Duration};

use tracing::{debug, info};

use crate::domain::{
    core::{RatingSummary, ResourceId, ResourceRepository, Review, ReviewRepository},
    DataAccessError,
};

use super::{bounded, Notification, Notifier, ServiceError, ServiceResult};

const MAX_ATTEMPTS: usize = 3;

/// Keeps a resource's average rating in line with its reviews.
///
/// Recomputes from the full review set every time, so running it twice is harmless.
pub struct RatingAggregator {
    reviews: Arc<dyn ReviewRepository>,
    resources: Arc<dyn ResourceRepository>,
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
}

impl RatingAggregator {
    pub fn new(
        reviews: Arc<dyn ReviewRepository>,
        resources: Arc<dyn ResourceRepository>,
        notifier: Arc<dyn Notifier>,
        timeout: Duration,
    ) -> Self {
        Self {
            reviews,
            resources,
            notifier,
            timeout,
        }
    }

    pub async fn recompute(&self, resource_id: ResourceId) -> ServiceResult<RatingSummary> {
        for _ in 0..MAX_ATTEMPTS {
            let reviews = bounded(self.timeout, self.reviews.find_by_resource(resource_id)).await?;
            let summary = RatingSummary::from_ratings(reviews.iter().map(Review::rating));

            let mut resource = bounded(self.timeout, self.resources.find_by_id(resource_id))
                .await?
                .ok_or_else(|| ServiceError::not_found("resource", *resource_id))?;
            if !resource.record_rating(summary)? {
                debug!("rating of resource {} unchanged", resource_id);
                return Ok(summary);
            }
            match bounded(self.timeout, self.resources.save(&mut resource)).await {
                Ok(_) => {
                    info!(
                        "resource {} rated {} over {} reviews",
                        resource_id, summary.average_rating, summary.total_reviews
                    );
                    self.notifier.emit(Notification::RatingChanged {
                        resource_id,
                        summary,
                    });
                    return Ok(summary);
                }
                Err(DataAccessError::ConcurrencyError(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ServiceError::Conflict(format!(
            "resource {} kept changing during rating recompute",
            resource_id
        )))
    }
}
