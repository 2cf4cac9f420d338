use async_trait::async_trait;
use eventstore::{Client, ExpectedRevision};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};

use crate::domain::{
    core::{RequestId, ResourceId, Review, ReviewId, ReviewRepository},
    Aggregation, DataAccessError, Entity,
};
use crate::infrastructure::{load, store};

use super::{append_index, read_index};

#[derive(Debug, Serialize, Deserialize)]
struct ReviewListed {
    review_id: ReviewId,
}

fn resource_reviews_stream(resource_id: ResourceId) -> String {
    format!("resource_reviews-{}", resource_id)
}

#[derive(Clone)]
pub struct EventStoreReviewRepository {
    client: Client,
}

impl EventStoreReviewRepository {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ReviewRepository for EventStoreReviewRepository {
    async fn find_by_id(&self, id: ReviewId) -> Result<Option<Review>, DataAccessError> {
        load(&self.client, id).await
    }

    async fn find_by_request(
        &self,
        request_id: RequestId,
    ) -> Result<Option<Review>, DataAccessError> {
        load(&self.client, ReviewId::from(*request_id)).await
    }

    async fn find_by_resource(
        &self,
        resource_id: ResourceId,
    ) -> Result<Vec<Review>, DataAccessError> {
        let listed: Vec<ReviewListed> =
            read_index(&self.client, &resource_reviews_stream(resource_id)).await?;
        let reviews = try_join_all(
            listed
                .iter()
                .map(|l| load::<Review>(&self.client, l.review_id)),
        )
        .await?;
        Ok(reviews.into_iter().flatten().collect())
    }

    async fn save(&self, entity: &mut Review) -> Result<bool, DataAccessError> {
        let is_new = entity.revision().is_none();
        let saved = store(&self.client, entity).await?;
        if saved && is_new {
            append_index(
                &self.client,
                &resource_reviews_stream(entity.resource_id()),
                "ReviewListed",
                &ReviewListed {
                    review_id: entity.id(),
                },
                ExpectedRevision::Any,
            )
            .await?;
        }
        Ok(saved)
    }
}
