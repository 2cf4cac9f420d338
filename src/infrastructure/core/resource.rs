use async_trait::async_trait;
use eventstore::Client;

use crate::domain::{
    core::{Resource, ResourceId, ResourceRepository},
    DataAccessError,
};
use crate::infrastructure::{load, store};

#[derive(Clone)]
pub struct EventStoreResourceRepository {
    client: Client,
}

impl EventStoreResourceRepository {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResourceRepository for EventStoreResourceRepository {
    async fn find_by_id(&self, id: ResourceId) -> Result<Option<Resource>, DataAccessError> {
        load(&self.client, id).await
    }

    async fn save(&self, entity: &mut Resource) -> Result<bool, DataAccessError> {
        store(&self.client, entity).await
    }
}
