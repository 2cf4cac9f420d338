use async_trait::async_trait;
use eventstore::Client;

use crate::domain::{
    core::{RequestId, ServiceRequest, ServiceRequestRepository},
    DataAccessError,
};
use crate::infrastructure::{load, store};

#[derive(Clone)]
pub struct EventStoreServiceRequestRepository {
    client: Client,
}

impl EventStoreServiceRequestRepository {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ServiceRequestRepository for EventStoreServiceRequestRepository {
    async fn find_by_id(&self, id: RequestId) -> Result<Option<ServiceRequest>, DataAccessError> {
        load(&self.client, id).await
    }

    async fn save(&self, entity: &mut ServiceRequest) -> Result<bool, DataAccessError> {
        store(&self.client, entity).await
    }
}
