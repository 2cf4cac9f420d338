use async_trait::async_trait;
use eventstore::Client;

use crate::domain::{
    core::{Agency, AgencyId, AgencyRepository},
    DataAccessError,
};
use crate::infrastructure::{load, store};

#[derive(Clone)]
pub struct EventStoreAgencyRepository {
    client: Client,
}

impl EventStoreAgencyRepository {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AgencyRepository for EventStoreAgencyRepository {
    async fn find_by_id(&self, id: AgencyId) -> Result<Option<Agency>, DataAccessError> {
        load(&self.client, id).await
    }

    async fn save(&self, entity: &mut Agency) -> Result<bool, DataAccessError> {
        store(&self.client, entity).await
    }
}
