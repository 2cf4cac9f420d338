use std::{error::Error, time::Duration};

use async_trait::async_trait;
use eventstore::{ClientSettings, Position, StreamPosition, SubscribeToAllOptions};
use hireloop::{
    domain::core::{AgencyEvent, AgencyId, CoreEvent, GeoPoint, Resource, ResourceEvent},
    infrastructure::search::{
        AgencyDocument, MeiliGeo, ResourceDocument, AGENCY_INDEX, RESOURCE_INDEX,
    },
    HireloopConfig,
};
use meilisearch_sdk::{task_info::TaskInfo, tasks::Task};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn, Level};
use uuid::Uuid;

static VERSION_UID: &str = "eventstore_version";

/// Agency members fetched per page when an agency moves.
const MEMBER_PAGE: usize = 500;
/// A projection failing this often stops the daemon before its position moves past the event.
const PROJECT_ATTEMPTS: u32 = 5;

#[tokio::main]
async fn main() {
    match HireloopConfig::load() {
        Ok(config) => {
            tracing_subscriber::fmt()
                .with_max_level(Level::from(&config.logger.level))
                .init();
            if let Err(error) = subscribe(&config).await {
                error!("sync stopped: {}", error);
            }
        }
        Err(error) => {
            tracing_subscriber::fmt::init();
            error!("failed to load configuration: {}", error)
        }
    }
}

#[derive(Serialize, Deserialize)]
struct EventstoreVersion {
    id: u64,
    event_id: Uuid,
    position: Position,
}

async fn subscribe(config: &HireloopConfig) -> Result<(), Box<dyn Error>> {
    let settings = config.eventstore.url.parse::<ClientSettings>()?;
    let mut client = Client {
        eventstore: eventstore::Client::new(settings)?,
        meilisearch: meilisearch_sdk::Client::new(
            &config.meilisearch.url,
            &config.meilisearch.api_key,
        ),
        task_info: None,
    };
    client.prepare_indexes().await?;

    let start = match client
        .meilisearch
        .index(VERSION_UID)
        .get_document::<EventstoreVersion>("1")
        .await
    {
        Ok(version) => {
            info!("resuming after event {}", version.event_id);
            StreamPosition::Position(version.position)
        }
        Err(e) => {
            warn!("no stored position ({}), projecting from the start", e);
            StreamPosition::Start
        }
    };
    let mut sub = client
        .eventstore
        .subscribe_to_all(&SubscribeToAllOptions::default().position(start))
        .await;
    loop {
        match sub.next().await {
            Ok(resolved) => {
                if let Ok(core_event) = CoreEvent::try_from(&resolved) {
                    debug!("domain event received: {:?}", core_event);
                    if let Err(e) = client.project(core_event).await {
                        error!(
                            "giving up on event {}, position stays at the previous one",
                            resolved.get_original_event().id
                        );
                        return Err(Box::new(e));
                    }
                } else {
                    debug!("skipping event of stream {}", resolved.get_original_stream_id());
                }
                let event = resolved.get_original_event();
                if let Err(e) = client
                    .meilisearch
                    .index(VERSION_UID)
                    .add_documents(
                        &[EventstoreVersion {
                            id: 1,
                            event_id: event.id,
                            position: event.position,
                        }],
                        Some("id"),
                    )
                    .await
                {
                    error!("failed to store position: {}", e);
                }
            }
            Err(e) => return Err(Box::new(e)),
        }
    }
}

/// Delay before retrying after failed `attempt`, or `None` once attempts are used up.
fn backoff(attempt: u32) -> Option<Duration> {
    (attempt < PROJECT_ATTEMPTS).then(|| Duration::from_millis(200 << attempt))
}

#[async_trait]
pub trait Execute<E> {
    type Error: Error;
    async fn execute(&mut self, event: E) -> Result<(), Self::Error>;
}

struct Client {
    eventstore: eventstore::Client,
    meilisearch: meilisearch_sdk::Client,
    task_info: Option<TaskInfo>,
}

impl Client {
    async fn project(&mut self, event: CoreEvent) -> Result<(), meilisearch_sdk::errors::Error> {
        let mut attempt = 1;
        loop {
            match self.execute(event.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => match backoff(attempt) {
                    Some(delay) => {
                        warn!(
                            "failed to project event, attempt {}/{}: {}",
                            attempt, PROJECT_ATTEMPTS, e
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(e),
                },
            }
        }
    }

    async fn wait_for_completion(&self) -> Result<Option<Task>, meilisearch_sdk::errors::Error> {
        if let Some(task_info) = &self.task_info {
            loop {
                match self.meilisearch.wait_for_task(task_info, None, None).await {
                    Ok(task) => match task {
                        Task::Succeeded { .. } | Task::Failed { .. } => return Ok(Some(task)),
                        _ => continue,
                    },
                    Err(meilisearch_sdk::errors::Error::Timeout) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(None)
    }

    /// Geo search needs `_geo` filterable and sortable before the first query, and the
    /// search filters must be applied by the index so they count towards its limit.
    async fn prepare_indexes(&mut self) -> Result<(), meilisearch_sdk::errors::Error> {
        let resources = self.meilisearch.index(RESOURCE_INDEX);
        resources
            .set_filterable_attributes(&[
                "_geo",
                "service_type_ids",
                "agency_id",
                "verified",
                "is_available",
            ])
            .await?;
        self.task_info = Some(resources.set_sortable_attributes(&["_geo"]).await?);
        self.wait_for_completion().await?;
        Ok(())
    }

    async fn agency_point(&self, agency_id: AgencyId) -> Option<GeoPoint> {
        self.meilisearch
            .index(AGENCY_INDEX)
            .get_document::<AgencyDocument>(&agency_id.to_string())
            .await
            .ok()
            .and_then(|agency| agency.point())
    }

    /// Moves every indexed member of an agency to its new position.
    async fn relocate_members(
        &mut self,
        agency_id: AgencyId,
        geo: MeiliGeo,
    ) -> Result<(), meilisearch_sdk::errors::Error> {
        let index = self.meilisearch.index(RESOURCE_INDEX);
        let filter = format!("agency_id = {}", agency_id);
        let mut offset = 0;
        loop {
            let page = index
                .search()
                .with_filter(&filter)
                .with_offset(offset)
                .with_limit(MEMBER_PAGE)
                .execute::<ResourceDocument>()
                .await?;
            let mut members = page
                .hits
                .into_iter()
                .map(|hit| hit.result)
                .collect::<Vec<_>>();
            if members.is_empty() {
                return Ok(());
            }
            offset += members.len();
            members.iter_mut().for_each(|m| m.geo = Some(geo));
            info!("moving {} members of agency {}", members.len(), agency_id);
            self.task_info = Some(index.add_or_update(&members, Some("id")).await?);
        }
    }
}

#[async_trait]
impl Execute<CoreEvent> for Client {
    type Error = meilisearch_sdk::errors::Error;
    async fn execute(&mut self, event: CoreEvent) -> Result<(), Self::Error> {
        match event {
            CoreEvent::AgencyEvent(event) => self.execute(event).await,
            CoreEvent::ResourceEvent(event) => self.execute(event).await,
            CoreEvent::ServiceRequestEvent(_)
            | CoreEvent::TimelineEvent(_)
            | CoreEvent::ReviewEvent(_) => Ok(()),
        }
    }
}

#[async_trait]
impl Execute<AgencyEvent> for Client {
    type Error = meilisearch_sdk::errors::Error;
    async fn execute(&mut self, event: AgencyEvent) -> Result<(), Self::Error> {
        let index = self.meilisearch.index(AGENCY_INDEX);
        let task = match event {
            AgencyEvent::AgencyRegistered {
                id, name, location, ..
            } => {
                let document = AgencyDocument {
                    id,
                    name,
                    geo: Some(location.point.into()),
                };
                index.add_documents(&[document], Some("id")).await?
            }
            AgencyEvent::AgencyRelocated { id, location } => {
                self.wait_for_completion().await?;
                let mut document = index.get_document::<AgencyDocument>(&id.to_string()).await?;
                let geo = MeiliGeo::from(location.point);
                document.geo = Some(geo);
                self.task_info = Some(index.add_or_update(&[document], Some("id")).await?);
                self.relocate_members(id, geo).await?;
                return Ok(());
            }
            AgencyEvent::ManagerAdded { .. } | AgencyEvent::ManagerRemoved { .. } => {
                return Ok(())
            }
        };
        self.task_info = Some(task);
        Ok(())
    }
}

#[async_trait]
impl Execute<ResourceEvent> for Client {
    type Error = meilisearch_sdk::errors::Error;
    async fn execute(&mut self, event: ResourceEvent) -> Result<(), Self::Error> {
        let index = self.meilisearch.index(RESOURCE_INDEX);
        let task = match event {
            ResourceEvent::ResourceRegistered {
                id,
                display_name,
                contact,
                kind,
                offerings,
            } => match Resource::register(id, display_name, contact, kind, offerings) {
                Ok(entity) => {
                    let agency_point = match entity.agency_id() {
                        Some(agency_id) => {
                            self.wait_for_completion().await?;
                            self.agency_point(agency_id).await
                        }
                        None => None,
                    };
                    let document = ResourceDocument::new(&entity, agency_point);
                    index.add_documents(&[document], Some("id")).await?
                }
                Err(e) => {
                    warn!("skipping invalid resource {}: {}", id, e);
                    return Ok(());
                }
            },
            ResourceEvent::AvailabilityChanged { id, .. }
            | ResourceEvent::ResourceVerified { id, .. }
            | ResourceEvent::OfferingAdded { id, .. }
            | ResourceEvent::OfferingRemoved { id, .. }
            | ResourceEvent::ResourceRelocated { id, .. }
            | ResourceEvent::RatingRecomputed { id, .. } => {
                self.wait_for_completion().await?;
                let mut document = index
                    .get_document::<ResourceDocument>(&id.to_string())
                    .await?;
                document.apply(&event);
                index.add_or_update(&[document], Some("id")).await?
            }
        };
        self.task_info = Some(task);
        Ok(())
    }
}
