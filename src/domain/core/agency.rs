use async_trait::async_trait;
use derive_more::{Deref, Display, Error, From};
use serde::{Deserialize, Serialize};

use crate::domain::{Aggregation, DataAccessError, Entity, Event, EventQueue, Id};

use super::{Location, UserId};

/// Agency repository
#[async_trait]
pub trait AgencyRepository: Send + Sync {
    async fn find_by_id(&self, id: AgencyId) -> Result<Option<Agency>, DataAccessError>;
    async fn save(&self, entity: &mut Agency) -> Result<bool, DataAccessError>;
}

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Deref, Default,
)]
pub struct AgencyId(u64);

impl Id for AgencyId {
    type Inner = u64;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AgencyEvent {
    AgencyRegistered {
        id: AgencyId,
        name: String,
        owner: UserId,
        location: Location,
    },
    ManagerAdded {
        id: AgencyId,
        user_id: UserId,
    },
    ManagerRemoved {
        id: AgencyId,
        user_id: UserId,
    },
    AgencyRelocated {
        id: AgencyId,
        location: Location,
    },
}

impl Event for AgencyEvent {
    type Id = AgencyId;
}

/// An organisation scheduling a pool of member resources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Agency {
    id: AgencyId,
    name: String,
    owner: UserId,
    managers: Vec<UserId>,
    location: Option<Location>,
    #[serde(skip)]
    revision: Option<u64>,
    #[serde(skip)]
    events: EventQueue<AgencyEvent>,
}

impl Agency {
    pub fn register(
        id: AgencyId,
        name: String,
        owner: UserId,
        location: Location,
    ) -> Result<Self, AgencyError> {
        let mut entity = Agency::default();
        entity.record(AgencyEvent::AgencyRegistered {
            id,
            name,
            owner,
            location,
        })?;
        Ok(entity)
    }

    pub fn add_manager(&mut self, user_id: UserId) -> Result<(), AgencyError> {
        self.record(AgencyEvent::ManagerAdded {
            id: self.id,
            user_id,
        })
    }

    pub fn remove_manager(&mut self, user_id: UserId) -> Result<(), AgencyError> {
        self.record(AgencyEvent::ManagerRemoved {
            id: self.id,
            user_id,
        })
    }

    pub fn relocate(&mut self, location: Location) -> Result<(), AgencyError> {
        self.record(AgencyEvent::AgencyRelocated {
            id: self.id,
            location,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> UserId {
        self.owner
    }

    pub fn managers(&self) -> &[UserId] {
        &self.managers
    }

    pub fn location(&self) -> Option<&Location> {
        self.location.as_ref()
    }

    /// Owner or manager.
    pub fn can_manage(&self, user_id: UserId) -> bool {
        self.owner == user_id || self.managers.contains(&user_id)
    }

    fn validate_id(&self, id: &AgencyId) -> Result<(), AgencyError> {
        match self.id == *id {
            true => Ok(()),
            false => Err(AgencyError::MismatchedId),
        }
    }
}

impl Entity for Agency {
    type Id = AgencyId;

    const ENTITY_NAME: &'static str = "agency";

    fn id(&self) -> Self::Id {
        self.id
    }
}

impl Aggregation for Agency {
    type Event = AgencyEvent;
    type Error = AgencyError;

    fn validate(&self, event: &Self::Event) -> Result<(), Self::Error> {
        match event {
            AgencyEvent::AgencyRegistered { name, .. } => {
                if self.revision.is_some() || self.has_changes() {
                    return Err(AgencyError::AlreadyRegistered);
                }
                if name.trim().is_empty() {
                    return Err(AgencyError::NameRequired);
                }
                Ok(())
            }
            AgencyEvent::ManagerAdded { id, user_id } => {
                self.validate_id(id)?;
                if self.can_manage(*user_id) {
                    return Err(AgencyError::DuplicateManager);
                }
                Ok(())
            }
            AgencyEvent::ManagerRemoved { id, user_id } => {
                self.validate_id(id)?;
                if !self.managers.contains(user_id) {
                    return Err(AgencyError::ManagerNotFound);
                }
                Ok(())
            }
            AgencyEvent::AgencyRelocated { id, .. } => self.validate_id(id),
        }
    }

    fn apply(&mut self, event: Self::Event) {
        match event {
            AgencyEvent::AgencyRegistered {
                id,
                name,
                owner,
                location,
            } => {
                self.id = id;
                self.name = name;
                self.owner = owner;
                self.location = Some(location);
            }
            AgencyEvent::ManagerAdded { user_id, .. } => self.managers.push(user_id),
            AgencyEvent::ManagerRemoved { user_id, .. } => self.managers.retain(|m| *m != user_id),
            AgencyEvent::AgencyRelocated { location, .. } => self.location = Some(location),
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

impl PartialEq for Agency {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.owner == other.owner
            && self.managers == other.managers
            && self.location == other.location
    }
}

#[derive(Error, Display, Debug, PartialEq, Eq)]
pub enum AgencyError {
    #[display(fmt = "Mismatched id")]
    MismatchedId,
    #[display(fmt = "Agency is already registered")]
    AlreadyRegistered,
    #[display(fmt = "Agency name is not specified")]
    NameRequired,
    #[display(fmt = "User already manages this agency")]
    DuplicateManager,
    #[display(fmt = "User is not a manager of this agency")]
    ManagerNotFound,
}
