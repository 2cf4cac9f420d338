mod agency;
mod request;
mod resource;
mod review;
mod timeline;

use eventstore::{
    AppendToStreamOptions, Client, EventData, ExpectedRevision, ReadStreamOptions, ResolvedEvent,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::domain::{
    core::{Agency, CoreEvent, Resource, Review, ServiceRequest, Timeline},
    DataAccessError, Entity,
};

pub use self::agency::*;
pub use self::request::*;
pub use self::resource::*;
pub use self::review::*;
pub use self::timeline::*;

use super::{try_from_resolved_event, EventConvertError};

impl TryFrom<&ResolvedEvent> for CoreEvent {
    type Error = EventConvertError;

    fn try_from(value: &ResolvedEvent) -> Result<Self, Self::Error> {
        let x = value
            .get_original_stream_id()
            .split('-')
            .next()
            .ok_or(EventConvertError)?;
        match x {
            Agency::ENTITY_NAME => Ok(CoreEvent::AgencyEvent(try_from_resolved_event(value)?)),
            Resource::ENTITY_NAME => Ok(CoreEvent::ResourceEvent(try_from_resolved_event(value)?)),
            ServiceRequest::ENTITY_NAME => Ok(CoreEvent::ServiceRequestEvent(
                try_from_resolved_event(value)?,
            )),
            Timeline::ENTITY_NAME => Ok(CoreEvent::TimelineEvent(try_from_resolved_event(value)?)),
            Review::ENTITY_NAME => Ok(CoreEvent::ReviewEvent(try_from_resolved_event(value)?)),
            _ => Err(EventConvertError),
        }
    }
}

/// Appends one lookup record to an index stream.
async fn append_index<T: Serialize>(
    client: &Client,
    stream: &str,
    event_type: &str,
    record: &T,
    expected: ExpectedRevision,
) -> Result<(), DataAccessError> {
    let event = EventData::json(event_type, record).map_err(EventConvertError::from)?;
    client
        .append_to_stream(
            stream,
            &AppendToStreamOptions::default().expected_revision(expected),
            event,
        )
        .await?;
    Ok(())
}

/// Reads every record of an index stream. A missing stream is an empty index.
async fn read_index<T: DeserializeOwned>(
    client: &Client,
    stream: &str,
) -> Result<Vec<T>, DataAccessError> {
    let mut reader = client
        .read_stream(stream, &ReadStreamOptions::default())
        .await?;
    let mut records = Vec::new();
    loop {
        match reader.next().await {
            Ok(Some(e)) => {
                let data = e.get_original_event().data.as_ref();
                records.push(serde_json::from_slice(data).map_err(EventConvertError::from)?);
            }
            Ok(None) => break,
            Err(eventstore::Error::ResourceDeleted) | Err(eventstore::Error::ResourceNotFound) => {
                break
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(records)
}
