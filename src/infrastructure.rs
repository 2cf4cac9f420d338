pub mod core;
pub mod memory;
pub mod search;

use std::{fmt::Display, str::FromStr};

use eventstore::{AppendToStreamOptions, Client, EventData, ExpectedRevision, ResolvedEvent};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::debug;

use crate::domain::{Aggregation, DataAccessError, Entity, Event, Id};

impl From<eventstore::Error> for DataAccessError {
    fn from(value: eventstore::Error) -> Self {
        match value {
            eventstore::Error::ConnectionClosed
            | eventstore::Error::Grpc { .. }
            | eventstore::Error::GrpcConnectionError(_)
            | eventstore::Error::DeadlineExceeded
            | eventstore::Error::InitializationError(_) => Self::ConnectionError(Box::new(value)),
            eventstore::Error::ServerError(_)
            | eventstore::Error::NotLeaderException(_)
            | eventstore::Error::AccessDenied
            | eventstore::Error::UnsupportedFeature
            | eventstore::Error::InternalParsingError(_)
            | eventstore::Error::InternalClientError => Self::QueryError(Box::new(value)),
            eventstore::Error::ResourceNotFound | eventstore::Error::ResourceDeleted => {
                Self::ReadError(Box::new(value))
            }
            eventstore::Error::WrongExpectedVersion { .. } => {
                Self::ConcurrencyError(value.to_string())
            }
            eventstore::Error::ResourceAlreadyExists => Self::WriteError(Box::new(value)),
            eventstore::Error::IllegalStateError(_) => Self::ClientSideError(Box::new(value)),
        }
    }
}

impl From<EventConvertError> for DataAccessError {
    fn from(value: EventConvertError) -> Self {
        DataAccessError::ClientSideError(Box::new(value))
    }
}

#[derive(Debug)]
pub struct EventConvertError;

impl std::error::Error for EventConvertError {}

impl Display for EventConvertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Failed to convert event")
    }
}

impl From<serde_json::Error> for EventConvertError {
    fn from(_value: serde_json::Error) -> Self {
        EventConvertError
    }
}

fn entity_id<I, T>(stream_id: &str) -> Option<I>
where
    I: Id<Inner = T>,
    T: FromStr,
{
    stream_id
        .rsplit('-')
        .next()
        .and_then(|s| s.parse::<T>().ok())
        .map(I::from)
}

pub(crate) fn stream_name<E: Entity>(id: E::Id) -> String {
    format!("{}-{}", E::ENTITY_NAME, id)
}

/// Splits an externally tagged event into its type and a payload without the stream id.
fn event_payload<E: Event>(event: E) -> Result<(String, Value), EventConvertError> {
    let root = serde_json::to_value(event)?;
    let (event_type, data) = root
        .as_object()
        .and_then(|o| o.iter().next())
        .ok_or(EventConvertError)?;
    let mut data = data.clone();
    data.as_object_mut().ok_or(EventConvertError)?.remove("id");
    Ok((event_type.clone(), data))
}

/// Inverse of [`event_payload`]; the id comes back from the stream name.
fn event_from_payload<E, I>(
    stream_id: &str,
    event_type: &str,
    payload: &[u8],
) -> Result<E, EventConvertError>
where
    E: DeserializeOwned + Event<Id = I>,
    I: Id,
{
    let id = entity_id::<I, I::Inner>(stream_id).ok_or(EventConvertError)?;
    let mut data: Value = serde_json::from_slice(payload)?;
    data.as_object_mut()
        .ok_or(EventConvertError)?
        .insert("id".to_owned(), json!(id));
    Ok(serde_json::from_value(json!({ event_type: data }))?)
}

pub(crate) fn from_event<E: Event>(event: E) -> Result<EventData, EventConvertError> {
    let (event_type, data) = event_payload(event)?;
    Ok(EventData::json(event_type, data)?)
}

pub(crate) fn try_from_resolved_event<E, I>(value: &ResolvedEvent) -> Result<E, EventConvertError>
where
    E: DeserializeOwned + Event<Id = I>,
    I: Id,
{
    let event = value.get_original_event();
    event_from_payload(&event.stream_id, &event.event_type, event.data.as_ref())
}

/// Replays an aggregate's stream. Missing and deleted streams read as `None`.
pub(crate) async fn load<A: Aggregation>(
    client: &Client,
    id: A::Id,
) -> Result<Option<A>, DataAccessError> {
    let mut stream = client
        .read_stream(stream_name::<A>(id), &Default::default())
        .await?;
    let mut entity = A::default();
    let mut revision = None;
    loop {
        match stream.next().await {
            Ok(Some(e)) => {
                entity.apply(try_from_resolved_event(&e)?);
                revision = Some(e.get_original_event().revision);
            }
            Ok(None) => break,
            Err(eventstore::Error::ResourceDeleted) => return Ok(None),
            Err(eventstore::Error::ResourceNotFound) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(revision.map(|r| {
        entity.set_revision(Some(r));
        entity
    }))
}

/// Appends pending events, expecting the stream to be exactly where the aggregate last saw it.
pub(crate) async fn store<A: Aggregation>(
    client: &Client,
    entity: &mut A,
) -> Result<bool, DataAccessError> {
    if !entity.has_changes() {
        return Ok(false);
    }
    let stream = stream_name::<A>(entity.id());
    let expected = match entity.revision() {
        Some(r) => ExpectedRevision::Exact(r),
        None => ExpectedRevision::NoStream,
    };
    let events = entity
        .events()
        .iter()
        .cloned()
        .map(from_event)
        .collect::<Result<Vec<_>, _>>()?;
    let count = events.len() as u64;
    match client
        .append_to_stream(
            stream.as_str(),
            &AppendToStreamOptions::default().expected_revision(expected),
            events,
        )
        .await
    {
        Ok(_) => {
            let revision = entity.revision().map_or(count - 1, |r| r + count);
            entity.clear();
            entity.set_revision(Some(revision));
            debug!("appended {} events to {}", count, stream);
            Ok(true)
        }
        Err(eventstore::Error::WrongExpectedVersion { .. }) => {
            Err(DataAccessError::ConcurrencyError(stream))
        }
        Err(e) => Err(e.into()),
    }
}
