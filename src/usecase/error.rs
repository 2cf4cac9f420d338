use std::{future::Future, time::Duration};

use thiserror::Error;
use tracing::warn;

use crate::domain::{
    core::{AgencyError, GeoError, RequestError, ResourceError, ReviewError, TimelineError},
    DataAccessError,
};

/// Errors surfaced by marketplace operations.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid input: {0}")]
    Validation(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: u64 },
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Store call timed out, the outcome is unknown")]
    StoreTimeout,
    #[error("Store error: {0}")]
    Store(#[source] DataAccessError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    pub fn not_found(entity: &'static str, id: u64) -> Self {
        ServiceError::NotFound { entity, id }
    }

    pub fn slot_taken() -> Self {
        ServiceError::Conflict("time slot no longer available".to_owned())
    }

    /// Timeouts and transient store failures may be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::StoreTimeout => true,
            ServiceError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<DataAccessError> for ServiceError {
    fn from(value: DataAccessError) -> Self {
        match value {
            DataAccessError::Timeout => ServiceError::StoreTimeout,
            DataAccessError::ConcurrencyError(stream) => {
                ServiceError::Conflict(format!("{} was modified concurrently, reload it", stream))
            }
            e => ServiceError::Store(e),
        }
    }
}

impl From<GeoError> for ServiceError {
    fn from(value: GeoError) -> Self {
        ServiceError::Validation(value.to_string())
    }
}

impl From<TimelineError> for ServiceError {
    fn from(value: TimelineError) -> Self {
        match value {
            TimelineError::Overlapping { .. } => ServiceError::slot_taken(),
            TimelineError::InvalidStatusTransition { .. } | TimelineError::NotMovable => {
                ServiceError::InvalidTransition(value.to_string())
            }
            TimelineError::DuplicateBooking => ServiceError::Conflict(value.to_string()),
            TimelineError::BookingNotFound { booking_id } => {
                ServiceError::not_found("booking", *booking_id)
            }
            TimelineError::InvalidDuration
            | TimelineError::FractionalDuration
            | TimelineError::MismatchedId => ServiceError::Validation(value.to_string()),
        }
    }
}

impl From<RequestError> for ServiceError {
    fn from(value: RequestError) -> Self {
        match value {
            RequestError::AlreadyTerminal { .. }
            | RequestError::AssignmentMismatch
            | RequestError::AlreadyCreated => ServiceError::Conflict(value.to_string()),
            RequestError::InvalidTransition { .. } => {
                ServiceError::InvalidTransition(value.to_string())
            }
            RequestError::MismatchedId
            | RequestError::DescriptionRequired
            | RequestError::MissingAssignment
            | RequestError::InvalidSchedule => ServiceError::Validation(value.to_string()),
        }
    }
}

impl From<ReviewError> for ServiceError {
    fn from(value: ReviewError) -> Self {
        match value {
            ReviewError::AlreadySubmitted
            | ReviewError::AlreadyResponded
            | ReviewError::EditWindowClosed => ServiceError::Conflict(value.to_string()),
            ReviewError::MismatchedId
            | ReviewError::RatingOutOfRange
            | ReviewError::ResponseRequired => ServiceError::Validation(value.to_string()),
        }
    }
}

impl From<ResourceError> for ServiceError {
    fn from(value: ResourceError) -> Self {
        match value {
            ResourceError::AlreadyRegistered | ResourceError::DuplicateOffering => {
                ServiceError::Conflict(value.to_string())
            }
            _ => ServiceError::Validation(value.to_string()),
        }
    }
}

impl From<AgencyError> for ServiceError {
    fn from(value: AgencyError) -> Self {
        match value {
            AgencyError::AlreadyRegistered | AgencyError::DuplicateManager => {
                ServiceError::Conflict(value.to_string())
            }
            _ => ServiceError::Validation(value.to_string()),
        }
    }
}

/// Runs one store call under `limit`. An elapsed call is reported as [`DataAccessError::Timeout`].
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, DataAccessError>
where
    F: Future<Output = Result<T, DataAccessError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            warn!("store call exceeded {:?}", limit);
            Err(DataAccessError::Timeout)
        }
    }
}
