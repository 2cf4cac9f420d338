use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use derive_more::{Deref, Display, Error, From};
use serde::{Deserialize, Serialize};

use crate::domain::{Aggregation, DataAccessError, Entity, Event, EventQueue, Id};

use super::{RequestId, ResourceId, UserId};

/// Review repository
#[async_trait]
pub trait ReviewRepository: Send + Sync {
    async fn find_by_id(&self, id: ReviewId) -> Result<Option<Review>, DataAccessError>;
    async fn find_by_request(&self, request_id: RequestId)
        -> Result<Option<Review>, DataAccessError>;
    async fn find_by_resource(&self, resource_id: ResourceId)
        -> Result<Vec<Review>, DataAccessError>;
    /// A new review fails with [`DataAccessError::ConcurrencyError`] when its request already has one.
    /// Reviews carry their request's id, so this is the usual create-only check.
    async fn save(&self, entity: &mut Review) -> Result<bool, DataAccessError>;
}

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Deref, Default,
)]
pub struct ReviewId(u64);

impl Id for ReviewId {
    type Inner = u64;
}

/// Star rating, 1 to 5.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, Deref)]
#[serde(try_from = "u8", into = "u8")]
pub struct Rating(u8);

impl Rating {
    pub fn new(value: u8) -> Result<Self, ReviewError> {
        match value {
            1..=5 => Ok(Self(value)),
            _ => Err(ReviewError::RatingOutOfRange),
        }
    }
}

impl TryFrom<u8> for Rating {
    type Error = ReviewError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Rating::new(value)
    }
}

impl From<Rating> for u8 {
    fn from(value: Rating) -> Self {
        value.0
    }
}

impl Default for Rating {
    fn default() -> Self {
        Rating(5)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub text: String,
    pub responded_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewEvent {
    ReviewSubmitted {
        id: ReviewId,
        request_id: RequestId,
        resource_id: ResourceId,
        author: UserId,
        rating: Rating,
        comment: Option<String>,
        at: DateTime<Utc>,
    },
    ReviewRatingChanged {
        id: ReviewId,
        rating: Rating,
        at: DateTime<Utc>,
    },
    ReviewCommentChanged {
        id: ReviewId,
        comment: Option<String>,
        at: DateTime<Utc>,
    },
    ReviewResponded {
        id: ReviewId,
        response: ProviderResponse,
    },
}

impl Event for ReviewEvent {
    type Id = ReviewId;
}

/// Changes an author may make to their review.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReviewEdit {
    pub rating: Option<Rating>,
    /// `Some(None)` clears the comment.
    pub comment: Option<Option<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Review {
    id: ReviewId,
    request_id: RequestId,
    resource_id: ResourceId,
    author: UserId,
    rating: Rating,
    comment: Option<String>,
    response: Option<ProviderResponse>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(skip)]
    revision: Option<u64>,
    #[serde(skip)]
    events: EventQueue<ReviewEvent>,
}

impl Review {
    /// Opens the review of `request_id`. A review shares its request's id, so a request
    /// can never carry two of them.
    pub fn submit(
        request_id: RequestId,
        resource_id: ResourceId,
        author: UserId,
        rating: Rating,
        comment: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<Self, ReviewError> {
        let mut entity = Review::default();
        entity.record(ReviewEvent::ReviewSubmitted {
            id: ReviewId::from(*request_id),
            request_id,
            resource_id,
            author,
            rating,
            comment,
            at,
        })?;
        Ok(entity)
    }

    /// Applies an author's edit. Returns whether the rating changed.
    pub fn edit(
        &mut self,
        edit: ReviewEdit,
        at: DateTime<Utc>,
        window: Duration,
    ) -> Result<bool, ReviewError> {
        if at - self.created_at > window {
            return Err(ReviewError::EditWindowClosed);
        }
        let mut rating_changed = false;
        if let Some(rating) = edit.rating.filter(|r| *r != self.rating) {
            self.record(ReviewEvent::ReviewRatingChanged {
                id: self.id,
                rating,
                at,
            })?;
            rating_changed = true;
        }
        if let Some(comment) = edit.comment.filter(|c| *c != self.comment) {
            self.record(ReviewEvent::ReviewCommentChanged {
                id: self.id,
                comment,
                at,
            })?;
        }
        Ok(rating_changed)
    }

    pub fn respond(&mut self, text: String, at: DateTime<Utc>) -> Result<(), ReviewError> {
        self.record(ReviewEvent::ReviewResponded {
            id: self.id,
            response: ProviderResponse {
                text,
                responded_at: at,
            },
        })
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn resource_id(&self) -> ResourceId {
        self.resource_id
    }

    pub fn author(&self) -> UserId {
        self.author
    }

    pub fn rating(&self) -> Rating {
        self.rating
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub fn response(&self) -> Option<&ProviderResponse> {
        self.response.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn validate_id(&self, id: &ReviewId) -> Result<(), ReviewError> {
        match self.id == *id {
            true => Ok(()),
            false => Err(ReviewError::MismatchedId),
        }
    }
}

impl Entity for Review {
    type Id = ReviewId;

    const ENTITY_NAME: &'static str = "review";

    fn id(&self) -> Self::Id {
        self.id
    }
}

impl Aggregation for Review {
    type Event = ReviewEvent;
    type Error = ReviewError;

    fn validate(&self, event: &Self::Event) -> Result<(), Self::Error> {
        match event {
            ReviewEvent::ReviewSubmitted { .. } => {
                match self.revision.is_some() || self.has_changes() {
                    true => Err(ReviewError::AlreadySubmitted),
                    false => Ok(()),
                }
            }
            ReviewEvent::ReviewRatingChanged { id, .. }
            | ReviewEvent::ReviewCommentChanged { id, .. } => self.validate_id(id),
            ReviewEvent::ReviewResponded { id, response } => {
                self.validate_id(id)?;
                if self.response.is_some() {
                    return Err(ReviewError::AlreadyResponded);
                }
                if response.text.trim().is_empty() {
                    return Err(ReviewError::ResponseRequired);
                }
                Ok(())
            }
        }
    }

    fn apply(&mut self, event: Self::Event) {
        match event {
            ReviewEvent::ReviewSubmitted {
                id,
                request_id,
                resource_id,
                author,
                rating,
                comment,
                at,
            } => {
                self.id = id;
                self.request_id = request_id;
                self.resource_id = resource_id;
                self.author = author;
                self.rating = rating;
                self.comment = comment;
                self.created_at = at;
                self.updated_at = at;
            }
            ReviewEvent::ReviewRatingChanged { rating, at, .. } => {
                self.rating = rating;
                self.updated_at = at;
            }
            ReviewEvent::ReviewCommentChanged { comment, at, .. } => {
                self.comment = comment;
                self.updated_at = at;
            }
            ReviewEvent::ReviewResponded { response, .. } => self.response = Some(response),
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

impl PartialEq for Review {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.request_id == other.request_id
            && self.resource_id == other.resource_id
            && self.author == other.author
            && self.rating == other.rating
            && self.comment == other.comment
            && self.response == other.response
    }
}

#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
pub enum ReviewError {
    #[display(fmt = "Mismatched id")]
    MismatchedId,
    #[display(fmt = "Rating must be between 1 and 5")]
    RatingOutOfRange,
    #[display(fmt = "Review was already submitted")]
    AlreadySubmitted,
    #[display(fmt = "Reviews can only be edited shortly after submission")]
    EditWindowClosed,
    #[display(fmt = "Review already has a response")]
    AlreadyResponded,
    #[display(fmt = "Response text is not specified")]
    ResponseRequired,
}

/// Average rating and review count of a resource.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RatingSummary {
    pub average_rating: f64,
    pub total_reviews: u32,
}

impl RatingSummary {
    /// Arithmetic mean rounded to two decimals. No ratings average to zero.
    pub fn from_ratings<I>(ratings: I) -> Self
    where
        I: IntoIterator<Item = Rating>,
    {
        let (sum, count) = ratings
            .into_iter()
            .fold((0u64, 0u32), |(sum, count), r| (sum + u64::from(*r), count + 1));
        if count == 0 {
            return Self::default();
        }
        let mean = sum as f64 / f64::from(count);
        Self {
            average_rating: (mean * 100.0).round() / 100.0,
            total_reviews: count,
        }
    }
}
