mod agency;
mod geo;
mod request;
mod resource;
mod review;
mod timeline;

use derive_more::{Deref, Display, From};
use serde::{Deserialize, Serialize};

use crate::domain::Id;

pub use self::agency::*;
pub use self::geo::*;
pub use self::request::*;
pub use self::resource::*;
pub use self::review::*;
pub use self::timeline::*;

/// Platform user id as issued by the identity provider.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Deref, Default,
)]
pub struct UserId(u64);

impl Id for UserId {
    type Inner = u64;
}

/// Service catalog entry id.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Deref, Default,
)]
pub struct ServiceTypeId(u64);

impl Id for ServiceTypeId {
    type Inner = u64;
}

#[derive(Clone, Debug, PartialEq)]
pub enum CoreEvent {
    AgencyEvent(AgencyEvent),
    ResourceEvent(ResourceEvent),
    ServiceRequestEvent(ServiceRequestEvent),
    TimelineEvent(TimelineEvent),
    ReviewEvent(ReviewEvent),
}
