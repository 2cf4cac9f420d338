mod auth;
mod availability;
mod error;
mod ledger;
mod marketplace;
mod notify;
mod rating;
mod search;

pub use self::auth::*;
pub use self::availability::*;
pub use self::error::*;
pub use self::ledger::*;
pub use self::marketplace::*;
pub use self::notify::*;
pub use self::rating::*;
pub use self::search::*;
