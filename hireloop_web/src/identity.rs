use async_trait::async_trait;
use axum::http::HeaderMap;
use hireloop::usecase::{Actor, IdentityProvider, Role};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// Trusts the identity headers set by the authenticating proxy in front of the service.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeaderIdentity;

fn parse_role(value: &str) -> Option<Role> {
    match value.trim().to_ascii_lowercase().as_str() {
        "customer" => Some(Role::Customer),
        "provider" => Some(Role::Provider),
        "agency" => Some(Role::Agency),
        "admin" => Some(Role::Admin),
        _ => None,
    }
}

#[async_trait]
impl IdentityProvider<HeaderMap> for HeaderIdentity {
    async fn identify(&self, headers: &HeaderMap) -> Option<Actor> {
        let user_id = headers
            .get(USER_ID_HEADER)?
            .to_str()
            .ok()?
            .trim()
            .parse::<u64>()
            .ok()?;
        let role = parse_role(headers.get(USER_ROLE_HEADER)?.to_str().ok()?)?;
        Some(Actor::new(user_id.into(), role))
    }
}
