use async_trait::async_trait;
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::domain::{
    core::{Agency, Resource, UserId},
    Entity,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[display(fmt = "customer")]
    Customer,
    #[display(fmt = "provider")]
    Provider,
    #[display(fmt = "agency")]
    Agency,
    #[display(fmt = "admin")]
    Admin,
}

/// The authenticated caller of an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: UserId, role: Role) -> Self {
        Self { user_id, role }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Resolves the caller of an inbound request. Credentials are never checked here.
#[async_trait]
pub trait IdentityProvider<C: Sync>: Send + Sync {
    async fn identify(&self, context: &C) -> Option<Actor>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    CreateRequest,
    SelfServiceRequest,
    AcceptRequest,
    UpdateBooking,
    RescheduleRequest,
    CancelRequest,
    SubmitReview,
    EditReview,
    RespondToReview,
    RecomputeRating,
    RegisterAgency,
    RegisterResource,
    ManageResource,
    VerifyResource,
}

/// Facts about the target of a command that permissions depend on.
#[derive(Clone, Copy, Debug, Default)]
pub struct AuthContext<'a> {
    pub requester: Option<UserId>,
    pub resource: Option<&'a Resource>,
    pub agency: Option<&'a Agency>,
    pub review_author: Option<UserId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Permission {
    Allow,
    Deny(String),
}

impl Permission {
    pub fn is_allowed(&self) -> bool {
        *self == Permission::Allow
    }
}

/// Whether `actor` speaks for `resource`: its own provider, the member's own account,
/// or a manager of the member's agency.
pub fn controls_resource(actor: &Actor, resource: &Resource, agency: Option<&Agency>) -> bool {
    if resource.user_id() == Some(actor.user_id) {
        return true;
    }
    match (resource.agency_id(), agency) {
        (Some(agency_id), Some(agency)) => {
            agency.id() == agency_id && agency.can_manage(actor.user_id)
        }
        _ => false,
    }
}

fn deny(reason: &str) -> Permission {
    Permission::Deny(reason.to_owned())
}

fn allow_if(condition: bool, reason: &str) -> Permission {
    match condition {
        true => Permission::Allow,
        false => deny(reason),
    }
}

/// Decides whether `actor` may run `command`. Pure; evaluated before any business rule.
pub fn authorize(actor: &Actor, command: Command, ctx: &AuthContext<'_>) -> Permission {
    let controls = ctx
        .resource
        .map(|r| controls_resource(actor, r, ctx.agency))
        .unwrap_or(false);
    let is_requester = ctx.requester == Some(actor.user_id);

    match command {
        Command::SubmitReview => allow_if(
            is_requester && !actor.is_admin(),
            "only the requester can review a request",
        ),
        Command::EditReview => allow_if(
            ctx.review_author == Some(actor.user_id),
            "only the author can edit a review",
        ),
        _ if actor.is_admin() => Permission::Allow,
        Command::CreateRequest => match actor.role {
            Role::Customer => allow_if(is_requester, "customers create requests for themselves"),
            _ => deny("only customers and admins open requests"),
        },
        Command::SelfServiceRequest => match actor.role {
            Role::Provider | Role::Agency => allow_if(
                controls,
                "self-service requests must name a resource you control",
            ),
            _ => deny("only providers create self-service requests"),
        },
        Command::AcceptRequest | Command::UpdateBooking => {
            allow_if(controls, "resource is not yours to schedule")
        }
        Command::RescheduleRequest | Command::CancelRequest => allow_if(
            is_requester || controls,
            "only the requester or the assigned resource can change this request",
        ),
        Command::RespondToReview => allow_if(
            controls,
            "only the reviewed resource can respond",
        ),
        Command::RegisterAgency => allow_if(
            actor.role == Role::Agency,
            "only agency accounts register agencies",
        ),
        Command::RegisterResource => match actor.role {
            Role::Provider | Role::Agency => allow_if(
                controls,
                "resources are registered by their provider or agency",
            ),
            _ => deny("customers cannot register resources"),
        },
        Command::ManageResource => allow_if(controls, "resource is not yours"),
        Command::VerifyResource => deny("only admins verify resources"),
        Command::RecomputeRating => match ctx.resource {
            Some(resource) => allow_if(
                controls_resource(actor, resource, ctx.agency),
                "resource is not yours",
            ),
            None => deny("rating recompute needs a resource"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::core::{
        AgencyMember, Contact, GeoPoint, IndividualProfile, Membership, ResourceKind,
    };

    fn individual(owner: u64) -> Resource {
        Resource::register(
            1.into(),
            "Solo".to_owned(),
            Contact::default(),
            ResourceKind::Individual(IndividualProfile {
                owner: owner.into(),
                location: GeoPoint::new(0.0, 0.0).unwrap().into(),
                is_available: true,
            }),
            vec![],
        )
        .unwrap()
    }

    fn member(agency: u64, membership: Membership) -> Resource {
        Resource::register(
            2.into(),
            "Crew".to_owned(),
            Contact::default(),
            ResourceKind::AgencyMember(AgencyMember {
                agency_id: agency.into(),
                membership,
            }),
            vec![],
        )
        .unwrap()
    }

    fn agency(id: u64, owner: u64) -> Agency {
        Agency::register(
            id.into(),
            "Agency".to_owned(),
            owner.into(),
            GeoPoint::new(0.0, 0.0).unwrap().into(),
        )
        .unwrap()
    }

    fn customer(id: u64) -> Actor {
        Actor::new(id.into(), Role::Customer)
    }

    #[test]
    fn test_customer_creates_only_for_self() {
        let ctx = AuthContext {
            requester: Some(1.into()),
            ..Default::default()
        };
        assert!(authorize(&customer(1), Command::CreateRequest, &ctx).is_allowed());
        assert!(!authorize(&customer(2), Command::CreateRequest, &ctx).is_allowed());
        let admin = Actor::new(9.into(), Role::Admin);
        assert!(authorize(&admin, Command::CreateRequest, &ctx).is_allowed());
    }

    #[test]
    fn test_provider_accepts_only_own_resource() {
        let resource = individual(5);
        let ctx = AuthContext {
            resource: Some(&resource),
            ..Default::default()
        };
        let owner = Actor::new(5.into(), Role::Provider);
        let other = Actor::new(6.into(), Role::Provider);
        assert!(authorize(&owner, Command::AcceptRequest, &ctx).is_allowed());
        assert!(!authorize(&other, Command::AcceptRequest, &ctx).is_allowed());
        assert!(!authorize(&customer(5), Command::SelfServiceRequest, &ctx).is_allowed());
        assert!(authorize(&owner, Command::SelfServiceRequest, &ctx).is_allowed());
    }

    #[test]
    fn test_agency_manager_controls_members() {
        let mut agency = agency(3, 20);
        agency.add_manager(21.into()).unwrap();
        let external = member(3, Membership::External);
        let ctx = AuthContext {
            resource: Some(&external),
            agency: Some(&agency),
            ..Default::default()
        };
        for manager in [20u64, 21] {
            let actor = Actor::new(manager.into(), Role::Agency);
            assert!(authorize(&actor, Command::UpdateBooking, &ctx).is_allowed());
        }
        let outsider = Actor::new(22.into(), Role::Agency);
        assert!(!authorize(&outsider, Command::UpdateBooking, &ctx).is_allowed());

        let other_agency = self::agency(4, 22);
        let ctx = AuthContext {
            resource: Some(&external),
            agency: Some(&other_agency),
            ..Default::default()
        };
        assert!(!authorize(&outsider, Command::UpdateBooking, &ctx).is_allowed());
    }

    #[test]
    fn test_internal_member_controls_itself() {
        let internal = member(3, Membership::Internal { user_id: 30.into() });
        let actor = Actor::new(30.into(), Role::Provider);
        assert!(controls_resource(&actor, &internal, None));
    }

    #[test]
    fn test_cancel_by_requester_or_resource() {
        let resource = individual(5);
        let ctx = AuthContext {
            requester: Some(1.into()),
            resource: Some(&resource),
            ..Default::default()
        };
        assert!(authorize(&customer(1), Command::CancelRequest, &ctx).is_allowed());
        assert!(authorize(&Actor::new(5.into(), Role::Provider), Command::CancelRequest, &ctx)
            .is_allowed());
        assert!(!authorize(&customer(2), Command::CancelRequest, &ctx).is_allowed());
    }

    #[test]
    fn test_only_admins_verify() {
        let resource = individual(5);
        let ctx = AuthContext {
            resource: Some(&resource),
            ..Default::default()
        };
        let owner = Actor::new(5.into(), Role::Provider);
        assert!(authorize(&owner, Command::ManageResource, &ctx).is_allowed());
        assert!(!authorize(&owner, Command::VerifyResource, &ctx).is_allowed());
        let admin = Actor::new(9.into(), Role::Admin);
        assert!(authorize(&admin, Command::VerifyResource, &ctx).is_allowed());
    }

    #[test]
    fn test_admins_do_not_author_reviews() {
        let ctx = AuthContext {
            requester: Some(9.into()),
            review_author: Some(9.into()),
            ..Default::default()
        };
        let admin = Actor::new(9.into(), Role::Admin);
        assert!(!authorize(&admin, Command::SubmitReview, &ctx).is_allowed());
        assert!(authorize(&customer(9), Command::SubmitReview, &ctx).is_allowed());
        assert!(authorize(&customer(9), Command::EditReview, &ctx).is_allowed());
        assert!(!authorize(&customer(8), Command::EditReview, &ctx).is_allowed());
    }
}
