mod common;

use hireloop::{
    domain::{
        core::{Location, Resource},
        Entity,
    },
    infrastructure::memory::InMemoryStore,
    usecase::{Actor, Role, SearchFilters, ServiceError},
    Booking as BookingConfig,
};

use common::*;

fn agency_owner() -> Actor {
    Actor::new(20.into(), Role::Agency)
}

/// Pia at the center, a crew member about 650m out, Ben about 1km north and one in Potsdam.
async fn neighbourhood(world: &World) -> (Resource, Resource, Resource, Resource) {
    let pia = world.plumber().await;
    let agency = world
        .market
        .register_agency(
            &agency_owner(),
            "Rohrblitz".to_owned(),
            Location::from(point(52.515, 13.40)),
        )
        .await
        .unwrap();
    let crew = world
        .market
        .register_resource(&agency_owner(), member(*agency.id(), "Crew 1"))
        .await
        .unwrap();
    let ben = world
        .market
        .register_resource(
            &other_provider(),
            individual(&other_provider(), "Ben", point(52.529, 13.405)),
        )
        .await
        .unwrap();
    let far = world
        .market
        .register_resource(
            &other_provider(),
            individual(&other_provider(), "Potsdam", point(52.39, 13.06)),
        )
        .await
        .unwrap();
    (pia, crew, ben, far)
}

#[tokio::test]
async fn test_nearby_resources_are_sorted_by_distance() {
    let world = world();
    let (pia, crew, ben, far) = neighbourhood(&world).await;

    let found = world
        .market
        .search_resources(berlin(), 5_000.0, Some(PLUMBING.into()), SearchFilters::default())
        .await
        .unwrap();
    let ids = found.iter().map(|n| n.resource.id()).collect::<Vec<_>>();
    assert_eq!(ids, vec![pia.id(), crew.id(), ben.id()]);
    assert!(!ids.contains(&far.id()));
    assert!(found
        .windows(2)
        .all(|pair| pair[0].distance_meters <= pair[1].distance_meters));
    assert_eq!(found[0].distance_meters, 0.0);
    assert!(found.iter().all(|n| n.distance_meters <= 5_000.0));

    let wide = world
        .market
        .search_resources(berlin(), 50_000.0, None, SearchFilters::default())
        .await
        .unwrap();
    assert_eq!(wide.last().map(|n| n.resource.id()), Some(far.id()));
}

#[tokio::test]
async fn test_members_are_found_at_their_agency() {
    let world = world();
    let (_, crew, _, _) = neighbourhood(&world).await;

    let found = world
        .market
        .search_resources(point(52.515, 13.40), 10.0, None, SearchFilters::default())
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].resource.id(), crew.id());
    assert_eq!(found[0].resource.location(), None);
}

#[tokio::test]
async fn test_search_filters() {
    let world = world();
    let (pia, crew, ben, _) = neighbourhood(&world).await;

    world.market.verify_resource(&admin(), pia.id()).await.unwrap();
    let verified = world
        .market
        .search_resources(
            berlin(),
            5_000.0,
            None,
            SearchFilters {
                verified_only: true,
                available_only: false,
            },
        )
        .await
        .unwrap();
    assert_eq!(verified.len(), 1);
    assert_eq!(verified[0].resource.id(), pia.id());

    world
        .market
        .set_availability(&other_provider(), ben.id(), false)
        .await
        .unwrap();
    let available = world
        .market
        .search_resources(
            berlin(),
            5_000.0,
            None,
            SearchFilters {
                verified_only: false,
                available_only: true,
            },
        )
        .await
        .unwrap();
    let ids = available.iter().map(|n| n.resource.id()).collect::<Vec<_>>();
    assert_eq!(ids, vec![pia.id(), crew.id()]);

    let electricians = world
        .market
        .search_resources(berlin(), 5_000.0, Some(4.into()), SearchFilters::default())
        .await
        .unwrap();
    assert!(electricians.is_empty());
}

#[tokio::test]
async fn test_filters_apply_before_the_result_limit() {
    let world = world_with(
        InMemoryStore::default().repositories(),
        BookingConfig {
            search_limit: 1,
            ..BookingConfig::default()
        },
    );
    let (_, _, ben, _) = neighbourhood(&world).await;
    world.market.verify_resource(&admin(), ben.id()).await.unwrap();

    let verified = world
        .market
        .search_resources(
            berlin(),
            5_000.0,
            None,
            SearchFilters {
                verified_only: true,
                available_only: false,
            },
        )
        .await
        .unwrap();
    assert_eq!(verified.len(), 1);
    assert_eq!(verified[0].resource.id(), ben.id());
}

#[tokio::test]
async fn test_rejects_invalid_radius() {
    let world = world();
    world.plumber().await;
    for radius in [0.0, -10.0, f64::NAN] {
        let result = world
            .market
            .search_resources(berlin(), radius, None, SearchFilters::default())
            .await;
        assert!(matches!(result, Err(ServiceError::Validation(_))));
    }
}

#[tokio::test]
async fn test_offerings_drive_service_type_search() {
    let world = world();
    let pia = world.plumber().await;

    let updated = world
        .market
        .add_offering(&provider(), pia.id(), offering(4))
        .await
        .unwrap();
    assert!(updated.offers(4.into()));
    let duplicate = world.market.add_offering(&provider(), pia.id(), offering(4)).await;
    assert!(matches!(duplicate, Err(ServiceError::Conflict(_))));
    let found = world
        .market
        .search_resources(berlin(), 100.0, Some(4.into()), SearchFilters::default())
        .await
        .unwrap();
    assert_eq!(found.len(), 1);

    world
        .market
        .remove_offering(&provider(), pia.id(), PLUMBING.into())
        .await
        .unwrap();
    let found = world
        .market
        .search_resources(berlin(), 100.0, Some(PLUMBING.into()), SearchFilters::default())
        .await
        .unwrap();
    assert!(found.is_empty());
    let missing = world
        .market
        .remove_offering(&provider(), pia.id(), PLUMBING.into())
        .await;
    assert!(matches!(missing, Err(ServiceError::Validation(_))));
}

#[tokio::test]
async fn test_resource_management_is_guarded() {
    let world = world();
    let (pia, crew, _, _) = neighbourhood(&world).await;

    let self_verified = world.market.verify_resource(&provider(), pia.id()).await;
    assert!(matches!(self_verified, Err(ServiceError::Forbidden(_))));
    let foreign = world
        .market
        .set_availability(&other_provider(), pia.id(), false)
        .await;
    assert!(matches!(foreign, Err(ServiceError::Forbidden(_))));
    let by_customer = world
        .market
        .register_resource(&customer(), individual(&customer(), "Nope", berlin()))
        .await;
    assert!(matches!(by_customer, Err(ServiceError::Forbidden(_))));
    let agency_by_provider = world
        .market
        .register_agency(&provider(), "Solo Ltd".to_owned(), Location::from(berlin()))
        .await;
    assert!(matches!(agency_by_provider, Err(ServiceError::Forbidden(_))));

    // Members have no availability toggle.
    let toggled = world
        .market
        .set_availability(&agency_owner(), crew.id(), false)
        .await;
    assert!(matches!(toggled, Err(ServiceError::Validation(_))));

    let verified = world.market.verify_resource(&admin(), crew.id()).await.unwrap();
    assert_eq!(verified.verification().map(|v| v.verified_by), Some(admin().user_id));
    let unknown = world.market.verify_resource(&admin(), 999.into()).await;
    assert!(matches!(unknown, Err(ServiceError::NotFound { .. })));
}
