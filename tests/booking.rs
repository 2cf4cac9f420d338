mod common;

use std::sync::Arc;

use hireloop::{
    domain::{
        core::{BookingStatus, RequestStatus, Resource},
        Entity,
    },
    infrastructure::memory::InMemoryStore,
    usecase::{Notification, ServiceError, UnavailableReason},
    Booking as BookingConfig,
};

use common::*;

#[tokio::test]
async fn test_overlap_is_rejected_and_back_to_back_is_not() {
    let world = world();
    let plumber = world.plumber().await;
    let first = world.request().await;
    let accepted = world
        .market
        .accept_request(&provider(), first.id(), plumber.id(), at(10, 0)..at(11, 0))
        .await
        .unwrap();
    assert_eq!(accepted.request.status(), RequestStatus::Accepted);
    assert_eq!(accepted.request.booking_id(), Some(accepted.booking.id()));

    let report = world
        .market
        .check_availability(&[plumber.id()], PLUMBING.into(), at(10, 30)..at(11, 30), None)
        .await
        .unwrap();
    assert!(!report.has_availability);
    assert!(matches!(
        report.unavailable[0].reason,
        UnavailableReason::Overlaps { booking_id, .. } if booking_id == accepted.booking.id()
    ));

    let second = world.request().await;
    let overlapping = world
        .market
        .accept_request(&provider(), second.id(), plumber.id(), at(10, 30)..at(11, 30))
        .await;
    assert!(matches!(overlapping, Err(ServiceError::Conflict(_))));
    assert_eq!(
        world.market.get_request(second.id()).await.unwrap().status(),
        RequestStatus::Pending
    );

    let report = world
        .market
        .check_availability(&[plumber.id()], PLUMBING.into(), at(11, 0)..at(12, 0), None)
        .await
        .unwrap();
    assert!(report.has_availability);
    assert_eq!(report.available[0].id(), plumber.id());

    world
        .market
        .accept_request(&provider(), second.id(), plumber.id(), at(11, 0)..at(12, 0))
        .await
        .unwrap();
    assert_eq!(world.bookings(plumber.id()).await, 2);
}

#[tokio::test]
async fn test_repeated_accept_keeps_one_booking() {
    let world = world();
    let plumber = world.plumber().await;
    let request = world.request().await;
    let window = at(10, 0)..at(11, 0);
    let first = world
        .market
        .accept_request(&provider(), request.id(), plumber.id(), window.clone())
        .await
        .unwrap();
    let again = world
        .market
        .accept_request(&provider(), request.id(), plumber.id(), window)
        .await
        .unwrap();
    assert_eq!(again.booking.id(), first.booking.id());
    assert_eq!(world.bookings(plumber.id()).await, 1);

    let elsewhere = world
        .market
        .accept_request(&provider(), request.id(), plumber.id(), at(14, 0)..at(15, 0))
        .await;
    assert!(matches!(elsewhere, Err(ServiceError::Conflict(_))));
    assert_eq!(world.bookings(plumber.id()).await, 1);
}

#[tokio::test]
async fn test_concurrent_accepts_of_one_request() {
    let store = InMemoryStore::default();
    let mut repos = store.repositories();
    repos.timelines = Arc::new(YieldingTimelines(store.timelines.clone()));
    let world = world_with(repos, BookingConfig::default());
    let plumber = world.plumber().await;
    let request = world.request().await;

    let actor = provider();
    let (a, b) = tokio::join!(
        world
            .market
            .accept_request(&actor, request.id(), plumber.id(), at(10, 0)..at(11, 0)),
        world
            .market
            .accept_request(&actor, request.id(), plumber.id(), at(10, 0)..at(11, 0)),
    );
    let (won, lost) = match (a, b) {
        (Ok(won), Err(lost)) | (Err(lost), Ok(won)) => (won, lost),
        (a, b) => panic!("expected exactly one winner, got {:?} and {:?}", a.is_ok(), b.is_ok()),
    };
    assert!(matches!(lost, ServiceError::Conflict(_)));

    let stored = world.market.get_request(request.id()).await.unwrap();
    assert_eq!(stored.status(), RequestStatus::Accepted);
    assert_eq!(stored.booking_id(), Some(won.booking.id()));
    let booking = world.market.get_booking(won.booking.id()).await.unwrap();
    assert_eq!(booking.status(), BookingStatus::Scheduled);
    assert_eq!(world.bookings(plumber.id()).await, 1);
}

#[tokio::test]
async fn test_concurrent_accepts_of_overlapping_windows() {
    let store = InMemoryStore::default();
    let mut repos = store.repositories();
    repos.timelines = Arc::new(YieldingTimelines(store.timelines.clone()));
    let world = world_with(repos, BookingConfig::default());
    let plumber = world.plumber().await;
    let first = world.request().await;
    let second = world.request().await;

    let actor = provider();
    let (a, b) = tokio::join!(
        world
            .market
            .accept_request(&actor, first.id(), plumber.id(), at(10, 0)..at(11, 0)),
        world
            .market
            .accept_request(&actor, second.id(), plumber.id(), at(10, 30)..at(11, 30)),
    );
    assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
    assert!(matches!(a.err().or(b.err()), Some(ServiceError::Conflict(_))));
    assert_eq!(world.bookings(plumber.id()).await, 1);
}

#[tokio::test]
async fn test_booking_status_machine() {
    let world = world();
    let plumber = world.plumber().await;
    let request = world.request().await;
    let booking = world
        .market
        .accept_request(&provider(), request.id(), plumber.id(), at(10, 0)..at(11, 0))
        .await
        .unwrap()
        .booking;

    let skip = world
        .market
        .update_booking_status(&provider(), booking.id(), BookingStatus::Completed)
        .await;
    assert!(matches!(skip, Err(ServiceError::InvalidTransition(_))));
    let back = world
        .market
        .update_booking_status(&provider(), booking.id(), BookingStatus::Scheduled)
        .await;
    assert!(matches!(back, Err(ServiceError::InvalidTransition(_))));
    let stranger = world
        .market
        .update_booking_status(&customer(), booking.id(), BookingStatus::InProgress)
        .await;
    assert!(matches!(stranger, Err(ServiceError::Forbidden(_))));

    let started = world
        .market
        .update_booking_status(&provider(), booking.id(), BookingStatus::InProgress)
        .await
        .unwrap();
    assert_eq!(started.status(), BookingStatus::InProgress);
    assert_eq!(
        world.market.get_request(request.id()).await.unwrap().status(),
        RequestStatus::InProgress
    );
    let twice = world
        .market
        .update_booking_status(&provider(), booking.id(), BookingStatus::InProgress)
        .await;
    assert!(matches!(twice, Err(ServiceError::InvalidTransition(_))));

    world
        .market
        .update_booking_status(&provider(), booking.id(), BookingStatus::Completed)
        .await
        .unwrap();
    let finished = world.market.get_request(request.id()).await.unwrap();
    assert_eq!(finished.status(), RequestStatus::Completed);
    assert!(finished.completed_at().is_some());

    let after = world
        .market
        .update_booking_status(&provider(), booking.id(), BookingStatus::Cancelled)
        .await;
    assert!(matches!(after, Err(ServiceError::InvalidTransition(_))));
    let cancel = world.market.cancel_request(&customer(), request.id()).await;
    assert!(matches!(cancel, Err(ServiceError::Conflict(_))));
}

#[tokio::test]
async fn test_cancel_frees_the_slot() {
    let world = world();
    let plumber = world.plumber().await;
    let first = world.request().await;
    let booking = world
        .market
        .accept_request(&provider(), first.id(), plumber.id(), at(10, 0)..at(11, 0))
        .await
        .unwrap()
        .booking;
    world.notes.take();

    let cancelled = world.market.cancel_request(&customer(), first.id()).await.unwrap();
    assert_eq!(cancelled.status(), RequestStatus::Cancelled);
    assert_eq!(cancelled.cancelled_by(), Some(customer().user_id));
    assert_eq!(
        world.market.get_booking(booking.id()).await.unwrap().status(),
        BookingStatus::Cancelled
    );
    assert!(world.notes.take().contains(&Notification::AvailabilityChanged {
        resource_id: plumber.id(),
        time: at(10, 0)..at(11, 0),
        available: true,
    }));

    let again = world.market.cancel_request(&customer(), first.id()).await;
    assert!(matches!(again, Err(ServiceError::Conflict(_))));

    let second = world.request().await;
    world
        .market
        .accept_request(&provider(), second.id(), plumber.id(), at(10, 0)..at(11, 0))
        .await
        .unwrap();
    assert_eq!(world.bookings(plumber.id()).await, 1);
}

#[tokio::test]
async fn test_reschedule_moves_the_booking() {
    let world = world();
    let plumber = world.plumber().await;
    let first = world.request().await;
    let second = world.request().await;
    let booking = world
        .market
        .accept_request(&provider(), first.id(), plumber.id(), at(10, 0)..at(11, 0))
        .await
        .unwrap()
        .booking;
    world
        .market
        .accept_request(&provider(), second.id(), plumber.id(), at(11, 0)..at(12, 0))
        .await
        .unwrap();

    let blocked = world
        .market
        .reschedule_request(&customer(), first.id(), at(11, 30)..at(12, 30))
        .await;
    assert!(matches!(blocked, Err(ServiceError::Conflict(_))));

    let overlapping_itself = world
        .market
        .reschedule_request(&customer(), first.id(), at(9, 30)..at(10, 30))
        .await
        .unwrap();
    assert_eq!(overlapping_itself.booking.id(), booking.id());
    assert_eq!(overlapping_itself.booking.start_time(), at(9, 30));
    assert_eq!(overlapping_itself.request.scheduled_at(), Some(at(9, 30)));

    let same = world
        .market
        .reschedule_request(&customer(), first.id(), at(9, 30)..at(10, 30))
        .await
        .unwrap();
    assert_eq!(same.booking.id(), booking.id());
    assert_eq!(world.bookings(plumber.id()).await, 2);

    let third = world.request().await;
    world
        .market
        .accept_request(&provider(), third.id(), plumber.id(), at(10, 30)..at(11, 0))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_self_service_request_is_accepted() {
    let world = world();
    let plumber = world.plumber().await;
    let mut new = new_request(Some(plumber.id()));
    new.requester = provider().user_id;
    new.scheduled_at = Some(at(13, 0));
    new.estimated_duration_minutes = Some(90);

    let request = world.market.create_request(&provider(), new.clone()).await.unwrap();
    assert_eq!(request.status(), RequestStatus::Accepted);
    assert_eq!(request.estimated_end_time(), Some(at(14, 30)));
    let booking = world
        .market
        .get_booking(request.booking_id().unwrap())
        .await
        .unwrap();
    assert_eq!(booking.time(), at(13, 0)..at(14, 30));

    let clash = world.market.create_request(&provider(), new).await;
    assert!(matches!(clash, Err(ServiceError::Conflict(_))));
    assert_eq!(world.bookings(plumber.id()).await, 1);

    let mut unscheduled = new_request(Some(plumber.id()));
    unscheduled.requester = provider().user_id;
    let invalid = world.market.create_request(&provider(), unscheduled).await;
    assert!(matches!(invalid, Err(ServiceError::Validation(_))));
}

#[tokio::test]
async fn test_customer_preselection_is_matched() {
    let world = world();
    let plumber = world.plumber().await;
    let request = world
        .market
        .create_request(&customer(), new_request(Some(plumber.id())))
        .await
        .unwrap();
    assert_eq!(request.status(), RequestStatus::Matched);

    let mut for_someone_else = new_request(None);
    for_someone_else.requester = 99.into();
    let denied = world.market.create_request(&customer(), for_someone_else).await;
    assert!(matches!(denied, Err(ServiceError::Forbidden(_))));
}

#[tokio::test]
async fn test_invalid_windows_are_rejected_before_store_access() {
    let world = world();
    let plumber = world.plumber().await;
    let request = world.request().await;
    let empty = world
        .market
        .accept_request(&provider(), request.id(), plumber.id(), at(10, 0)..at(10, 0))
        .await;
    assert!(matches!(empty, Err(ServiceError::Validation(_))));
    let report = world
        .market
        .check_availability(&[plumber.id()], PLUMBING.into(), at(11, 0)..at(10, 0), None)
        .await;
    assert!(matches!(report, Err(ServiceError::Validation(_))));
}

#[tokio::test]
async fn test_slow_store_surfaces_as_retryable_timeout() {
    let store = InMemoryStore::default();
    let mut repos = store.repositories();
    repos.requests = Arc::new(StalledRequests(store.requests.clone()));
    let settings = BookingConfig {
        store_timeout_ms: 20,
        ..Default::default()
    };
    let world = world_with(repos, settings);

    let result = world.market.get_request(1.into()).await;
    match result {
        Err(e @ ServiceError::StoreTimeout) => assert!(e.is_retryable()),
        other => panic!("expected a timeout, got {:?}", other.map(|r| r.id())),
    }
}

#[tokio::test]
async fn test_accept_notifies_listeners() {
    let world = world();
    let plumber = world.plumber().await;
    let request = world.request().await;
    world.notes.take();
    world
        .market
        .accept_request(&provider(), request.id(), plumber.id(), at(10, 0)..at(11, 0))
        .await
        .unwrap();
    let notes = world.notes.take();
    assert!(notes.contains(&Notification::RequestStatusChanged {
        request_id: request.id(),
        resource_id: Some(plumber.id()),
        status: RequestStatus::Accepted,
    }));
    assert!(notes.contains(&Notification::AvailabilityChanged {
        resource_id: plumber.id(),
        time: at(10, 0)..at(11, 0),
        available: false,
    }));
}

/// A world whose request store can be made to time out once, with a second plumber nearby.
async fn stalling_world() -> (World, Arc<StallNextSave>, Resource, Resource) {
    let store = InMemoryStore::default();
    let requests = Arc::new(StallNextSave::new(store.requests.clone()));
    let mut repos = store.repositories();
    repos.requests = requests.clone();
    let world = world_with(
        repos,
        BookingConfig {
            store_timeout_ms: 100,
            ..BookingConfig::default()
        },
    );
    let pia = world.plumber().await;
    let ben = world
        .market
        .register_resource(
            &other_provider(),
            individual(&other_provider(), "Ben", point(52.521, 13.405)),
        )
        .await
        .unwrap();
    (world, requests, pia, ben)
}

#[tokio::test]
async fn test_retry_on_another_resource_releases_the_first_booking() {
    let (world, requests, pia, ben) = stalling_world().await;
    let request = world.request().await;

    requests.arm();
    let timed_out = world
        .market
        .accept_request(&provider(), request.id(), pia.id(), at(10, 0)..at(11, 0))
        .await;
    assert!(matches!(timed_out, Err(ServiceError::StoreTimeout)));
    assert_eq!(world.bookings(pia.id()).await, 1);
    world.notes.take();

    let accepted = world
        .market
        .accept_request(&other_provider(), request.id(), ben.id(), at(10, 0)..at(11, 0))
        .await
        .unwrap();
    assert_eq!(accepted.request.booking_id(), Some(accepted.booking.id()));
    assert_eq!(world.bookings(pia.id()).await, 0);
    assert_eq!(world.bookings(ben.id()).await, 1);
    assert!(world.notes.take().contains(&Notification::AvailabilityChanged {
        resource_id: pia.id(),
        time: at(10, 0)..at(11, 0),
        available: true,
    }));
}

#[tokio::test]
async fn test_stray_booking_cannot_drive_its_request() {
    let (world, requests, pia, ben) = stalling_world().await;
    let request = world.request().await;

    requests.arm();
    let timed_out = world
        .market
        .accept_request(&provider(), request.id(), pia.id(), at(10, 0)..at(11, 0))
        .await;
    assert!(matches!(timed_out, Err(ServiceError::StoreTimeout)));
    let stray = world.market.list_resource_bookings(pia.id()).await.unwrap()[0].clone();

    let started = world
        .market
        .update_booking_status(&provider(), stray.id(), BookingStatus::InProgress)
        .await;
    assert!(matches!(started, Err(ServiceError::Conflict(_))));
    let foreign = world
        .market
        .update_booking_status(&other_provider(), stray.id(), BookingStatus::Cancelled)
        .await;
    assert!(matches!(foreign, Err(ServiceError::Forbidden(_))));

    let released = world
        .market
        .update_booking_status(&provider(), stray.id(), BookingStatus::Cancelled)
        .await
        .unwrap();
    assert_eq!(released.status(), BookingStatus::Cancelled);
    assert_eq!(
        world.market.get_request(request.id()).await.unwrap().status(),
        RequestStatus::Pending
    );

    let accepted = world
        .market
        .accept_request(&other_provider(), request.id(), ben.id(), at(10, 0)..at(11, 0))
        .await
        .unwrap();
    let again = world
        .market
        .update_booking_status(&provider(), stray.id(), BookingStatus::Cancelled)
        .await;
    assert!(matches!(again, Err(ServiceError::InvalidTransition(_))));

    let stored = world.market.get_request(request.id()).await.unwrap();
    assert_eq!(stored.status(), RequestStatus::Accepted);
    assert_eq!(stored.booking_id(), Some(accepted.booking.id()));
    let held = world.market.get_booking(accepted.booking.id()).await.unwrap();
    assert_eq!(held.status(), BookingStatus::Scheduled);
}

#[tokio::test]
async fn test_race_loser_cannot_cancel_the_winner() {
    let store = InMemoryStore::default();
    let mut repos = store.repositories();
    repos.timelines = Arc::new(YieldingTimelines(store.timelines.clone()));
    let world = world_with(repos, BookingConfig::default());
    let pia = world.plumber().await;
    let ben = world
        .market
        .register_resource(
            &other_provider(),
            individual(&other_provider(), "Ben", point(52.521, 13.405)),
        )
        .await
        .unwrap();
    let request = world.request().await;

    let (pia_actor, ben_actor) = (provider(), other_provider());
    let (a, b) = tokio::join!(
        world
            .market
            .accept_request(&pia_actor, request.id(), pia.id(), at(10, 0)..at(11, 0)),
        world
            .market
            .accept_request(&ben_actor, request.id(), ben.id(), at(10, 0)..at(11, 0)),
    );
    let (won, loser, loser_actor) = match (a, b) {
        (Ok(won), Err(_)) => (won, ben.id(), ben_actor),
        (Err(_), Ok(won)) => (won, pia.id(), pia_actor),
        (a, b) => panic!("expected exactly one winner, got {:?} and {:?}", a.is_ok(), b.is_ok()),
    };
    assert_eq!(world.bookings(loser).await, 0);

    for leftover in world.market.list_resource_bookings(loser).await.unwrap() {
        let cancel = world
            .market
            .update_booking_status(&loser_actor, leftover.id(), BookingStatus::Cancelled)
            .await;
        assert!(cancel.is_err());
    }
    let stored = world.market.get_request(request.id()).await.unwrap();
    assert_eq!(stored.status(), RequestStatus::Accepted);
    assert_eq!(stored.booking_id(), Some(won.booking.id()));
    let held = world.market.get_booking(won.booking.id()).await.unwrap();
    assert_eq!(held.status(), BookingStatus::Scheduled);
}
