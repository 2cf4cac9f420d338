use std::{convert::Infallible, ops::Range, sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::Stream;
use hireloop::{
    domain::core::{
        Agency, Booking, BookingStatus, GeoPoint, Location, Rating, RatingSummary, Resource,
        Review, ReviewEdit, ServiceOffering, ServiceRequest,
    },
    usecase::{
        Acceptance, Actor, AvailabilityReport, IdentityProvider, Marketplace, NearbyResource,
        NewRequest, NewResource, SearchFilters, ServiceError, SubscriberRegistry,
        SubscriptionFilter, SubscriptionId,
    },
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, warn};

#[derive(Clone)]
pub struct AppState {
    pub marketplace: Arc<Marketplace>,
    pub registry: Arc<SubscriberRegistry>,
    pub identity: Arc<dyn IdentityProvider<HeaderMap>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/agencies", post(register_agency))
        .route("/resources", post(register_resource))
        .route("/resources/search", get(search_resources))
        .route("/resources/availability", post(check_availability))
        .route("/resources/:id", get(get_resource))
        .route("/resources/:id/bookings", get(list_resource_bookings))
        .route("/resources/:id/availability", put(set_availability))
        .route("/resources/:id/offerings", post(add_offering))
        .route(
            "/resources/:id/offerings/:service_type_id",
            delete(remove_offering),
        )
        .route("/resources/:id/verify", post(verify_resource))
        .route("/resources/:id/rating", post(recompute_rating))
        .route("/requests", post(create_request))
        .route("/requests/:id", get(get_request))
        .route("/requests/:id/accept", post(accept_request))
        .route("/requests/:id/reschedule", post(reschedule_request))
        .route("/requests/:id/cancel", post(cancel_request))
        .route("/requests/:id/review", post(submit_review))
        .route("/bookings/:id", get(get_booking))
        .route("/bookings/:id/status", put(update_booking_status))
        .route("/reviews/:id", axum::routing::patch(edit_review))
        .route("/reviews/:id/response", post(respond_to_review))
        .route("/events", get(events))
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    Unauthenticated,
    Service(ServiceError),
}

impl From<ServiceError> for ApiError {
    fn from(value: ServiceError) -> Self {
        ApiError::Service(value)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    retryable: bool,
}

fn status_of(error: &ServiceError) -> (StatusCode, &'static str) {
    match error {
        ServiceError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
        ServiceError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
        ServiceError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
        ServiceError::InvalidTransition(_) => (StatusCode::CONFLICT, "invalid_transition"),
        ServiceError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
        ServiceError::StoreTimeout => (StatusCode::SERVICE_UNAVAILABLE, "store_timeout"),
        ServiceError::Store(e) if e.is_transient() => {
            (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable")
        }
        ServiceError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    error: "unauthenticated",
                    message: "caller identity is missing".to_owned(),
                    retryable: false,
                },
            ),
            ApiError::Service(e) => {
                let (status, kind) = status_of(&e);
                if status.is_server_error() {
                    error!("{}", e);
                }
                (
                    status,
                    ErrorBody {
                        error: kind,
                        message: e.to_string(),
                        retryable: e.is_retryable(),
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn actor(state: &AppState, headers: &HeaderMap) -> Result<Actor, ApiError> {
    state
        .identity
        .identify(headers)
        .await
        .ok_or(ApiError::Unauthenticated)
}

fn window(start: DateTime<Utc>, end: DateTime<Utc>) -> Range<DateTime<Utc>> {
    start..end
}

#[derive(Deserialize)]
struct SearchParams {
    lat: f64,
    lon: f64,
    radius_meters: f64,
    service_type_id: Option<u64>,
    #[serde(default)]
    verified_only: bool,
    #[serde(default)]
    available_only: bool,
}

async fn search_resources(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Vec<NearbyResource>> {
    let point = GeoPoint::new(params.lat, params.lon).map_err(ServiceError::from)?;
    let found = state
        .marketplace
        .search_resources(
            point,
            params.radius_meters,
            params.service_type_id.map(Into::into),
            SearchFilters {
                verified_only: params.verified_only,
                available_only: params.available_only,
            },
        )
        .await?;
    Ok(Json(found))
}

#[derive(Deserialize)]
struct AvailabilityBody {
    resource_ids: Vec<u64>,
    service_type_id: u64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    exclude_request_id: Option<u64>,
}

async fn check_availability(
    State(state): State<AppState>,
    Json(body): Json<AvailabilityBody>,
) -> ApiResult<AvailabilityReport> {
    let ids = body.resource_ids.into_iter().map(Into::into).collect::<Vec<_>>();
    let report = state
        .marketplace
        .check_availability(
            &ids,
            body.service_type_id.into(),
            window(body.start, body.end),
            body.exclude_request_id.map(Into::into),
        )
        .await?;
    Ok(Json(report))
}

async fn get_resource(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult<Resource> {
    Ok(Json(state.marketplace.get_resource(id.into()).await?))
}

async fn list_resource_bookings(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Vec<Booking>> {
    Ok(Json(
        state.marketplace.list_resource_bookings(id.into()).await?,
    ))
}

#[derive(Deserialize)]
struct AgencyBody {
    name: String,
    location: Location,
}

async fn register_agency(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<AgencyBody>,
) -> ApiResult<Agency> {
    let actor = actor(&state, &headers).await?;
    Ok(Json(
        state
            .marketplace
            .register_agency(&actor, body.name, body.location)
            .await?,
    ))
}

async fn register_resource(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<NewResource>,
) -> ApiResult<Resource> {
    let actor = actor(&state, &headers).await?;
    Ok(Json(state.marketplace.register_resource(&actor, body).await?))
}

#[derive(Deserialize)]
struct AvailabilityToggle {
    is_available: bool,
}

async fn set_availability(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Json(body): Json<AvailabilityToggle>,
) -> ApiResult<Resource> {
    let actor = actor(&state, &headers).await?;
    Ok(Json(
        state
            .marketplace
            .set_availability(&actor, id.into(), body.is_available)
            .await?,
    ))
}

async fn add_offering(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Json(body): Json<ServiceOffering>,
) -> ApiResult<Resource> {
    let actor = actor(&state, &headers).await?;
    Ok(Json(
        state.marketplace.add_offering(&actor, id.into(), body).await?,
    ))
}

async fn remove_offering(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, service_type_id)): Path<(u64, u64)>,
) -> ApiResult<Resource> {
    let actor = actor(&state, &headers).await?;
    Ok(Json(
        state
            .marketplace
            .remove_offering(&actor, id.into(), service_type_id.into())
            .await?,
    ))
}

async fn verify_resource(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> ApiResult<Resource> {
    let actor = actor(&state, &headers).await?;
    Ok(Json(
        state.marketplace.verify_resource(&actor, id.into()).await?,
    ))
}

async fn recompute_rating(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> ApiResult<RatingSummary> {
    let actor = actor(&state, &headers).await?;
    Ok(Json(
        state.marketplace.recompute_rating(&actor, id.into()).await?,
    ))
}

async fn create_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<NewRequest>,
) -> Result<(StatusCode, Json<ServiceRequest>), ApiError> {
    let actor = actor(&state, &headers).await?;
    let request = state.marketplace.create_request(&actor, body).await?;
    Ok((StatusCode::CREATED, Json(request)))
}

async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<ServiceRequest> {
    Ok(Json(state.marketplace.get_request(id.into()).await?))
}

#[derive(Deserialize)]
struct AcceptBody {
    resource_id: u64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

async fn accept_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Json(body): Json<AcceptBody>,
) -> ApiResult<Acceptance> {
    let actor = actor(&state, &headers).await?;
    Ok(Json(
        state
            .marketplace
            .accept_request(
                &actor,
                id.into(),
                body.resource_id.into(),
                window(body.start, body.end),
            )
            .await?,
    ))
}

#[derive(Deserialize)]
struct WindowBody {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

async fn reschedule_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Json(body): Json<WindowBody>,
) -> ApiResult<Acceptance> {
    let actor = actor(&state, &headers).await?;
    Ok(Json(
        state
            .marketplace
            .reschedule_request(&actor, id.into(), window(body.start, body.end))
            .await?,
    ))
}

async fn cancel_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> ApiResult<ServiceRequest> {
    let actor = actor(&state, &headers).await?;
    Ok(Json(
        state.marketplace.cancel_request(&actor, id.into()).await?,
    ))
}

#[derive(Deserialize)]
struct ReviewBody {
    rating: u8,
    comment: Option<String>,
}

async fn submit_review(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Json(body): Json<ReviewBody>,
) -> Result<(StatusCode, Json<Review>), ApiError> {
    let actor = actor(&state, &headers).await?;
    let review = state
        .marketplace
        .submit_review(&actor, id.into(), body.rating, body.comment)
        .await?;
    Ok((StatusCode::CREATED, Json(review)))
}

async fn get_booking(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult<Booking> {
    Ok(Json(state.marketplace.get_booking(id.into()).await?))
}

#[derive(Deserialize)]
struct StatusBody {
    status: BookingStatus,
}

async fn update_booking_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Json(body): Json<StatusBody>,
) -> ApiResult<Booking> {
    let actor = actor(&state, &headers).await?;
    Ok(Json(
        state
            .marketplace
            .update_booking_status(&actor, id.into(), body.status)
            .await?,
    ))
}

#[derive(Deserialize)]
struct EditBody {
    rating: Option<u8>,
    comment: Option<String>,
    #[serde(default)]
    clear_comment: bool,
}

impl TryFrom<EditBody> for ReviewEdit {
    type Error = ServiceError;

    fn try_from(value: EditBody) -> Result<Self, Self::Error> {
        let comment = match (value.clear_comment, value.comment) {
            (true, _) => Some(None),
            (false, Some(comment)) => Some(Some(comment)),
            (false, None) => None,
        };
        Ok(ReviewEdit {
            rating: value.rating.map(Rating::new).transpose()?,
            comment,
        })
    }
}

async fn edit_review(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Json(body): Json<EditBody>,
) -> ApiResult<Review> {
    let actor = actor(&state, &headers).await?;
    let edit = ReviewEdit::try_from(body)?;
    Ok(Json(
        state.marketplace.edit_review(&actor, id.into(), edit).await?,
    ))
}

#[derive(Deserialize)]
struct ResponseBody {
    text: String,
}

async fn respond_to_review(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Json(body): Json<ResponseBody>,
) -> ApiResult<Review> {
    let actor = actor(&state, &headers).await?;
    Ok(Json(
        state
            .marketplace
            .respond_to_review(&actor, id.into(), body.text)
            .await?,
    ))
}

#[derive(Deserialize)]
struct EventsParams {
    resource_id: Option<u64>,
    request_id: Option<u64>,
}

/// Drops the registry entry once the client goes away.
struct Unsubscribe {
    registry: Arc<SubscriberRegistry>,
    id: SubscriptionId,
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.registry.unsubscribe(self.id);
    }
}

async fn events(
    State(state): State<AppState>,
    Query(params): Query<EventsParams>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.registry.subscribe(SubscriptionFilter {
        resource_id: params.resource_id.map(Into::into),
        request_id: params.request_id.map(Into::into),
    });
    let guard = Unsubscribe {
        registry: state.registry.clone(),
        id: subscription.id,
    };
    let mut receiver = subscription.receiver;
    let stream = async_stream::stream! {
        loop {
            match receiver.recv().await {
                Ok(notification) => {
                    match Event::default()
                        .event(notification.event_name())
                        .json_data(&notification)
                    {
                        Ok(event) => yield Ok(event),
                        Err(e) => warn!("dropping unserializable notification: {}", e),
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("subscriber {} lagged, {} notifications lost", guard.id, skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Method, Request},
    };
    use hireloop::{
        domain::{FixedClock, IdGenerator},
        infrastructure::memory::InMemoryStore,
        Booking as BookingConfig,
    };
    use chrono::TimeZone;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::identity::{HeaderIdentity, USER_ID_HEADER, USER_ROLE_HEADER};

    fn app() -> Router {
        let registry = Arc::new(SubscriberRegistry::default());
        let marketplace = Marketplace::new(
            InMemoryStore::default().repositories(),
            registry.clone(),
            Arc::new(IdGenerator::default()),
            Arc::new(FixedClock::new(
                Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap(),
            )),
            BookingConfig::default(),
        );
        router(AppState {
            marketplace: Arc::new(marketplace),
            registry,
            identity: Arc::new(HeaderIdentity),
        })
    }

    fn call(method: Method, uri: &str, user: Option<(&str, &str)>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        if let Some((id, role)) = user {
            builder = builder
                .header(USER_ID_HEADER, id)
                .header(USER_ROLE_HEADER, role);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn json_of(response: Response) -> Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_of(&ServiceError::slot_taken()).0,
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(&ServiceError::StoreTimeout).0,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(&ServiceError::not_found("booking", 1)).0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(&ServiceError::Forbidden("no".to_owned())).0,
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_edit_body_clears_comment() {
        let edit = ReviewEdit::try_from(EditBody {
            rating: Some(5),
            comment: Some("ignored".to_owned()),
            clear_comment: true,
        })
        .unwrap();
        assert_eq!(edit.comment, Some(None));
        assert!(ReviewEdit::try_from(EditBody {
            rating: Some(6),
            comment: None,
            clear_comment: false,
        })
        .is_err());
    }

    #[tokio::test]
    async fn test_writes_need_identity() {
        let response = app()
            .oneshot(call(Method::POST, "/requests/1/cancel", None, json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_of(response).await["error"], "unauthenticated");
    }

    #[tokio::test]
    async fn test_create_and_read_request() {
        let app = app();
        let response = app
            .clone()
            .oneshot(call(
                Method::POST,
                "/requests",
                Some(("5", "customer")),
                json!({
                    "requester": 5,
                    "service_type_id": 3,
                    "description": "Fix the sink",
                    "location": { "point": { "lat": 52.52, "lon": 13.405 }, "address": null }
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = json_of(response).await;
        assert_eq!(created["status"], "pending");

        let uri = format!("/requests/{}", created["id"]);
        let response = app
            .oneshot(call(Method::GET, &uri, None, json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_of(response).await["description"], "Fix the sink");
    }

    #[tokio::test]
    async fn test_unknown_booking_is_not_found() {
        let response = app()
            .oneshot(call(Method::GET, "/bookings/99", None, json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
