//! JSON API over the lifecycle service. Identity is asserted by the upstream gateway through
//! `x-customer-id`, `x-shop-id` or `x-admin-id`; when a gateway secret is configured every call
//! must also carry a matching `x-gateway-secret`.

use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path, Query, Request, State},
    http::{request::Parts, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use repairhub_core::lifecycle::AcceptanceOutcome;
use repairhub_core::{
    Actor, ApplicationError, CustomerId, DeviceDetails, InterfaceError, QuoteDraft, QuoteId,
    RepairLifecycleService, RepairQuote, RepairRequest, RepairRequestId, RepairShop, RepairStore,
    RequestDraft, RequestStatus, Review, ShopAssignment, ShopId, ShopRatingSummary,
    ShopRequestView,
};

pub const CUSTOMER_HEADER: &str = "x-customer-id";
pub const SHOP_HEADER: &str = "x-shop-id";
pub const ADMIN_HEADER: &str = "x-admin-id";
pub const GATEWAY_SECRET_HEADER: &str = "x-gateway-secret";
pub const CORRELATION_HEADER: &str = "x-correlation-id";

pub struct ApiState<S> {
    pub service: RepairLifecycleService<S>,
}

impl<S: Clone> Clone for ApiState<S> {
    fn clone(&self) -> Self {
        Self { service: self.service.clone() }
    }
}

pub fn router<S>(service: RepairLifecycleService<S>, gateway_secret: Option<SecretString>) -> Router
where
    S: RepairStore + Clone + 'static,
{
    let gateway_secret = Arc::new(gateway_secret);

    Router::new()
        .route("/api/v1/requests", post(create_request::<S>).get(my_requests::<S>))
        .route("/api/v1/requests/available", get(available_requests::<S>))
        .route("/api/v1/requests/{id}", get(get_request::<S>))
        .route("/api/v1/requests/{id}/quotes", get(list_quotes::<S>).post(submit_quote::<S>))
        .route("/api/v1/requests/{id}/status", post(transition_request::<S>))
        .route("/api/v1/requests/{id}/start", post(start_repair::<S>))
        .route("/api/v1/requests/{id}/shop", get(assigned_shop::<S>))
        .route("/api/v1/requests/{id}/review", get(request_review::<S>).post(submit_review::<S>))
        .route("/api/v1/quotes/{id}/accept", post(accept_quote::<S>))
        .route("/api/v1/shops/me/requests", get(shop_requests::<S>))
        .route("/api/v1/shops/{id}/rating", get(shop_rating::<S>))
        .route("/api/v1/shops/{id}/reviews", get(shop_reviews::<S>))
        .route("/api/v1/customers/me/reviews", get(my_reviews::<S>))
        .layer(middleware::from_fn_with_state(gateway_secret, require_gateway_secret))
        .with_state(ApiState { service })
}

#[derive(Debug)]
pub enum ApiError {
    /// Missing or untrusted identity. Distinct from a known caller acting out of bounds.
    Unauthenticated { message: String, correlation_id: String },
    Interface(InterfaceError),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    pub correlation_id: String,
}

impl ApiError {
    fn unauthenticated(message: impl Into<String>, correlation_id: &str) -> Self {
        Self::Unauthenticated { message: message.into(), correlation_id: correlation_id.to_owned() }
    }

    fn from_application(error: ApplicationError, correlation_id: &str) -> Self {
        Self::Interface(error.into_interface(correlation_id))
    }

    fn forbidden(message: impl Into<String>, correlation_id: &str) -> Self {
        Self::from_application(ApplicationError::Unauthorized(message.into()), correlation_id)
    }

    fn bad_request(message: impl Into<String>, correlation_id: &str) -> Self {
        Self::from_application(ApplicationError::Validation(message.into()), correlation_id)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::Unauthenticated { message, correlation_id } => (
                StatusCode::UNAUTHORIZED,
                ErrorBody { error: "unauthenticated".to_owned(), message, correlation_id },
            ),
            Self::Interface(error) => {
                let status = StatusCode::from_u16(error.http_status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let code = match &error {
                    InterfaceError::BadRequest { .. } => "bad_request",
                    InterfaceError::NotFound { .. } => "not_found",
                    InterfaceError::Unauthorized { .. } => "forbidden",
                    InterfaceError::Conflict { .. } => "conflict",
                    InterfaceError::ServiceUnavailable { .. } => "service_unavailable",
                    InterfaceError::Internal { .. } => "internal",
                };
                let message = if error.is_client_error() {
                    error.message().to_owned()
                } else {
                    warn!(
                        event_name = "api.request.failed",
                        correlation_id = %error.correlation_id(),
                        error = %error,
                        "request failed on the server side"
                    );
                    error.user_message().to_owned()
                };
                (
                    status,
                    ErrorBody {
                        error: code.to_owned(),
                        message,
                        correlation_id: error.correlation_id().to_owned(),
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| format!("http-{}", Uuid::new_v4()))
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

async fn require_gateway_secret(
    State(secret): State<Arc<Option<SecretString>>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(expected) = secret.as_ref() {
        let presented = header_value(request.headers(), GATEWAY_SECRET_HEADER);
        if presented.as_deref() != Some(expected.expose_secret()) {
            let correlation_id = correlation_id(request.headers());
            warn!(
                event_name = "api.gateway.rejected",
                correlation_id = %correlation_id,
                path = %request.uri().path(),
                "request rejected: gateway secret missing or wrong"
            );
            return Err(ApiError::unauthenticated("gateway secret required", &correlation_id));
        }
    }
    Ok(next.run(request).await)
}

/// The authenticated caller of one HTTP request.
#[derive(Clone, Debug)]
pub struct Caller {
    pub actor: Actor,
    pub correlation_id: String,
}

impl Caller {
    fn customer(&self) -> Result<&CustomerId, ApiError> {
        match &self.actor {
            Actor::Customer(id) => Ok(id),
            _ => Err(ApiError::forbidden("customer identity required", &self.correlation_id)),
        }
    }

    fn shop(&self) -> Result<&ShopId, ApiError> {
        match &self.actor {
            Actor::Shop(id) => Ok(id),
            _ => Err(ApiError::forbidden("shop identity required", &self.correlation_id)),
        }
    }

    fn fail(&self, error: ApplicationError) -> ApiError {
        ApiError::from_application(error, &self.correlation_id)
    }

    /// Customers only see their own requests; shops and admins pass.
    fn ensure_can_view(&self, request: &RepairRequest) -> Result<(), ApiError> {
        match &self.actor {
            Actor::Customer(customer_id) if &request.customer_id != customer_id => Err(
                ApiError::forbidden("request belongs to another customer", &self.correlation_id),
            ),
            _ => Ok(()),
        }
    }
}

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let correlation_id = correlation_id(&parts.headers);
        let identities = [
            header_value(&parts.headers, CUSTOMER_HEADER).map(|id| Actor::Customer(CustomerId(id))),
            header_value(&parts.headers, SHOP_HEADER).map(|id| Actor::Shop(ShopId(id))),
            header_value(&parts.headers, ADMIN_HEADER).map(Actor::Admin),
        ];
        let mut present = identities.into_iter().flatten();

        match (present.next(), present.next()) {
            (Some(actor), None) => Ok(Self { actor, correlation_id }),
            (None, _) => Err(ApiError::unauthenticated("caller identity required", &correlation_id)),
            (Some(_), Some(_)) => {
                Err(ApiError::unauthenticated("exactly one caller identity allowed", &correlation_id))
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AcceptanceResponse {
    pub quote: RepairQuote,
    pub request: RepairRequest,
    pub shop: RepairShop,
    pub rejected_quotes: u64,
}

impl From<AcceptanceOutcome> for AcceptanceResponse {
    fn from(outcome: AcceptanceOutcome) -> Self {
        Self {
            quote: outcome.quote,
            request: outcome.request,
            shop: outcome.shop,
            rejected_quotes: outcome.rejected_quotes,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TransitionBody {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct ReviewBody {
    pub rating: u8,
    pub comment: String,
}

#[derive(Debug, Deserialize)]
pub struct ShopRequestsQuery {
    /// `active` (default) or `completed`.
    pub state: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AssignedShopResponse {
    pub request_id: String,
    pub shop: Option<RepairShop>,
}

async fn create_request<S: RepairStore + Clone + 'static>(
    State(state): State<ApiState<S>>,
    caller: Caller,
    Json(draft): Json<RequestDraft>,
) -> Result<(StatusCode, Json<RepairRequest>), ApiError> {
    let customer_id = caller.customer()?;
    let request =
        state.service.create_request(customer_id, draft).await.map_err(|e| caller.fail(e))?;
    info!(
        event_name = "api.request.created",
        correlation_id = %caller.correlation_id,
        request_id = %request.id.0,
        "repair request opened over http"
    );
    Ok((StatusCode::CREATED, Json(request)))
}

async fn my_requests<S: RepairStore + Clone + 'static>(
    State(state): State<ApiState<S>>,
    caller: Caller,
) -> Result<Json<Vec<RepairRequest>>, ApiError> {
    let customer_id = caller.customer()?;
    let requests =
        state.service.requests_for_customer(customer_id).await.map_err(|e| caller.fail(e))?;
    Ok(Json(requests))
}

async fn available_requests<S: RepairStore + Clone + 'static>(
    State(state): State<ApiState<S>>,
    caller: Caller,
) -> Result<Json<Vec<RepairRequest>>, ApiError> {
    let shop_id = caller.shop()?;
    let requests =
        state.service.requests_available_for_quoting(shop_id).await.map_err(|e| caller.fail(e))?;
    Ok(Json(requests))
}

async fn get_request<S: RepairStore + Clone + 'static>(
    State(state): State<ApiState<S>>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<Json<RepairRequest>, ApiError> {
    let request_id = RepairRequestId(id);
    let request = state.service.request(&request_id).await.map_err(|e| caller.fail(e))?;
    caller.ensure_can_view(&request)?;
    Ok(Json(request))
}

async fn list_quotes<S: RepairStore + Clone + 'static>(
    State(state): State<ApiState<S>>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<Json<Vec<RepairQuote>>, ApiError> {
    let request_id = RepairRequestId(id);
    let request = state.service.request(&request_id).await.map_err(|e| caller.fail(e))?;
    caller.ensure_can_view(&request)?;
    let quotes = state.service.quotes_for_request(&request_id).await.map_err(|e| caller.fail(e))?;
    let visible = match &caller.actor {
        Actor::Shop(shop_id) => quotes.into_iter().filter(|quote| &quote.shop_id == shop_id).collect(),
        _ => quotes,
    };
    Ok(Json(visible))
}

async fn submit_quote<S: RepairStore + Clone + 'static>(
    State(state): State<ApiState<S>>,
    caller: Caller,
    Path(id): Path<String>,
    Json(draft): Json<QuoteDraft>,
) -> Result<(StatusCode, Json<RepairQuote>), ApiError> {
    let shop_id = caller.shop()?;
    let quote = state
        .service
        .submit_quote(shop_id, &RepairRequestId(id), draft)
        .await
        .map_err(|e| caller.fail(e))?;
    Ok((StatusCode::CREATED, Json(quote)))
}

async fn accept_quote<S: RepairStore + Clone + 'static>(
    State(state): State<ApiState<S>>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<Json<AcceptanceResponse>, ApiError> {
    let customer_id = caller.customer()?;
    let outcome =
        state.service.accept_quote(customer_id, &QuoteId(id)).await.map_err(|e| caller.fail(e))?;
    Ok(Json(outcome.into()))
}

async fn transition_request<S: RepairStore + Clone + 'static>(
    State(state): State<ApiState<S>>,
    caller: Caller,
    Path(id): Path<String>,
    Json(body): Json<TransitionBody>,
) -> Result<Json<RepairRequest>, ApiError> {
    let target = RequestStatus::parse(&body.status).ok_or_else(|| {
        ApiError::bad_request(format!("unknown request status `{}`", body.status), &caller.correlation_id)
    })?;
    let request = state
        .service
        .transition_request(&caller.actor, &RepairRequestId(id), target)
        .await
        .map_err(|e| caller.fail(e))?;
    Ok(Json(request))
}

async fn start_repair<S: RepairStore + Clone + 'static>(
    State(state): State<ApiState<S>>,
    caller: Caller,
    Path(id): Path<String>,
    Json(details): Json<DeviceDetails>,
) -> Result<Json<RepairRequest>, ApiError> {
    let shop_id = caller.shop()?;
    let request = state
        .service
        .start_repair(shop_id, &RepairRequestId(id), details)
        .await
        .map_err(|e| caller.fail(e))?;
    Ok(Json(request))
}

async fn assigned_shop<S: RepairStore + Clone + 'static>(
    State(state): State<ApiState<S>>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<Json<AssignedShopResponse>, ApiError> {
    let request_id = RepairRequestId(id);
    state.service.request(&request_id).await.map_err(|e| caller.fail(e))?;
    let shop = state.service.assigned_shop(&request_id).await.map_err(|e| caller.fail(e))?;
    Ok(Json(AssignedShopResponse { request_id: request_id.0, shop }))
}

async fn submit_review<S: RepairStore + Clone + 'static>(
    State(state): State<ApiState<S>>,
    caller: Caller,
    Path(id): Path<String>,
    Json(body): Json<ReviewBody>,
) -> Result<(StatusCode, Json<Review>), ApiError> {
    let customer_id = caller.customer()?;
    let review = state
        .service
        .submit_review(customer_id, &RepairRequestId(id), body.rating, &body.comment)
        .await
        .map_err(|e| caller.fail(e))?;
    Ok((StatusCode::CREATED, Json(review)))
}

async fn shop_rating<S: RepairStore + Clone + 'static>(
    State(state): State<ApiState<S>>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<Json<ShopRatingSummary>, ApiError> {
    let summary = state.service.shop_rating_summary(&ShopId(id)).await.map_err(|e| caller.fail(e))?;
    Ok(Json(summary))
}

async fn shop_requests<S: RepairStore + Clone + 'static>(
    State(state): State<ApiState<S>>,
    caller: Caller,
    Query(query): Query<ShopRequestsQuery>,
) -> Result<Json<Vec<ShopAssignment>>, ApiError> {
    let shop_id = caller.shop()?;
    let view = match query.state.as_deref() {
        None => ShopRequestView::Active,
        Some(raw) => ShopRequestView::parse(raw).ok_or_else(|| {
            ApiError::bad_request(format!("unknown request view `{raw}`"), &caller.correlation_id)
        })?,
    };
    let assignments =
        state.service.requests_for_shop(shop_id, view).await.map_err(|e| caller.fail(e))?;
    Ok(Json(assignments))
}

async fn shop_reviews<S: RepairStore + Clone + 'static>(
    State(state): State<ApiState<S>>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<Json<Vec<Review>>, ApiError> {
    let reviews = state.service.reviews_for_shop(&ShopId(id)).await.map_err(|e| caller.fail(e))?;
    Ok(Json(reviews))
}

async fn my_reviews<S: RepairStore + Clone + 'static>(
    State(state): State<ApiState<S>>,
    caller: Caller,
) -> Result<Json<Vec<Review>>, ApiError> {
    let customer_id = caller.customer()?;
    let reviews =
        state.service.reviews_for_customer(customer_id).await.map_err(|e| caller.fail(e))?;
    Ok(Json(reviews))
}

async fn request_review<S: RepairStore + Clone + 'static>(
    State(state): State<ApiState<S>>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<Json<Review>, ApiError> {
    let request_id = RepairRequestId(id);
    let request = state.service.request(&request_id).await.map_err(|e| caller.fail(e))?;
    caller.ensure_can_view(&request)?;
    let review = state.service.review_for_request(&request_id).await.map_err(|e| caller.fail(e))?;
    Ok(Json(review))
}
