use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::handlers::common::{success_response, validate_input};
use crate::{
    errors::ServiceError,
    models::order::Order,
    services::orders::{CancelOrderRequest, RefundOrderRequest, ShipOrderRequest},
    AppState,
};

/// Creates the router for order endpoints
pub fn orders_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/:id", get(get_order))
        .route("/:id/capture", post(capture_payment))
        .route("/:id/process", post(start_processing))
        .route("/:id/ship", post(ship_order))
        .route("/:id/deliver", post(deliver_order))
        .route("/:id/complete", post(complete_order))
        .route("/:id/hold", post(hold_order))
        .route("/:id/release", post(release_hold))
        .route("/:id/cancel", post(cancel_order))
        .route("/:id/refund", post(refund_order))
        .route("/:id/notes", post(add_note))
}

// Resolve an order identifier that may be a UUID or an order_number string
fn resolve_order(state: &AppState, id: &str) -> Result<Order, ServiceError> {
    if let Ok(uuid) = Uuid::parse_str(id) {
        return state.services.orders.get_order(uuid);
    }
    state
        .services
        .orders
        .find_by_number(id)
        .ok_or_else(|| ServiceError::NotFound(format!("Order with ID {} not found", id)))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = resolve_order(&state, &id)?;
    Ok(success_response(order))
}

/// Capture an authorized payment
async fn capture_payment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = resolve_order(&state, &id)?;
    let order = state.services.orders.capture_payment(order.id).await?;
    Ok(success_response(order))
}

async fn start_processing(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<OptionalVersion>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = resolve_order(&state, &id)?;
    let order = state
        .services
        .orders
        .start_processing(order.id, payload.expected_version)
        .await?;
    Ok(success_response(order))
}

async fn ship_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<ShipOrderRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let order = resolve_order(&state, &id)?;
    let order = state.services.orders.ship(order.id, payload).await?;
    Ok(success_response(order))
}

async fn deliver_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<OptionalVersion>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = resolve_order(&state, &id)?;
    let order = state
        .services
        .orders
        .deliver(order.id, payload.expected_version)
        .await?;
    Ok(success_response(order))
}

async fn complete_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<OptionalVersion>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = resolve_order(&state, &id)?;
    let order = state
        .services
        .orders
        .complete(order.id, payload.expected_version)
        .await?;
    Ok(success_response(order))
}

async fn hold_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<ReasonRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let order = resolve_order(&state, &id)?;
    let order = state
        .services
        .orders
        .hold(order.id, payload.reason, payload.expected_version)
        .await?;
    Ok(success_response(order))
}

async fn release_hold(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<OptionalVersion>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = resolve_order(&state, &id)?;
    let order = state
        .services
        .orders
        .release_hold(order.id, payload.expected_version)
        .await?;
    Ok(success_response(order))
}

/// Cancel an order; the payment is voided or refunded and stock returned
async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<CancelOrderRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let order = resolve_order(&state, &id)?;
    let order = state.services.orders.cancel(order.id, payload).await?;
    Ok(success_response(order))
}

/// Refund part or all of the captured amount
async fn refund_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<RefundOrderRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let order = resolve_order(&state, &id)?;
    let order = state.services.orders.refund(order.id, payload).await?;
    Ok(success_response(order))
}

async fn add_note(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<NoteRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let order = resolve_order(&state, &id)?;
    let order = state
        .services
        .orders
        .add_note(order.id, payload.note, payload.expected_version)
        .await?;
    Ok(success_response(order))
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct OptionalVersion {
    #[serde(default)]
    pub expected_version: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct ReasonRequest {
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
    #[serde(default)]
    pub expected_version: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct NoteRequest {
    #[validate(length(min = 1, max = 2000))]
    pub note: String,
    #[serde(default)]
    pub expected_version: Option<u64>,
}
