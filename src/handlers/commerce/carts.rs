use crate::handlers::common::{
    created_response, no_content_response, success_response, validate_input, VersionRequest,
};
use crate::{
    errors::ServiceError,
    models::address::Address,
    services::commerce::cart_service::{AddToCartInput, CreateCartInput},
    AppState,
};
use axum::{
    extract::{Json, Path, Query, State},
    response::IntoResponse,
    routing::{delete, get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

/// Creates the router for cart endpoints
pub fn carts_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_cart))
        .route("/:id", get(get_cart).delete(delete_cart))
        .route("/:id/items", post(add_to_cart))
        .route(
            "/:id/items/:item_id",
            put(update_cart_item).delete(remove_cart_item),
        )
        .route("/:id/coupon", put(apply_coupon).delete(remove_coupon))
        .route("/:id/shipping-address", put(set_shipping_address))
        .route("/:id/billing-address", put(set_billing_address))
        .route("/:id/shipping-method", put(set_shipping_method))
        .route("/:id/merge", post(merge_guest_cart))
}

/// Create a new cart
async fn create_cart(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateCartRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let input = CreateCartInput {
        session_id: payload.session_id,
        customer_id: payload.customer_id,
        currency: payload.currency,
    };

    let cart = state.services.carts.create_cart(input).await?;
    Ok(created_response(cart))
}

/// Get cart with items and totals
async fn get_cart(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let cart = state.services.carts.get_cart(id).await?;
    Ok(success_response(cart))
}

async fn delete_cart(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    state.services.carts.delete_cart(id).await?;
    Ok(no_content_response())
}

/// Add item to cart
async fn add_to_cart(
    State(state): State<Arc<AppState>>,
    Path(cart_id): Path<Uuid>,
    Json(payload): Json<AddItemRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;

    let input = AddToCartInput {
        product_id: payload.product_id,
        variant_id: payload.variant_id,
        quantity: payload.quantity,
    };

    let cart = state
        .services
        .carts
        .add_item(cart_id, payload.expected_version, input)
        .await?;
    Ok(success_response(cart))
}

/// Update cart item quantity; zero removes the line
async fn update_cart_item(
    State(state): State<Arc<AppState>>,
    Path((cart_id, item_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<UpdateQuantityRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;

    let cart = state
        .services
        .carts
        .update_item_quantity(cart_id, payload.expected_version, item_id, payload.quantity)
        .await?;
    Ok(success_response(cart))
}

/// Remove item from cart
async fn remove_cart_item(
    State(state): State<Arc<AppState>>,
    Path((cart_id, item_id)): Path<(Uuid, Uuid)>,
    Query(version): Query<VersionRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let cart = state
        .services
        .carts
        .remove_item(cart_id, version.expected_version, item_id)
        .await?;
    Ok(success_response(cart))
}

async fn apply_coupon(
    State(state): State<Arc<AppState>>,
    Path(cart_id): Path<Uuid>,
    Json(payload): Json<ApplyCouponRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let cart = state
        .services
        .carts
        .apply_coupon(cart_id, payload.expected_version, payload.code)
        .await?;
    Ok(success_response(cart))
}

async fn remove_coupon(
    State(state): State<Arc<AppState>>,
    Path(cart_id): Path<Uuid>,
    Query(version): Query<VersionRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let cart = state
        .services
        .carts
        .remove_coupon(cart_id, version.expected_version)
        .await?;
    Ok(success_response(cart))
}

async fn set_shipping_address(
    State(state): State<Arc<AppState>>,
    Path(cart_id): Path<Uuid>,
    Json(payload): Json<AddressRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let cart = state
        .services
        .carts
        .set_shipping_address(cart_id, payload.expected_version, payload.address)
        .await?;
    Ok(success_response(cart))
}

async fn set_billing_address(
    State(state): State<Arc<AppState>>,
    Path(cart_id): Path<Uuid>,
    Json(payload): Json<AddressRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let cart = state
        .services
        .carts
        .set_billing_address(cart_id, payload.expected_version, payload.address)
        .await?;
    Ok(success_response(cart))
}

async fn set_shipping_method(
    State(state): State<Arc<AppState>>,
    Path(cart_id): Path<Uuid>,
    Json(payload): Json<ShippingMethodRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let cart = state
        .services
        .carts
        .set_shipping_method(cart_id, payload.expected_version, payload.method_code)
        .await?;
    Ok(success_response(cart))
}

/// Fold a guest cart into the customer's active cart after login
async fn merge_guest_cart(
    State(state): State<Arc<AppState>>,
    Path(guest_cart_id): Path<Uuid>,
    Json(payload): Json<MergeCartRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let cart = state
        .services
        .carts
        .merge_guest_cart(guest_cart_id, payload.customer_id)
        .await?;
    Ok(success_response(cart))
}

// Request DTOs

#[derive(Debug, Deserialize, Serialize)]
pub struct CreateCartRequest {
    pub session_id: Option<String>,
    pub customer_id: Option<Uuid>,
    pub currency: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct AddItemRequest {
    pub expected_version: u64,
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    #[validate(range(min = 1, max = 10000))]
    pub quantity: i64,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct UpdateQuantityRequest {
    pub expected_version: u64,
    #[validate(range(min = 0, max = 10000))]
    pub quantity: i64,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct ApplyCouponRequest {
    pub expected_version: u64,
    #[validate(length(min = 1, max = 64))]
    pub code: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AddressRequest {
    pub expected_version: u64,
    pub address: Address,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ShippingMethodRequest {
    pub expected_version: u64,
    pub method_code: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct MergeCartRequest {
    pub customer_id: Uuid,
}
