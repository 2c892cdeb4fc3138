use crate::handlers::common::{created_response, success_response, VersionRequest};
use crate::{
    errors::ServiceError,
    models::{
        address::Address,
        checkout::{CheckoutSession, CheckoutStep},
        payment::PaymentIntent,
        tax::ExemptionCertificate,
    },
    services::commerce::checkout_service::SetEmailInput,
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Creates the router for checkout endpoints
pub fn checkout_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(start_checkout))
        .route("/:session_id", get(get_checkout_session))
        .route("/:session_id/email", put(set_email))
        .route("/:session_id/shipping-address", put(set_shipping_address))
        .route("/:session_id/billing-address", put(set_billing_address))
        .route("/:session_id/shipping-method", put(set_shipping_method))
        .route("/:session_id/tax-exemption", put(set_tax_exemption))
        .route("/:session_id/advance", post(advance))
        .route("/:session_id/back", post(go_back))
        .route("/:session_id/payment", post(create_payment))
        .route("/:session_id/complete", post(complete_checkout))
        .route("/:session_id/cancel", post(cancel_checkout))
}

/// Start checkout from cart
async fn start_checkout(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<StartCheckoutRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let session = state
        .services
        .checkout
        .start_checkout(payload.cart_id)
        .await?;
    Ok(created_response(session))
}

/// Get checkout session
async fn get_checkout_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let session = state.services.checkout.get_session(session_id)?;
    Ok(success_response(session))
}

async fn set_email(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<EmailRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let session = state
        .services
        .checkout
        .set_email(
            session_id,
            payload.expected_version,
            SetEmailInput {
                email: payload.email,
            },
        )
        .await?;
    Ok(success_response(session))
}

async fn set_shipping_address(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<AddressRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let session = state
        .services
        .checkout
        .set_shipping_address(session_id, payload.expected_version, payload.address)
        .await?;
    Ok(success_response(session))
}

async fn set_billing_address(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<AddressRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let session = state
        .services
        .checkout
        .set_billing_address(session_id, payload.expected_version, payload.address)
        .await?;
    Ok(success_response(session))
}

async fn set_shipping_method(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<ShippingMethodRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let session = state
        .services
        .checkout
        .select_shipping_method(session_id, payload.expected_version, payload.method_code)
        .await?;
    Ok(success_response(session))
}

/// Attach or clear a tax exemption certificate
async fn set_tax_exemption(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<TaxExemptionRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let session = state
        .services
        .checkout
        .set_tax_exemption(session_id, payload.expected_version, payload.certificate)
        .await?;
    Ok(success_response(session))
}

/// Move to the next step
async fn advance(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<VersionRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let session = state
        .services
        .checkout
        .advance(session_id, payload.expected_version)
        .await?;
    Ok(success_response(session))
}

/// Return to an earlier step
async fn go_back(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<GoBackRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let session = state
        .services
        .checkout
        .go_back(session_id, payload.expected_version, payload.step)
        .await?;
    Ok(success_response(session))
}

/// Create the payment intent, confirming it when a payment method is given
async fn create_payment(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<CreatePaymentRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let (session, payment_intent) = state
        .services
        .checkout
        .create_payment(session_id, payload.expected_version, payload.payment_method)
        .await?;
    Ok(created_response(PaymentResponse {
        session,
        payment_intent,
    }))
}

/// Complete checkout and create the order
async fn complete_checkout(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<VersionRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let session = state
        .services
        .checkout
        .complete(session_id, payload.expected_version)
        .await?;
    Ok(success_response(session))
}

async fn cancel_checkout(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<VersionRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let session = state
        .services
        .checkout
        .cancel(session_id, payload.expected_version)
        .await?;
    Ok(success_response(session))
}

// Request/Response DTOs

#[derive(Debug, Deserialize, Serialize)]
pub struct StartCheckoutRequest {
    pub cart_id: Uuid,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct EmailRequest {
    pub expected_version: u64,
    pub email: String,
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
pub struct TaxExemptionRequest {
    pub expected_version: u64,
    pub certificate: Option<ExemptionCertificate>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GoBackRequest {
    pub expected_version: u64,
    pub step: CheckoutStep,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CreatePaymentRequest {
    pub expected_version: u64,
    #[serde(default)]
    pub payment_method: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    pub session: CheckoutSession,
    pub payment_intent: PaymentIntent,
}
