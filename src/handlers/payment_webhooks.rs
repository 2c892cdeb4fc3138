use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use std::sync::Arc;
use tracing::{info, warn};

use crate::{errors::ServiceError, webhooks::SIGNATURE_HEADER, AppState};

/// Creates the router for provider webhook ingress
pub fn payment_webhook_routes() -> Router<Arc<AppState>> {
    Router::new().route("/webhook", post(payment_webhook))
}

// POST /api/v1/payments/webhook
//
// The signature covers the raw body, so it is read as bytes and only parsed
// after verification.
pub async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            warn!("Payment webhook without signature header");
            ServiceError::InvalidSignature
        })?;

    let receipt = state
        .services
        .checkout
        .handle_payment_webhook(&body, signature)
        .await?;

    if let Some(event) = &receipt.event {
        info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            "Payment webhook accepted"
        );
    }
    Ok((StatusCode::OK, Json(receipt.outcome)))
}
