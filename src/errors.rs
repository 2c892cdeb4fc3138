use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::discount::CouponRejection;
use crate::models::reservation::StockShortage;

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// JSON body returned for every failed request.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g. "Conflict")
    pub error: String,
    /// Machine-readable error code
    pub code: String,
    /// Human-readable description
    pub message: String,
    /// Structured details, e.g. the per-item stock shortfall
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

/// Coarse classification callers use to decide between retrying against
/// fresh state, showing a message, or escalating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Conflict,
    External,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Coupon rejected: {0}")]
    InvalidCoupon(CouponRejection),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Concurrent modification of {id}: expected version {expected}, found {actual}")]
    ConcurrentModification { id: Uuid, expected: u64, actual: u64 },

    #[error("Insufficient stock for {} item(s)", .0.len())]
    StockConflict(Vec<StockShortage>),

    #[error("Reservation {0} has expired")]
    ReservationExpired(Uuid),

    #[error("Payment declined: {0}")]
    PaymentDeclined(String),

    #[error("Payment pending reconciliation for intent {0}")]
    PaymentPending(Uuid),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    /// Builds an invariant violation and logs it loudly; these indicate a bug.
    pub fn invariant(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(invariant = %message, "invariant violation");
        ServiceError::InvariantViolation(message)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_)
            | Self::ValidationError(_)
            | Self::InvalidCoupon(_)
            | Self::InvalidTransition(_)
            | Self::InvalidPayload(_) => ErrorKind::Validation,
            Self::Conflict(_)
            | Self::ConcurrentModification { .. }
            | Self::StockConflict(_)
            | Self::ReservationExpired(_) => ErrorKind::Conflict,
            Self::PaymentDeclined(_)
            | Self::PaymentPending(_)
            | Self::ProviderUnavailable(_)
            | Self::InvalidSignature => ErrorKind::External,
            Self::InvariantViolation(_) | Self::InternalError(_) => ErrorKind::Internal,
        }
    }

    /// True for conflicts the caller should retry against fresh state.
    pub fn is_retryable_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::ConcurrentModification { .. })
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::ValidationError(_) => "validation_error",
            Self::InvalidCoupon(_) => "invalid_coupon",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::Conflict(_) => "conflict",
            Self::ConcurrentModification { .. } => "stale_version",
            Self::StockConflict(_) => "insufficient_stock",
            Self::ReservationExpired(_) => "reservation_expired",
            Self::PaymentDeclined(_) => "payment_declined",
            Self::PaymentPending(_) => "payment_pending",
            Self::ProviderUnavailable(_) => "provider_unavailable",
            Self::InvalidSignature => "invalid_signature",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::InvariantViolation(_) => "invariant_violation",
            Self::InternalError(_) => "internal_error",
        }
    }

    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_)
            | Self::InvalidCoupon(_)
            | Self::InvalidTransition(_)
            | Self::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) | Self::ConcurrentModification { .. } => StatusCode::CONFLICT,
            Self::StockConflict(_) | Self::ReservationExpired(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::PaymentDeclined(_) => StatusCode::PAYMENT_REQUIRED,
            Self::PaymentPending(_) => StatusCode::ACCEPTED,
            Self::ProviderUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::InvalidSignature => StatusCode::UNAUTHORIZED,
            Self::InvariantViolation(_) | Self::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::InvariantViolation(_) | Self::InternalError(_) => {
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::StockConflict(shortages) => serde_json::to_value(shortages).ok(),
            Self::InvalidCoupon(rejection) => serde_json::to_value(rejection).ok(),
            _ => None,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            code: self.code().to_string(),
            message: self.response_message(),
            details: self.details(),
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::discount::CouponRejectionReason;
    use crate::models::reservation::StockKey;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn service_error_response_includes_request_id() {
        let response =
            crate::tracing::scope_request_id(crate::tracing::RequestId::new("req-123"), async {
                ServiceError::NotFound("missing".into()).into_response()
            })
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload.request_id.as_deref(), Some("req-123"));
        assert_eq!(payload.code, "not_found");
    }

    #[tokio::test]
    async fn stock_conflict_lists_shortages() {
        let key = StockKey::new(Uuid::new_v4(), None);
        let response = ServiceError::StockConflict(vec![StockShortage {
            key,
            requested: 3,
            available: 1,
        }])
        .into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: ErrorResponse = serde_json::from_slice(&body).unwrap();
        let details = payload.details.expect("shortage details");
        assert_eq!(details[0]["requested"], 3);
        assert_eq!(details[0]["available"], 1);
    }

    #[test]
    fn errors_are_classified() {
        assert_eq!(
            ServiceError::InvalidCoupon(CouponRejection::new(
                "SAVE",
                CouponRejectionReason::Expired
            ))
            .kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            ServiceError::ConcurrentModification {
                id: Uuid::new_v4(),
                expected: 1,
                actual: 2
            }
            .kind(),
            ErrorKind::Conflict
        );
        assert_eq!(ServiceError::InvalidSignature.kind(), ErrorKind::External);
        assert_eq!(
            ServiceError::InvariantViolation("x".into()).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn internal_details_are_hidden() {
        assert_eq!(
            ServiceError::InvariantViolation("reservation committed twice".into())
                .response_message(),
            "Internal server error"
        );
        assert_eq!(
            ServiceError::ValidationError("Invalid email".into()).response_message(),
            "Validation error: Invalid email"
        );
    }
}
