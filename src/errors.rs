use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::services::coupons::CouponRejection;

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Error body returned by every failing endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "Not Found",
    "message": "Not found: order 550e8400-e29b-41d4-a716-446655440000",
    "code": "not_found",
    "request_id": "req-abc123xyz",
    "timestamp": "2025-01-10T10:30:00.000Z"
}))]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Bad Request")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// Machine-readable reason, stable across releases
    pub code: String,
    /// Unique request identifier for support and debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// RFC 3339 timestamp when the error occurred
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Scheduling conflict: {0}")]
    SchedulingConflict(String),

    #[error("Invalid coupon {code}: {reason}")]
    InvalidCoupon {
        code: String,
        reason: CouponRejection,
    },

    #[error("Payment gateway error: {0}")]
    PaymentGatewayError(String),

    #[error("Payment rejected ({code}): {reason}")]
    PaymentRejected { code: i32, reason: String },

    #[error("Amount mismatch on order {order_id}: order {order_amount}, transaction {transaction_amount}")]
    AmountMismatch {
        order_id: Uuid,
        order_amount: i64,
        transaction_amount: i64,
    },

    #[error("Payment for order {0} is already verified")]
    AlreadyVerified(Uuid),

    #[error("Transaction could not be persisted: {0}")]
    TransactionPersistError(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) | Self::InternalError(_) | Self::TransactionPersistError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) | Self::BadRequest(_) | Self::InvalidCoupon { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::Conflict(_) | Self::SchedulingConflict(_) | Self::AlreadyVerified(_) => {
                StatusCode::CONFLICT
            }
            Self::PaymentGatewayError(_) => StatusCode::BAD_GATEWAY,
            Self::PaymentRejected { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::AmountMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
        }
    }

    /// Stable machine-readable code for clients
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "database_error",
            Self::NotFound(_) => "not_found",
            Self::ValidationError(_) => "validation_error",
            Self::BadRequest(_) => "bad_request",
            Self::Conflict(_) => "conflict",
            Self::SchedulingConflict(_) => "scheduling_conflict",
            Self::InvalidCoupon { reason, .. } => reason.code(),
            Self::PaymentGatewayError(_) => "payment_gateway_error",
            Self::PaymentRejected { .. } => "payment_rejected",
            Self::AmountMismatch { .. } => "amount_mismatch",
            Self::AlreadyVerified(_) => "already_verified",
            Self::TransactionPersistError(_) => "transaction_persist_error",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::InternalError(_) => "internal_error",
        }
    }

    /// Gateway failures during checkout start can be retried against the same order.
    /// Amount mismatches never can.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PaymentGatewayError(_)
                | Self::PaymentRejected { .. }
                | Self::TransactionPersistError(_)
        )
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) | Self::TransactionPersistError(_) => {
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            code: self.code().to_string(),
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}
