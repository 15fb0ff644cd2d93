// =============================================================================
// ERROR MODULE
// =============================================================================
// This module defines the service error type and its HTTP responses.
//
// ERROR HANDLING PHILOSOPHY:
// - Buyers only ever see coarse outcomes: out of stock, link expired,
//   already viewed, success. Exact inventory counts and the reason a
//   decryption failed are never part of a response body
// - Vault and database faults are logged in full and answered with a
//   generic 500
// =============================================================================

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::{ErrorResponse, OrderStatus};
use crate::vault::VaultError;

// =============================================================================
// CUSTOM ERROR TYPE
// =============================================================================
#[derive(Debug, Error)]
pub enum AppError {
    // -------------------------------------------------------------------------
    // INFRASTRUCTURE ERRORS
    // -------------------------------------------------------------------------
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Rate limiter error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Key configuration or payload integrity fault. Escalated, never swallowed.
    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    // -------------------------------------------------------------------------
    // INVENTORY & ORDER ERRORS
    // -------------------------------------------------------------------------
    /// Not enough units could be claimed. Carries no counts.
    #[error("Insufficient stock")]
    InsufficientStock,

    #[error("Operation not allowed while order is {status}")]
    InvalidOrderState { status: OrderStatus },

    #[error("Operation not allowed in the inventory item's current state")]
    InvalidInventoryState,

    // -------------------------------------------------------------------------
    // DELIVERY ERRORS
    // -------------------------------------------------------------------------
    #[error("Delivery link has expired")]
    Expired,

    #[error("Credential has already been revealed")]
    AlreadyRevealed,

    /// Another concurrent caller won an exclusive claim. Internal only;
    /// converted to AlreadyRevealed or InsufficientStock before surfacing.
    #[error("Lost a concurrent claim")]
    RaceLost,

    /// Reveal could not produce the credential (decryption or payload fault).
    #[error("Credential could not be delivered")]
    DeliveryUnavailable,

    // -------------------------------------------------------------------------
    // REQUEST ERRORS
    // -------------------------------------------------------------------------
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Too many requests")]
    RateLimited { retry_after_secs: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code for the response body and logs.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Redis(_) => "RATE_LIMITER_ERROR",
            AppError::Vault(_) => "VAULT_ERROR",
            AppError::InsufficientStock => "INSUFFICIENT_STOCK",
            AppError::InvalidOrderState { .. } => "INVALID_ORDER_STATE",
            AppError::InvalidInventoryState => "INVALID_INVENTORY_STATE",
            AppError::Expired => "EXPIRED",
            AppError::AlreadyRevealed | AppError::RaceLost => "ALREADY_REVEALED",
            AppError::DeliveryUnavailable => "DELIVERY_UNAVAILABLE",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Unauthorized => "UNAUTHORIZED",
            AppError::RateLimited { .. } => "RATE_LIMITED",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InsufficientStock
            | AppError::InvalidOrderState { .. }
            | AppError::InvalidInventoryState => StatusCode::CONFLICT,
            AppError::Expired | AppError::AlreadyRevealed | AppError::RaceLost => StatusCode::GONE,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Database(_)
            | AppError::Redis(_)
            | AppError::Vault(_)
            | AppError::DeliveryUnavailable
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to the caller. Server-side faults get fixed wording.
    fn public_message(&self) -> String {
        match self {
            AppError::InsufficientStock => {
                "Not enough stock available. Please reduce the quantity.".to_string()
            }
            AppError::Expired => "This delivery link has expired.".to_string(),
            AppError::AlreadyRevealed | AppError::RaceLost => {
                "This credential has already been revealed and cannot be shown again.".to_string()
            }
            AppError::DeliveryUnavailable => {
                "Unable to deliver this credential. Please contact support.".to_string()
            }
            AppError::NotFound(_) => "The requested resource was not found.".to_string(),
            AppError::RateLimited { .. } => {
                "Too many requests. Please try again later.".to_string()
            }
            AppError::Database(_) | AppError::Redis(_) | AppError::Internal(_) => {
                "An internal error occurred".to_string()
            }
            AppError::Vault(_) => "A configuration error occurred".to_string(),
            other => other.to_string(),
        }
    }
}

// =============================================================================
// HTTP RESPONSE CONVERSION
// =============================================================================
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_code = self.code();

        if status.is_server_error() {
            tracing::error!(error_code, error = %self, "Request failed");
        } else {
            tracing::debug!(error_code, error = %self, "Request rejected");
        }

        let body = ErrorResponse::new(error_code, self.public_message());
        let mut response = (status, Json(body)).into_response();

        if let AppError::RateLimited { retry_after_secs } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}
