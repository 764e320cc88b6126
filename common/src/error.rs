use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Payment expired: {0}")]
    Expired(String),

    #[error("Payment provider error: {0}")]
    Provider(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl PaymentError {
    /// Short machine-readable kind, returned to callers as `status`.
    pub fn kind(&self) -> &'static str {
        match self {
            PaymentError::Validation(_) => "invalid_request",
            PaymentError::NotFound(_) => "not_found",
            PaymentError::Conflict(_) => "conflict",
            PaymentError::Expired(_) => "expired",
            PaymentError::Provider(_) => "provider_error",
            PaymentError::Internal(_) => "internal_error",
        }
    }
}

impl ResponseError for PaymentError {
    fn status_code(&self) -> StatusCode {
        match self {
            PaymentError::Validation(_) => StatusCode::BAD_REQUEST,
            PaymentError::NotFound(_) => StatusCode::NOT_FOUND,
            PaymentError::Conflict(_) => StatusCode::CONFLICT,
            PaymentError::Expired(_) => StatusCode::GONE,
            PaymentError::Provider(_) => StatusCode::BAD_GATEWAY,
            PaymentError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        // Storage details stay in the log.
        let message = match self {
            PaymentError::Internal(e) => {
                log::error!("Internal error while handling payment request: {:#}", e);
                "An internal error occurred. Please try again later.".to_string()
            }
            other => other.to_string(),
        };
        HttpResponse::build(self.status_code()).json(json!({
            "status": self.kind(),
            "error": message,
        }))
    }
}

pub type Result<T, E = PaymentError> = std::result::Result<T, E>;

/// True when the error chain holds a unique-constraint violation from the database.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<sqlx::Error>() {
        Some(sqlx::Error::Database(db_err)) => db_err.is_unique_violation(),
        _ => false,
    }
}
