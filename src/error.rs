//! Error taxonomy shared by the OTA services and its HTTP mapping

use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("firmware not found")]
    FirmwareNotFound,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("token mismatch")]
    TokenMismatch,

    #[error("{0}")]
    InvalidInput(String),

    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl ServiceError {
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput(reason.into())
    }

    pub fn io(context: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| Self::Io { context, source }
    }

    /// Client errors are expected traffic and must not be logged as failures
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Io { .. })
    }
}

impl ResponseError for ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::DeviceNotFound(_) | Self::FirmwareNotFound => StatusCode::NOT_FOUND,
            Self::Forbidden(_) | Self::TokenMismatch => StatusCode::FORBIDDEN,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = match self {
            Self::TokenMismatch => json!({ "status": "denied", "reason": self.to_string() }),
            _ => json!({ "error": self.to_string() }),
        };

        HttpResponse::build(self.status_code()).json(body)
    }
}
