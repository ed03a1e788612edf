use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GpioError>;

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Driver error: {0}")]
    Driver(String),
    #[error("Cancelled: {0}")]
    Cancelled(String),
    #[error("Pin not found: {0}")]
    NotFound(String),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

impl ResponseError for GpioError {
    fn status_code(&self) -> StatusCode {
        match self {
            GpioError::NotFound(_) => StatusCode::NOT_FOUND,
            GpioError::Configuration(_) | GpioError::InvalidState(_) | GpioError::InvalidValue(_) => {
                StatusCode::BAD_REQUEST
            }
            GpioError::Cancelled(_) => StatusCode::SERVICE_UNAVAILABLE,
            GpioError::Driver(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}
