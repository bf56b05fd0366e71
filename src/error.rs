use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

/// Failure reported by a hardware device call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceFault {
    #[error("device disconnected: {0}")]
    Disconnected(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("device call timed out: {0}")]
    TimedOut(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("i/o error: {0}")]
    Io(String),
}

impl DeviceFault {
    /// Whether the fault points at the device rather than at the request.
    pub fn is_device_fault(&self) -> bool {
        !matches!(self, DeviceFault::Unsupported(_))
    }
}

impl From<std::io::Error> for DeviceFault {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match e.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => DeviceFault::TimedOut(e.to_string()),
            ErrorKind::PermissionDenied => DeviceFault::PermissionDenied(e.to_string()),
            ErrorKind::NotFound | ErrorKind::BrokenPipe | ErrorKind::NotConnected => {
                DeviceFault::Disconnected(e.to_string())
            }
            _ => DeviceFault::Io(e.to_string()),
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("Resource not found: {0}")]
    NotFound(String),
    #[error("Resource busy: {0}")]
    ResourceBusy(String),
    #[error("Resource overloaded: {0}")]
    Overloaded(String),
    #[error("Resource degraded: {0}")]
    ResourceDegraded(String),
    #[error("Hardware failure: {0}")]
    HardwareFailure(#[from] DeviceFault),
    #[error("Timed out waiting for {0}")]
    Timeout(String),
    #[error("Shutdown in progress")]
    ShutdownInProgress,
    #[error("Command cancelled")]
    Cancelled,
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::ResourceBusy(_) | AppError::Cancelled => StatusCode::CONFLICT,
            AppError::Overloaded(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::ResourceDegraded(_) | AppError::ShutdownInProgress => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::HardwareFailure(DeviceFault::Unsupported(_)) => StatusCode::BAD_REQUEST,
            AppError::HardwareFailure(_) => StatusCode::BAD_GATEWAY,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::InvalidState(_) | AppError::InvalidValue(_) => StatusCode::BAD_REQUEST,
            AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}
