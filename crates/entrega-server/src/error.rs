use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use entrega_core::{
    EngineError, PauseError, QueueInfoError, ResumeError, StartError, StopError, StoreError,
};

/// Uniform error body for every control-plane failure.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "engine_unavailable", err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string())
    }
}

impl From<StartError> for ApiError {
    fn from(err: StartError) -> Self {
        match err {
            StartError::Validation(e) => ApiError::bad_request("invalid_config", e.to_string()),
            StartError::AlreadyConsuming(q) => {
                ApiError::bad_request("already_consuming", format!("queue already consumed: {q}"))
            }
            StartError::QueueNotFound(q) => ApiError::not_found(format!("queue not found: {q}")),
            StartError::Broker(e) => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "broker_error", e.to_string())
            }
            StartError::Store(e) => e.into(),
            StartError::Engine(e) => e.into(),
        }
    }
}

impl From<PauseError> for ApiError {
    fn from(err: PauseError) -> Self {
        match err {
            PauseError::NotConsuming(q) => {
                ApiError::not_found(format!("queue not being consumed: {q}"))
            }
            PauseError::AlreadyPaused(q) => {
                ApiError::bad_request("already_paused", format!("queue already paused: {q}"))
            }
            PauseError::Engine(e) => e.into(),
        }
    }
}

impl From<ResumeError> for ApiError {
    fn from(err: ResumeError) -> Self {
        match err {
            ResumeError::NotConsuming(q) => {
                ApiError::not_found(format!("queue not being consumed: {q}"))
            }
            ResumeError::NotPaused(q) => {
                ApiError::bad_request("not_paused", format!("queue not paused: {q}"))
            }
            ResumeError::Engine(e) => e.into(),
        }
    }
}

impl From<StopError> for ApiError {
    fn from(err: StopError) -> Self {
        match err {
            StopError::NotConsuming(q) => {
                ApiError::not_found(format!("queue not being consumed: {q}"))
            }
            StopError::Engine(e) => e.into(),
        }
    }
}

impl From<QueueInfoError> for ApiError {
    fn from(err: QueueInfoError) -> Self {
        match err {
            QueueInfoError::QueueNotFound(q) => ApiError::not_found(format!("queue not found: {q}")),
            QueueInfoError::Broker(e) => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "broker_error", e.to_string())
            }
            QueueInfoError::Engine(e) => e.into(),
        }
    }
}
