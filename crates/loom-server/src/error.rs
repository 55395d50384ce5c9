use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use loom_core::{ConnectionId, ErrorKind};
use loom_engine::EngineError;
use loom_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("connection {0} not found")]
    UnknownConnection(ConnectionId),
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),
}

impl HubError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownConnection(_) => ErrorKind::NotFound,
            Self::ConnectionClosed(_) => ErrorKind::Transient,
        }
    }
}

/// Error returned from REST handlers.
#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Invalid, message)
    }

    pub fn status(&self) -> StatusCode {
        match self.kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Invalid => StatusCode::BAD_REQUEST,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::BackendFailure | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.kind.code(), message = %self.message, "request failed");
        }
        let body = json!({ "code": self.kind.code(), "message": self.message });
        (status, Json(body)).into_response()
    }
}
