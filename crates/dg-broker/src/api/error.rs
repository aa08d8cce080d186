//! HTTP error mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use dg_core::{RegistryError, SessionError};
use dg_protocol::ProtocolError;

/// Errors returned by API handlers
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Invalid connection id: {0}")]
    BadId(String),

    #[error(transparent)]
    BadInput(#[from] ProtocolError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Session(SessionError::NotFound(_))
            | ApiError::Registry(RegistryError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Session(SessionError::AlreadyConnected(_)) => StatusCode::CONFLICT,
            ApiError::Session(SessionError::Registry(_)) | ApiError::Registry(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::BadId(_) | ApiError::BadInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Session(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!("API request failed: {}", self);
        }
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}
