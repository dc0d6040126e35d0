//! API error type and [`axum::response::IntoResponse`] implementation.

use armory_core::{ProviderError, RegistrationError, SyncError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::engine::EngineError;

/// An error returned by an API handler.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<armory_store::Error> for ApiError {
    fn from(e: armory_store::Error) -> Self {
        ApiError::Store(Box::new(e))
    }
}

impl From<ProviderError> for ApiError {
    fn from(e: ProviderError) -> Self {
        ApiError::Engine(EngineError::Provider(e))
    }
}

fn provider_status(e: &ProviderError) -> StatusCode {
    match e {
        ProviderError::NoFace | ProviderError::InvalidImage(_) => StatusCode::BAD_REQUEST,
        ProviderError::Unavailable(_) | ProviderError::Malformed(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Engine(e) => match e {
                EngineError::Provider(p) => provider_status(p),
                EngineError::Registration(RegistrationError::UnknownSubject(_)) => {
                    StatusCode::NOT_FOUND
                }
                EngineError::Registration(RegistrationError::Provider(p)) => provider_status(p),
                EngineError::Sync(SyncError::List(_)) => StatusCode::BAD_GATEWAY,
                EngineError::SyncDisabled => StatusCode::CONFLICT,
                EngineError::ChannelClosed => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, %status, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
