use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use hydrolink_client::ClientError;

use crate::merger::MergeError;

/// Failure of one poll cycle, or of one connection's branch within it.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("authentication failed: {0}")]
    Auth(#[source] ClientError),
    #[error("portal request failed: {0}")]
    Api(#[source] ClientError),
    #[error("worker task failed: {0}")]
    Task(String),
    #[error(transparent)]
    Statistics(#[from] MergeError),
}

impl From<ClientError> for PollError {
    fn from(e: ClientError) -> Self {
        if e.is_auth() {
            PollError::Auth(e)
        } else {
            PollError::Api(e)
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("upstream authentication failed")]
    Auth,
    #[error("upstream request failed: {0}")]
    Upstream(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ClientError> for ApiError {
    fn from(e: ClientError) -> Self {
        if e.is_auth() {
            ApiError::Auth
        } else {
            ApiError::Upstream(e.to_string())
        }
    }
}

impl From<PollError> for ApiError {
    fn from(e: PollError) -> Self {
        match e {
            PollError::Auth(_) => ApiError::Auth,
            other => ApiError::Upstream(other.to_string()),
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.as_str()),
            ApiError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg.as_str()),
            ApiError::Auth => (StatusCode::BAD_GATEWAY, "upstream authentication failed"),
            ApiError::Upstream(msg) => {
                tracing::error!("upstream error: {msg}");
                (StatusCode::BAD_GATEWAY, "upstream request failed")
            }
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.as_str()),
            ApiError::Internal(msg) => {
                tracing::error!("internal error: {msg}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            }
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}
