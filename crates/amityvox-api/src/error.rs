use amityvox_federation::FederationError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("gone: {0}")]
    Gone(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("remote rejected: {0}")]
    RemoteLogical(String),
    #[error("upstream peer error")]
    Upstream,
    #[error("capability disabled")]
    CapabilityDisabled,
    #[error("internal server error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Gone(_) => StatusCode::GONE,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::RemoteLogical(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Upstream => StatusCode::BAD_GATEWAY,
            ApiError::CapabilityDisabled => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Internal(err) => {
                tracing::error!("API internal error: {err:#}");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<FederationError> for ApiError {
    fn from(e: FederationError) -> Self {
        match e {
            FederationError::Malformed(msg) => ApiError::BadRequest(msg),
            FederationError::AuthFailure(msg) => {
                tracing::debug!("federation auth failure: {msg}");
                ApiError::Forbidden
            }
            FederationError::NotFound(_) => ApiError::NotFound,
            FederationError::Gone(msg) => ApiError::Gone(msg),
            FederationError::Conflict(msg) => ApiError::Conflict(msg),
            FederationError::RemoteLogical(msg) => ApiError::RemoteLogical(msg),
            FederationError::UpstreamTransport(msg) => {
                tracing::warn!("upstream transport failure: {msg}");
                ApiError::Upstream
            }
            FederationError::CapabilityDisabled => ApiError::CapabilityDisabled,
            FederationError::Database(e) => ApiError::Internal(anyhow::anyhow!(e)),
            FederationError::Internal(msg) => ApiError::Internal(anyhow::anyhow!(msg)),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Internal(anyhow::anyhow!(e))
    }
}

impl From<amityvox_core::error::CoreError> for ApiError {
    fn from(e: amityvox_core::error::CoreError) -> Self {
        use amityvox_core::error::CoreError;
        match e {
            CoreError::NotFound => ApiError::NotFound,
            CoreError::Forbidden | CoreError::MissingPermission => ApiError::Forbidden,
            CoreError::BadRequest(msg) => ApiError::BadRequest(msg),
            CoreError::Conflict(msg) => ApiError::Conflict(msg),
            CoreError::Database(e) => ApiError::Internal(anyhow::anyhow!(e)),
            CoreError::Internal(msg) => ApiError::Internal(anyhow::anyhow!(msg)),
        }
    }
}
