use super::verified_payload;
use crate::error::ApiError;
use crate::AppState;
use amityvox_models::instance::FederationMode;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub(crate) struct ProfileRequest {
    #[allow(dead_code)]
    #[serde(default)]
    pub user_id: Option<String>,
}

/// POST /federation/v1/users/{user_id}/profile — signed pull of a local
/// user's public profile.
pub async fn profile(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    parts: Parts,
    body: Bytes,
) -> Result<Response, ApiError> {
    let (_, _request): (_, ProfileRequest) = verified_payload(&state, &parts, &body).await?;

    let user = amityvox_db::users::get_user(&state.db, &user_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    // Only local users are served; stubs belong to their home instance.
    if user.instance_id.is_some() {
        return Err(ApiError::NotFound);
    }
    Ok(Json(user.into_profile()).into_response())
}

#[derive(Debug, Deserialize)]
pub(crate) struct LookupQuery {
    username: String,
}

/// GET /federation/v1/users/lookup?username= — unauthenticated lookup,
/// served only while the instance federates openly.
pub async fn lookup(
    State(state): State<AppState>,
    Query(query): Query<LookupQuery>,
) -> Result<Response, ApiError> {
    let mode = state.federation.discovery_document().federation_mode;
    if mode != FederationMode::Open {
        return Err(ApiError::Forbidden);
    }
    let user = amityvox_db::users::get_user_by_username(&state.db, &query.username)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(user.into_profile()).into_response())
}
