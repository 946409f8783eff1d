use super::{source_ip, verified_payload};
use crate::error::ApiError;
use crate::AppState;
use amityvox_federation::protocol::{DeliveryReceiptNotice, ManageResponse};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// POST /federation/v1/handshake
pub async fn handshake(
    State(state): State<AppState>,
    parts: Parts,
    body: Bytes,
) -> Result<Response, ApiError> {
    let response = state
        .federation
        .handle_handshake(&body, source_ip(&parts))
        .await?;
    Ok(Json(response).into_response())
}

/// POST /federation/v1/inbox — event ingress, 202 on acceptance.
pub async fn inbox(
    State(state): State<AppState>,
    parts: Parts,
    body: Bytes,
) -> Result<Response, ApiError> {
    state
        .federation
        .handle_inbox(&body, source_ip(&parts))
        .await?;
    Ok((StatusCode::ACCEPTED, Json(json!({"status": "accepted"}))).into_response())
}

/// POST /federation/v1/sync — signed backfill replay.
pub async fn sync(
    State(state): State<AppState>,
    parts: Parts,
    body: Bytes,
) -> Result<Response, ApiError> {
    let response = state
        .federation
        .handle_sync(&body, source_ip(&parts))
        .await?;
    Ok(Json(response).into_response())
}

/// POST /federation/v1/delivery-receipt
pub async fn delivery_receipt(
    State(state): State<AppState>,
    parts: Parts,
    body: Bytes,
) -> Result<Response, ApiError> {
    let (envelope, notice): (_, DeliveryReceiptNotice) =
        verified_payload(&state, &parts, &body).await?;
    amityvox_db::delivery::upsert_delivery_receipt(
        &state.db,
        &notice.message_id,
        &notice.source,
        &notice.target,
        &notice.status,
        notice.attempts,
        notice.error.as_deref(),
    )
    .await?;
    tracing::debug!(
        sender = %envelope.sender_id,
        message_id = %notice.message_id,
        status = %notice.status,
        "recorded delivery receipt"
    );
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// POST /federation/v1/guilds/{guild_id}/manage — proxied home-instance
/// mutation. Failures are reported in the `{ok:false}` body with a
/// matching status so callers can pass them through.
pub async fn manage(
    State(state): State<AppState>,
    Path(guild_id): Path<String>,
    parts: Parts,
    body: Bytes,
) -> Response {
    match state
        .federation
        .handle_manage(&guild_id, &body, source_ip(&parts))
        .await
    {
        Ok(outcome) => {
            let status = if outcome.action == "member_join" {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            (status, Json(ManageResponse::success(outcome.data))).into_response()
        }
        Err(e) => {
            let api_error = ApiError::from(e);
            let status = api_error.status();
            (status, Json(ManageResponse::failure(api_error.to_string()))).into_response()
        }
    }
}
