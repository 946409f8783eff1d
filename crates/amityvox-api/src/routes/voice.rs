use super::verified_payload;
use crate::error::ApiError;
use crate::AppState;
use amityvox_federation::voice::VoiceTokenRequest;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// POST /federation/v1/voice/token — mint a room token for a remote
/// member, 503 while the capability is disabled.
pub async fn token(
    State(state): State<AppState>,
    parts: Parts,
    body: Bytes,
) -> Result<Response, ApiError> {
    let (envelope, request): (_, VoiceTokenRequest) =
        verified_payload(&state, &parts, &body).await?;
    let grant = state
        .federation
        .mint_voice_token(&request, &envelope.sender_id)
        .await?;
    Ok(Json(grant).into_response())
}
