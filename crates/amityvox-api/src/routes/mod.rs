pub mod federation;
pub mod guilds;
pub mod users;
pub mod voice;
pub mod wellknown;

use crate::error::ApiError;
use crate::AppState;
use amityvox_federation::signing::SignedEnvelope;
use axum::body::Bytes;
use axum::extract::ConnectInfo;
use axum::http::request::Parts;
use serde::de::DeserializeOwned;
use std::net::{IpAddr, SocketAddr};

/// Source address of the request, when the listener provides one.
pub(crate) fn source_ip(parts: &Parts) -> Option<IpAddr> {
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
}

/// Run the shared envelope verification and decode the typed payload.
pub(crate) async fn verified_payload<T: DeserializeOwned>(
    state: &AppState,
    parts: &Parts,
    body: &Bytes,
) -> Result<(SignedEnvelope, T), ApiError> {
    let envelope = state
        .federation
        .verify_inbound_envelope(body, source_ip(parts))
        .await?;
    let payload: T = envelope.decode_payload()?;
    Ok((envelope, payload))
}

/// Assert the acting user exists and is homed on the sending instance.
pub(crate) async fn ensure_user_homed_on_sender(
    state: &AppState,
    user_id: &str,
    sender_id: &str,
) -> Result<(), ApiError> {
    match amityvox_db::users::user_instance_id(&state.db, user_id).await? {
        Some(Some(home)) if home == sender_id => Ok(()),
        _ => Err(ApiError::Forbidden),
    }
}
