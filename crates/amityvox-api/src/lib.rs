use amityvox_core::events::EventBus;
use amityvox_db::DbPool;
use amityvox_federation::inbox::MAX_INBOX_BODY_BYTES;
use amityvox_federation::FederationService;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub mod error;
pub mod routes;

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub bus: EventBus,
    pub federation: Arc<FederationService>,
    /// Computed channel permissions, (user_id, channel_id) keyed.
    pub permission_cache: amityvox_core::PermissionCache,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Discovery
        .route("/.well-known/amityvox", get(routes::wellknown::discovery))
        // Federation transport
        .route(
            "/federation/v1/handshake",
            post(routes::federation::handshake),
        )
        .route("/federation/v1/inbox", post(routes::federation::inbox))
        .route("/federation/v1/sync", post(routes::federation::sync))
        .route(
            "/federation/v1/delivery-receipt",
            post(routes::federation::delivery_receipt),
        )
        // Home-instance authority
        .route(
            "/federation/v1/guilds/{guild_id}/manage",
            post(routes::federation::manage),
        )
        // Guild proxy surface
        .route(
            "/federation/v1/guilds/discover",
            post(routes::guilds::discover),
        )
        .route(
            "/federation/v1/guilds/{guild_id}/preview",
            get(routes::guilds::preview),
        )
        .route(
            "/federation/v1/guilds/{guild_id}/join",
            post(routes::guilds::join),
        )
        .route(
            "/federation/v1/guilds/{guild_id}/leave",
            post(routes::guilds::leave),
        )
        .route(
            "/federation/v1/guilds/{guild_id}/invite-accept",
            post(routes::guilds::invite_accept),
        )
        .route(
            "/federation/v1/guilds/{guild_id}/members",
            post(routes::guilds::members),
        )
        .route(
            "/federation/v1/guilds/{guild_id}/channels/{channel_id}/messages",
            post(routes::guilds::list_messages),
        )
        .route(
            "/federation/v1/guilds/{guild_id}/channels/{channel_id}/messages/create",
            post(routes::guilds::create_message),
        )
        .route(
            "/federation/v1/guilds/{guild_id}/channels/{channel_id}/messages/{message_id}/reactions",
            post(routes::guilds::reaction_add),
        )
        .route(
            "/federation/v1/guilds/{guild_id}/channels/{channel_id}/messages/{message_id}/reactions/remove",
            post(routes::guilds::reaction_remove),
        )
        .route(
            "/federation/v1/guilds/{guild_id}/channels/{channel_id}/typing",
            post(routes::guilds::typing),
        )
        // User surface
        .route(
            "/federation/v1/users/{user_id}/profile",
            post(routes::users::profile),
        )
        .route("/federation/v1/users/lookup", get(routes::users::lookup))
        // Voice capability
        .route("/federation/v1/voice/token", post(routes::voice::token))
        .layer(DefaultBodyLimit::max(MAX_INBOX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}
