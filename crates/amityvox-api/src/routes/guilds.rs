use super::{ensure_user_homed_on_sender, verified_payload};
use crate::error::ApiError;
use crate::AppState;
use amityvox_core::permissions as perms;
use amityvox_db::guilds::GuildRow;
use amityvox_models::gateway as subjects;
use amityvox_models::guild::GuildPreview;
use amityvox_models::permissions::Permissions;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

const MAX_MESSAGE_PAGE: i64 = 100;
const MAX_MEMBER_PAGE: i64 = 1000;
const MAX_DISCOVER_PAGE: i64 = 50;

#[derive(Debug, Deserialize)]
pub(crate) struct ActingUser {
    user_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct JoinRequest {
    user_id: String,
    username: Option<String>,
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MemberListRequest {
    user_id: String,
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessageListRequest {
    user_id: String,
    before: Option<String>,
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessageCreateRequest {
    user_id: String,
    content: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReactionRequest {
    user_id: String,
    emoji: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DiscoverRequest {
    limit: Option<i64>,
}

/// Load a guild this instance is the home of; anything else is a 404 from
/// the remote caller's point of view.
async fn load_home_guild(state: &AppState, guild_id: &str) -> Result<GuildRow, ApiError> {
    let guild = amityvox_db::guilds::get_guild(&state.db, guild_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    if !guild.is_locally_owned() {
        return Err(ApiError::NotFound);
    }
    Ok(guild)
}

fn preview_of(guild: &GuildRow) -> GuildPreview {
    GuildPreview {
        id: guild.id.clone(),
        name: guild.name.clone(),
        description: guild.description.clone(),
        member_count: guild.member_count,
    }
}

/// GET /federation/v1/guilds/{guild_id}/preview — public, discoverable
/// guilds only.
pub async fn preview(
    State(state): State<AppState>,
    Path(guild_id): Path<String>,
) -> Result<Response, ApiError> {
    let guild = load_home_guild(&state, &guild_id).await?;
    if !guild.discoverable {
        return Err(ApiError::NotFound);
    }
    Ok(Json(preview_of(&guild)).into_response())
}

/// POST /federation/v1/guilds/discover — signed federated discovery.
pub async fn discover(
    State(state): State<AppState>,
    parts: Parts,
    body: Bytes,
) -> Result<Response, ApiError> {
    let (_, request): (_, DiscoverRequest) = verified_payload(&state, &parts, &body).await?;
    let limit = request.limit.unwrap_or(MAX_DISCOVER_PAGE).clamp(1, MAX_DISCOVER_PAGE);
    let guilds = amityvox_db::guilds::list_discoverable_guilds(&state.db, limit).await?;
    let previews: Vec<GuildPreview> = guilds.iter().map(preview_of).collect();
    Ok(Json(json!({"guilds": previews})).into_response())
}

/// POST /federation/v1/guilds/{guild_id}/join — open join of a
/// discoverable guild by a remote user.
pub async fn join(
    State(state): State<AppState>,
    Path(guild_id): Path<String>,
    parts: Parts,
    body: Bytes,
) -> Result<Response, ApiError> {
    let (envelope, request): (_, JoinRequest) = verified_payload(&state, &parts, &body).await?;
    let sender_id = envelope.sender_id.clone();
    let guild = load_home_guild(&state, &guild_id).await?;
    if !guild.discoverable {
        return Err(ApiError::Forbidden);
    }
    if amityvox_db::bans::is_banned(&state.db, &guild.id, &request.user_id).await? {
        return Err(ApiError::Forbidden);
    }
    if guild.member_count >= guild.max_members {
        return Err(ApiError::Conflict("guild is full".to_string()));
    }

    let username = request.username.as_deref().unwrap_or(&request.user_id);
    amityvox_db::users::ensure_remote_user_stub(
        &state.db,
        &request.user_id,
        username,
        request.display_name.as_deref(),
        None,
        &sender_id,
    )
    .await?;
    if !amityvox_db::members::add_member(&state.db, &guild.id, &request.user_id).await? {
        return Err(ApiError::Conflict("already a member".to_string()));
    }
    amityvox_db::guilds::adjust_member_count(&state.db, &guild.id, 1).await?;
    state
        .federation
        .register_guild_channel_peers(&guild.id, &sender_id)
        .await;
    state.bus.dispatch(
        subjects::EVENT_GUILD_MEMBER_ADD,
        json!({"guild_id": guild.id, "user_id": request.user_id, "username": username}),
        Some(guild.id.clone()),
        None,
        Some(request.user_id.clone()),
    );
    Ok((
        StatusCode::CREATED,
        Json(json!({"guild_id": guild.id, "user_id": request.user_id})),
    )
        .into_response())
}

/// POST /federation/v1/guilds/{guild_id}/invite-accept — invite
/// redemption, sharing the manage RPC's locked transaction.
pub async fn invite_accept(
    State(state): State<AppState>,
    Path(guild_id): Path<String>,
    parts: Parts,
    body: Bytes,
) -> Result<Response, ApiError> {
    let (envelope, payload): (_, serde_json::Value) =
        verified_payload(&state, &parts, &body).await?;
    let user_id = payload
        .get("user_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ApiError::BadRequest("missing user_id".to_string()))?
        .to_string();
    let data = state
        .federation
        .remote_invite_join(&guild_id, &envelope.sender_id, &user_id, &payload)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({"ok": true, "data": data}))).into_response())
}

/// POST /federation/v1/guilds/{guild_id}/leave
pub async fn leave(
    State(state): State<AppState>,
    Path(guild_id): Path<String>,
    parts: Parts,
    body: Bytes,
) -> Result<Response, ApiError> {
    let (envelope, request): (_, ActingUser) = verified_payload(&state, &parts, &body).await?;
    ensure_user_homed_on_sender(&state, &request.user_id, &envelope.sender_id).await?;
    let guild = load_home_guild(&state, &guild_id).await?;

    if !amityvox_db::members::remove_member(&state.db, &guild.id, &request.user_id).await? {
        return Err(ApiError::NotFound);
    }
    amityvox_db::guilds::adjust_member_count(&state.db, &guild.id, -1).await?;
    state
        .federation
        .prune_channel_peers_for(&guild.id, &request.user_id)
        .await;
    state.bus.dispatch(
        subjects::EVENT_GUILD_MEMBER_REMOVE,
        json!({"guild_id": guild.id, "user_id": request.user_id}),
        Some(guild.id.clone()),
        None,
        Some(request.user_id.clone()),
    );
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// POST /federation/v1/guilds/{guild_id}/members — member list for a
/// remote member.
pub async fn members(
    State(state): State<AppState>,
    Path(guild_id): Path<String>,
    parts: Parts,
    body: Bytes,
) -> Result<Response, ApiError> {
    let (envelope, request): (_, MemberListRequest) =
        verified_payload(&state, &parts, &body).await?;
    ensure_user_homed_on_sender(&state, &request.user_id, &envelope.sender_id).await?;
    let guild = load_home_guild(&state, &guild_id).await?;
    perms::ensure_guild_member(&state.db, &guild.id, &request.user_id).await?;

    let limit = request.limit.unwrap_or(MAX_MEMBER_PAGE).clamp(1, MAX_MEMBER_PAGE);
    let members = amityvox_db::members::list_members(&state.db, &guild.id, limit).await?;
    let entries: Vec<serde_json::Value> = members
        .into_iter()
        .map(|m| json!({"user_id": m.user_id, "nickname": m.nickname, "joined_at": m.joined_at}))
        .collect();
    Ok(Json(json!({"guild_id": guild.id, "members": entries})).into_response())
}

/// POST /federation/v1/guilds/{guild_id}/channels/{channel_id}/messages —
/// history read for a remote member.
pub async fn list_messages(
    State(state): State<AppState>,
    Path((guild_id, channel_id)): Path<(String, String)>,
    parts: Parts,
    body: Bytes,
) -> Result<Response, ApiError> {
    let (envelope, request): (_, MessageListRequest) =
        verified_payload(&state, &parts, &body).await?;
    ensure_user_homed_on_sender(&state, &request.user_id, &envelope.sender_id).await?;
    let guild = load_home_guild(&state, &guild_id).await?;
    require_channel(&state, &guild, &channel_id).await?;

    let computed = channel_perms_cached(&state, &guild, &channel_id, &request.user_id).await?;
    perms::require_permission(
        computed,
        Permissions::VIEW_CHANNEL | Permissions::READ_HISTORY,
    )?;

    let limit = request.limit.unwrap_or(50).clamp(1, MAX_MESSAGE_PAGE);
    let rows = amityvox_db::messages::list_channel_messages(
        &state.db,
        &channel_id,
        request.before.as_deref(),
        limit,
    )
    .await?;
    let messages: Result<Vec<_>, _> = rows.into_iter().map(|r| r.into_model()).collect();
    Ok(Json(json!({"channel_id": channel_id, "messages": messages?})).into_response())
}

/// POST .../messages/create — a remote member posting into a home channel.
pub async fn create_message(
    State(state): State<AppState>,
    Path((guild_id, channel_id)): Path<(String, String)>,
    parts: Parts,
    body: Bytes,
) -> Result<Response, ApiError> {
    let (envelope, request): (_, MessageCreateRequest) =
        verified_payload(&state, &parts, &body).await?;
    ensure_user_homed_on_sender(&state, &request.user_id, &envelope.sender_id).await?;
    let guild = load_home_guild(&state, &guild_id).await?;
    require_channel(&state, &guild, &channel_id).await?;

    amityvox_util::validation::validate_message_content(&request.content)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let computed = channel_perms_cached(&state, &guild, &channel_id, &request.user_id).await?;
    perms::require_permission(
        computed,
        Permissions::VIEW_CHANNEL | Permissions::SEND_MESSAGES,
    )?;

    let message_id = amityvox_util::id::generate();
    let created_at = chrono::Utc::now().to_rfc3339();
    amityvox_db::messages::insert_message(
        &state.db,
        &message_id,
        &channel_id,
        &request.user_id,
        &request.content,
        &created_at,
    )
    .await?;

    let payload = json!({
        "id": message_id,
        "guild_id": guild.id,
        "channel_id": channel_id,
        "author_id": request.user_id,
        "content": request.content,
        "created_at": created_at,
    });
    state.bus.dispatch(
        subjects::EVENT_MESSAGE_CREATE,
        payload.clone(),
        Some(guild.id.clone()),
        Some(channel_id.clone()),
        Some(request.user_id.clone()),
    );
    Ok((StatusCode::CREATED, Json(payload)).into_response())
}

/// POST .../reactions — idempotent add.
pub async fn reaction_add(
    State(state): State<AppState>,
    Path((guild_id, channel_id, message_id)): Path<(String, String, String)>,
    parts: Parts,
    body: Bytes,
) -> Result<Response, ApiError> {
    apply_reaction(state, guild_id, channel_id, message_id, parts, body, true).await
}

/// POST .../reactions/remove — idempotent remove.
pub async fn reaction_remove(
    State(state): State<AppState>,
    Path((guild_id, channel_id, message_id)): Path<(String, String, String)>,
    parts: Parts,
    body: Bytes,
) -> Result<Response, ApiError> {
    apply_reaction(state, guild_id, channel_id, message_id, parts, body, false).await
}

async fn apply_reaction(
    state: AppState,
    guild_id: String,
    channel_id: String,
    message_id: String,
    parts: Parts,
    body: Bytes,
    adding: bool,
) -> Result<Response, ApiError> {
    let (envelope, request): (_, ReactionRequest) = verified_payload(&state, &parts, &body).await?;
    ensure_user_homed_on_sender(&state, &request.user_id, &envelope.sender_id).await?;
    let guild = load_home_guild(&state, &guild_id).await?;
    require_channel(&state, &guild, &channel_id).await?;

    let message = amityvox_db::messages::get_message(&state.db, &message_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    if message.channel_id != channel_id {
        return Err(ApiError::NotFound);
    }
    let computed = channel_perms_cached(&state, &guild, &channel_id, &request.user_id).await?;
    perms::require_permission(
        computed,
        Permissions::VIEW_CHANNEL | Permissions::ADD_REACTIONS,
    )?;

    let (subject, _changed) = if adding {
        (
            subjects::EVENT_MESSAGE_REACTION_ADD,
            amityvox_db::messages::add_reaction(&state.db, &message_id, &request.user_id, &request.emoji)
                .await?,
        )
    } else {
        (
            subjects::EVENT_MESSAGE_REACTION_REMOVE,
            amityvox_db::messages::remove_reaction(
                &state.db,
                &message_id,
                &request.user_id,
                &request.emoji,
            )
            .await?,
        )
    };
    state.bus.dispatch(
        subject,
        json!({
            "guild_id": guild.id,
            "channel_id": channel_id,
            "message_id": message_id,
            "user_id": request.user_id,
            "emoji": request.emoji,
        }),
        Some(guild.id.clone()),
        Some(channel_id.clone()),
        Some(request.user_id.clone()),
    );
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// POST .../typing — ephemeral, bus only.
pub async fn typing(
    State(state): State<AppState>,
    Path((guild_id, channel_id)): Path<(String, String)>,
    parts: Parts,
    body: Bytes,
) -> Result<Response, ApiError> {
    let (envelope, request): (_, ActingUser) = verified_payload(&state, &parts, &body).await?;
    ensure_user_homed_on_sender(&state, &request.user_id, &envelope.sender_id).await?;
    let guild = load_home_guild(&state, &guild_id).await?;
    require_channel(&state, &guild, &channel_id).await?;
    let computed = channel_perms_cached(&state, &guild, &channel_id, &request.user_id).await?;
    perms::require_permission(computed, Permissions::VIEW_CHANNEL)?;

    state.bus.dispatch(
        subjects::EVENT_TYPING_START,
        json!({"guild_id": guild.id, "channel_id": channel_id, "user_id": request.user_id}),
        Some(guild.id.clone()),
        Some(channel_id.clone()),
        Some(request.user_id.clone()),
    );
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn require_channel(
    state: &AppState,
    guild: &GuildRow,
    channel_id: &str,
) -> Result<(), ApiError> {
    let channel = amityvox_db::channels::get_channel(&state.db, channel_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    if channel.guild_id != guild.id {
        return Err(ApiError::NotFound);
    }
    Ok(())
}

/// Computed channel permissions for the read-heavy proxy paths, served
/// from the 5-minute cache when possible. Non-members have no permissions
/// and are never cached.
async fn channel_perms_cached(
    state: &AppState,
    guild: &GuildRow,
    channel_id: &str,
    user_id: &str,
) -> Result<Permissions, ApiError> {
    perms::ensure_guild_member(&state.db, &guild.id, user_id).await?;
    let key = (user_id.to_string(), channel_id.to_string());
    if let Some(cached) = state.permission_cache.get(&key).await {
        return Ok(cached);
    }
    let computed =
        perms::compute_channel_permissions(&state.db, guild, channel_id, user_id).await?;
    state.permission_cache.insert(key, computed).await;
    Ok(computed)
}
