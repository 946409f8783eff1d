use crate::protocol::ManageRequest;
use crate::{FederationError, FederationService};
use amityvox_core::permissions as perms;
use amityvox_db::guilds::GuildRow;
use amityvox_db::{row_lock_clause, DatabaseEngine};
use amityvox_models::gateway as subjects;
use amityvox_models::permissions::Permissions;
use serde_json::{json, Value};
use sqlx::Row;
use std::net::IpAddr;

fn data_str<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(|v| v.as_str())
}

fn require_str<'a>(data: &'a Value, key: &str) -> Result<&'a str, FederationError> {
    data_str(data, key)
        .ok_or_else(|| FederationError::Malformed(format!("manage data missing '{key}'")))
}

/// Result of a manage dispatch; the action is echoed so the HTTP layer can
/// pick the right success status.
#[derive(Debug)]
pub struct ManageOutcome {
    pub action: String,
    pub data: Option<Value>,
}

impl FederationService {
    /// POST /federation/v1/guilds/{guild_id}/manage: a signed mutation by a
    /// remote user on a guild this instance is the home of.
    pub async fn handle_manage(
        &self,
        guild_id: &str,
        raw_body: &[u8],
        source_ip: Option<IpAddr>,
    ) -> Result<ManageOutcome, FederationError> {
        let envelope = self.verify_inbound_envelope(raw_body, source_ip).await?;
        let sender_id = envelope.sender_id.clone();
        let request: ManageRequest = envelope.decode_payload()?;

        let guild = amityvox_db::guilds::get_guild(&self.db, guild_id)
            .await?
            .ok_or_else(|| FederationError::NotFound(format!("guild '{guild_id}'")))?;
        if !guild.is_locally_owned() {
            return Err(FederationError::AuthFailure(format!(
                "guild '{guild_id}' is not homed here"
            )));
        }

        // Anti-spoof: the acting user must be homed on the sending instance.
        // member_join is the one exception; the stub may not exist yet.
        if request.action != "member_join" {
            match amityvox_db::users::user_instance_id(&self.db, &request.user_id).await? {
                Some(Some(home)) if home == sender_id => {}
                _ => {
                    return Err(FederationError::AuthFailure(format!(
                        "user '{}' is not homed on '{sender_id}'",
                        request.user_id
                    )));
                }
            }
        }

        tracing::debug!(
            guild_id,
            action = %request.action,
            user_id = %request.user_id,
            sender = %sender_id,
            "manage rpc"
        );

        let data = match request.action.as_str() {
            "guild_update" => self.manage_guild_update(&guild, &request).await?,
            "guild_delete" => self.manage_guild_delete(&guild, &request).await?,
            "channel_create" | "channel_update" => {
                self.manage_channel_upsert(&guild, &request).await?
            }
            "channel_delete" => self.manage_channel_delete(&guild, &request).await?,
            "category_create" | "category_update" => {
                self.manage_category_upsert(&guild, &request).await?
            }
            "category_delete" => self.manage_category_delete(&guild, &request).await?,
            "role_create" | "role_update" => self.manage_role_upsert(&guild, &request).await?,
            "role_delete" => self.manage_role_delete(&guild, &request).await?,
            "member_update" => self.manage_member_update(&guild, &request).await?,
            "member_remove" => self.manage_member_remove(&guild, &request).await?,
            "member_ban" => self.manage_member_ban(&guild, &request).await?,
            "member_unban" => self.manage_member_unban(&guild, &request).await?,
            "member_role_remove" => self.manage_member_role_remove(&guild, &request).await?,
            "message_delete" => self.manage_message_delete(&guild, &request).await?,
            "message_pin" => self.manage_message_pin(&guild, &request, true).await?,
            "message_unpin" => self.manage_message_pin(&guild, &request, false).await?,
            "member_join" => self.manage_member_join(&guild, &sender_id, &request).await?,
            other => {
                return Err(FederationError::Malformed(format!(
                    "unknown manage action '{other}'"
                )))
            }
        };
        Ok(ManageOutcome {
            action: request.action,
            data,
        })
    }

    /// Invite redemption on behalf of a remote user, shared by the manage
    /// RPC and the invite-accept endpoint.
    pub async fn remote_invite_join(
        &self,
        guild_id: &str,
        sender_id: &str,
        user_id: &str,
        data: &Value,
    ) -> Result<Option<Value>, FederationError> {
        let guild = amityvox_db::guilds::get_guild(&self.db, guild_id)
            .await?
            .ok_or_else(|| FederationError::NotFound(format!("guild '{guild_id}'")))?;
        if !guild.is_locally_owned() {
            return Err(FederationError::AuthFailure(format!(
                "guild '{guild_id}' is not homed here"
            )));
        }
        let request = ManageRequest {
            action: "member_join".to_string(),
            user_id: user_id.to_string(),
            data: data.clone(),
        };
        self.manage_member_join(&guild, sender_id, &request).await
    }

    async fn require_guild_permission(
        &self,
        guild: &GuildRow,
        user_id: &str,
        required: Permissions,
    ) -> Result<(), FederationError> {
        perms::ensure_guild_member(&self.db, &guild.id, user_id).await?;
        let computed = perms::compute_member_permissions(&self.db, guild, user_id).await?;
        perms::require_permission(computed, required)?;
        Ok(())
    }

    async fn require_channel_permission(
        &self,
        guild: &GuildRow,
        channel_id: &str,
        user_id: &str,
        required: Permissions,
    ) -> Result<(), FederationError> {
        perms::ensure_guild_member(&self.db, &guild.id, user_id).await?;
        let computed =
            perms::compute_channel_permissions(&self.db, guild, channel_id, user_id).await?;
        perms::require_permission(computed, required)?;
        Ok(())
    }

    async fn manage_guild_update(
        &self,
        guild: &GuildRow,
        request: &ManageRequest,
    ) -> Result<Option<Value>, FederationError> {
        self.require_guild_permission(guild, &request.user_id, Permissions::MANAGE_GUILD)
            .await?;
        amityvox_db::guilds::update_guild_fields(
            &self.db,
            &guild.id,
            data_str(&request.data, "name"),
            data_str(&request.data, "description"),
            request.data.get("discoverable").and_then(|v| v.as_bool()),
            request.data.get("default_permissions").and_then(|v| v.as_i64()),
        )
        .await?;
        self.bus.dispatch(
            subjects::EVENT_GUILD_UPDATE,
            request.data.clone(),
            Some(guild.id.clone()),
            None,
            Some(request.user_id.clone()),
        );
        Ok(None)
    }

    async fn manage_guild_delete(
        &self,
        guild: &GuildRow,
        request: &ManageRequest,
    ) -> Result<Option<Value>, FederationError> {
        if request.user_id != guild.owner_id {
            return Err(FederationError::AuthFailure(
                "only the owner may delete a guild".to_string(),
            ));
        }
        amityvox_db::guilds::delete_guild(&self.db, &guild.id).await?;
        self.bus.dispatch(
            subjects::EVENT_GUILD_DELETE,
            json!({"guild_id": guild.id}),
            Some(guild.id.clone()),
            None,
            Some(request.user_id.clone()),
        );
        Ok(None)
    }

    async fn manage_channel_upsert(
        &self,
        guild: &GuildRow,
        request: &ManageRequest,
    ) -> Result<Option<Value>, FederationError> {
        self.require_guild_permission(guild, &request.user_id, Permissions::MANAGE_CHANNELS)
            .await?;
        let creating = request.action == "channel_create";
        let id = if creating {
            amityvox_util::id::generate()
        } else {
            require_str(&request.data, "id")?.to_string()
        };
        if !creating {
            let existing = amityvox_db::channels::get_channel(&self.db, &id)
                .await?
                .ok_or_else(|| FederationError::NotFound(format!("channel '{id}'")))?;
            if existing.guild_id != guild.id {
                return Err(FederationError::NotFound(format!("channel '{id}'")));
            }
        }
        let name = require_str(&request.data, "name")?;
        amityvox_db::channels::upsert_channel(
            &self.db,
            &id,
            &guild.id,
            name,
            data_str(&request.data, "topic"),
            request.data.get("channel_type").and_then(|v| v.as_i64()).unwrap_or(0),
            data_str(&request.data, "category_id"),
            request.data.get("position").and_then(|v| v.as_i64()).unwrap_or(0),
            request.data.get("private").and_then(|v| v.as_bool()).unwrap_or(false),
        )
        .await?;

        let mut payload = request.data.clone();
        payload["id"] = json!(id);
        payload["guild_id"] = json!(guild.id);
        let subject = if creating {
            subjects::EVENT_CHANNEL_CREATE
        } else {
            subjects::EVENT_CHANNEL_UPDATE
        };
        self.bus.dispatch(
            subject,
            payload.clone(),
            Some(guild.id.clone()),
            Some(id),
            Some(request.user_id.clone()),
        );
        Ok(Some(payload))
    }

    async fn manage_channel_delete(
        &self,
        guild: &GuildRow,
        request: &ManageRequest,
    ) -> Result<Option<Value>, FederationError> {
        self.require_guild_permission(guild, &request.user_id, Permissions::MANAGE_CHANNELS)
            .await?;
        let id = require_str(&request.data, "id")?;
        let channel = amityvox_db::channels::get_channel(&self.db, id)
            .await?
            .ok_or_else(|| FederationError::NotFound(format!("channel '{id}'")))?;
        if channel.guild_id != guild.id {
            return Err(FederationError::NotFound(format!("channel '{id}'")));
        }
        amityvox_db::channels::delete_channel(&self.db, id).await?;
        self.bus.dispatch(
            subjects::EVENT_CHANNEL_DELETE,
            json!({"id": id, "guild_id": guild.id}),
            Some(guild.id.clone()),
            Some(id.to_string()),
            Some(request.user_id.clone()),
        );
        Ok(None)
    }

    async fn manage_category_upsert(
        &self,
        guild: &GuildRow,
        request: &ManageRequest,
    ) -> Result<Option<Value>, FederationError> {
        self.require_guild_permission(guild, &request.user_id, Permissions::MANAGE_CHANNELS)
            .await?;
        let creating = request.action == "category_create";
        let id = if creating {
            amityvox_util::id::generate()
        } else {
            require_str(&request.data, "id")?.to_string()
        };
        let name = require_str(&request.data, "name")?;
        let position = request.data.get("position").and_then(|v| v.as_i64()).unwrap_or(0);
        amityvox_db::channels::upsert_category(&self.db, &id, &guild.id, name, position).await?;

        let mut payload = request.data.clone();
        payload["id"] = json!(id);
        payload["guild_id"] = json!(guild.id);
        payload["channel_type"] = json!(amityvox_models::channel::CHANNEL_TYPE_CATEGORY);
        let subject = if creating {
            subjects::EVENT_CHANNEL_CREATE
        } else {
            subjects::EVENT_CHANNEL_UPDATE
        };
        self.bus.dispatch(
            subject,
            payload.clone(),
            Some(guild.id.clone()),
            None,
            Some(request.user_id.clone()),
        );
        Ok(Some(payload))
    }

    async fn manage_category_delete(
        &self,
        guild: &GuildRow,
        request: &ManageRequest,
    ) -> Result<Option<Value>, FederationError> {
        self.require_guild_permission(guild, &request.user_id, Permissions::MANAGE_CHANNELS)
            .await?;
        let id = require_str(&request.data, "id")?;
        if !amityvox_db::channels::delete_category(&self.db, id).await? {
            return Err(FederationError::NotFound(format!("category '{id}'")));
        }
        self.bus.dispatch(
            subjects::EVENT_CHANNEL_DELETE,
            json!({"id": id, "guild_id": guild.id, "channel_type": amityvox_models::channel::CHANNEL_TYPE_CATEGORY}),
            Some(guild.id.clone()),
            None,
            Some(request.user_id.clone()),
        );
        Ok(None)
    }

    async fn manage_role_upsert(
        &self,
        guild: &GuildRow,
        request: &ManageRequest,
    ) -> Result<Option<Value>, FederationError> {
        self.require_guild_permission(guild, &request.user_id, Permissions::MANAGE_ROLES)
            .await?;
        let creating = request.action == "role_create";
        let id = if creating {
            amityvox_util::id::generate()
        } else {
            require_str(&request.data, "id")?.to_string()
        };
        let name = require_str(&request.data, "name")?;
        amityvox_db::roles::upsert_role(
            &self.db,
            &id,
            &guild.id,
            name,
            request.data.get("position").and_then(|v| v.as_i64()).unwrap_or(0),
            request.data.get("allow_permissions").and_then(|v| v.as_i64()).unwrap_or(0),
            request.data.get("deny_permissions").and_then(|v| v.as_i64()).unwrap_or(0),
        )
        .await?;

        let mut payload = request.data.clone();
        payload["id"] = json!(id);
        payload["guild_id"] = json!(guild.id);
        let subject = if creating {
            subjects::EVENT_GUILD_ROLE_CREATE
        } else {
            subjects::EVENT_GUILD_ROLE_UPDATE
        };
        self.bus.dispatch(
            subject,
            payload.clone(),
            Some(guild.id.clone()),
            None,
            Some(request.user_id.clone()),
        );
        Ok(Some(payload))
    }

    async fn manage_role_delete(
        &self,
        guild: &GuildRow,
        request: &ManageRequest,
    ) -> Result<Option<Value>, FederationError> {
        self.require_guild_permission(guild, &request.user_id, Permissions::MANAGE_ROLES)
            .await?;
        let id = require_str(&request.data, "id")?;
        let role = amityvox_db::roles::get_role(&self.db, id)
            .await?
            .ok_or_else(|| FederationError::NotFound(format!("role '{id}'")))?;
        if role.guild_id != guild.id {
            return Err(FederationError::NotFound(format!("role '{id}'")));
        }
        amityvox_db::roles::delete_role(&self.db, id).await?;
        self.bus.dispatch(
            subjects::EVENT_GUILD_ROLE_DELETE,
            json!({"id": id, "guild_id": guild.id}),
            Some(guild.id.clone()),
            None,
            Some(request.user_id.clone()),
        );
        Ok(None)
    }

    async fn manage_member_update(
        &self,
        guild: &GuildRow,
        request: &ManageRequest,
    ) -> Result<Option<Value>, FederationError> {
        let target = require_str(&request.data, "target_user_id")?;
        // Changing your own nickname needs no moderation bit.
        if target != request.user_id {
            self.require_guild_permission(guild, &request.user_id, Permissions::MANAGE_NICKNAMES)
                .await?;
        } else {
            perms::ensure_guild_member(&self.db, &guild.id, &request.user_id).await?;
        }
        let nickname = data_str(&request.data, "nickname");
        if !amityvox_db::members::set_nickname(&self.db, &guild.id, target, nickname).await? {
            return Err(FederationError::NotFound(format!("member '{target}'")));
        }
        self.bus.dispatch(
            subjects::EVENT_GUILD_MEMBER_UPDATE,
            json!({"guild_id": guild.id, "user_id": target, "nickname": nickname}),
            Some(guild.id.clone()),
            None,
            Some(target.to_string()),
        );
        Ok(None)
    }

    async fn manage_member_remove(
        &self,
        guild: &GuildRow,
        request: &ManageRequest,
    ) -> Result<Option<Value>, FederationError> {
        let target = require_str(&request.data, "target_user_id")?;
        // Leaving is always allowed; kicking someone else is not.
        if target != request.user_id {
            self.require_guild_permission(guild, &request.user_id, Permissions::KICK_MEMBERS)
                .await?;
        }
        if target == guild.owner_id {
            return Err(FederationError::AuthFailure(
                "the owner cannot be removed".to_string(),
            ));
        }
        if !amityvox_db::members::remove_member(&self.db, &guild.id, target).await? {
            return Err(FederationError::NotFound(format!("member '{target}'")));
        }
        amityvox_db::guilds::adjust_member_count(&self.db, &guild.id, -1).await?;
        self.prune_channel_peers_for(&guild.id, target).await;
        self.bus.dispatch(
            subjects::EVENT_GUILD_MEMBER_REMOVE,
            json!({"guild_id": guild.id, "user_id": target}),
            Some(guild.id.clone()),
            None,
            Some(target.to_string()),
        );
        Ok(None)
    }

    async fn manage_member_ban(
        &self,
        guild: &GuildRow,
        request: &ManageRequest,
    ) -> Result<Option<Value>, FederationError> {
        self.require_guild_permission(guild, &request.user_id, Permissions::BAN_MEMBERS)
            .await?;
        let target = require_str(&request.data, "target_user_id")?;
        if target == guild.owner_id {
            return Err(FederationError::AuthFailure(
                "the owner cannot be banned".to_string(),
            ));
        }
        amityvox_db::bans::add_ban(
            &self.db,
            &guild.id,
            target,
            data_str(&request.data, "reason"),
        )
        .await?;
        if amityvox_db::members::remove_member(&self.db, &guild.id, target).await? {
            amityvox_db::guilds::adjust_member_count(&self.db, &guild.id, -1).await?;
            self.prune_channel_peers_for(&guild.id, target).await;
        }
        self.bus.dispatch(
            subjects::EVENT_GUILD_BAN_ADD,
            json!({"guild_id": guild.id, "user_id": target}),
            Some(guild.id.clone()),
            None,
            Some(target.to_string()),
        );
        self.bus.dispatch(
            subjects::EVENT_GUILD_MEMBER_REMOVE,
            json!({"guild_id": guild.id, "user_id": target}),
            Some(guild.id.clone()),
            None,
            Some(target.to_string()),
        );
        Ok(None)
    }

    async fn manage_member_unban(
        &self,
        guild: &GuildRow,
        request: &ManageRequest,
    ) -> Result<Option<Value>, FederationError> {
        self.require_guild_permission(guild, &request.user_id, Permissions::BAN_MEMBERS)
            .await?;
        let target = require_str(&request.data, "target_user_id")?;
        if !amityvox_db::bans::remove_ban(&self.db, &guild.id, target).await? {
            return Err(FederationError::NotFound(format!("ban for '{target}'")));
        }
        self.bus.dispatch(
            subjects::EVENT_GUILD_BAN_REMOVE,
            json!({"guild_id": guild.id, "user_id": target}),
            Some(guild.id.clone()),
            None,
            Some(target.to_string()),
        );
        Ok(None)
    }

    async fn manage_member_role_remove(
        &self,
        guild: &GuildRow,
        request: &ManageRequest,
    ) -> Result<Option<Value>, FederationError> {
        self.require_guild_permission(guild, &request.user_id, Permissions::MANAGE_ROLES)
            .await?;
        let target = require_str(&request.data, "target_user_id")?;
        let role_id = require_str(&request.data, "role_id")?;
        if !amityvox_db::members::remove_member_role(&self.db, &guild.id, target, role_id).await? {
            return Err(FederationError::NotFound(format!(
                "role '{role_id}' on member '{target}'"
            )));
        }
        self.bus.dispatch(
            subjects::EVENT_GUILD_MEMBER_UPDATE,
            json!({"guild_id": guild.id, "user_id": target, "removed_role_id": role_id}),
            Some(guild.id.clone()),
            None,
            Some(target.to_string()),
        );
        Ok(None)
    }

    async fn manage_message_delete(
        &self,
        guild: &GuildRow,
        request: &ManageRequest,
    ) -> Result<Option<Value>, FederationError> {
        let channel_id = require_str(&request.data, "channel_id")?;
        let message_id = require_str(&request.data, "message_id")?;
        let message = amityvox_db::messages::get_message(&self.db, message_id)
            .await?
            .ok_or_else(|| FederationError::NotFound(format!("message '{message_id}'")))?;
        if message.channel_id != channel_id {
            return Err(FederationError::NotFound(format!("message '{message_id}'")));
        }
        // Authors may delete their own messages without the moderation bit.
        if message.author_id != request.user_id {
            self.require_channel_permission(
                guild,
                channel_id,
                &request.user_id,
                Permissions::MANAGE_MESSAGES,
            )
            .await?;
        }
        amityvox_db::messages::delete_message(&self.db, message_id, channel_id).await?;
        self.bus.dispatch(
            subjects::EVENT_MESSAGE_DELETE,
            json!({"id": message_id, "channel_id": channel_id, "guild_id": guild.id}),
            Some(guild.id.clone()),
            Some(channel_id.to_string()),
            Some(request.user_id.clone()),
        );
        Ok(None)
    }

    async fn manage_message_pin(
        &self,
        guild: &GuildRow,
        request: &ManageRequest,
        pinned: bool,
    ) -> Result<Option<Value>, FederationError> {
        let channel_id = require_str(&request.data, "channel_id")?;
        let message_id = require_str(&request.data, "message_id")?;
        self.require_channel_permission(
            guild,
            channel_id,
            &request.user_id,
            Permissions::MANAGE_MESSAGES,
        )
        .await?;
        if !amityvox_db::messages::set_message_pinned(&self.db, message_id, channel_id, pinned)
            .await?
        {
            return Err(FederationError::NotFound(format!("message '{message_id}'")));
        }
        self.bus.dispatch(
            subjects::EVENT_CHANNEL_PINS_UPDATE,
            json!({"channel_id": channel_id, "guild_id": guild.id, "message_id": message_id, "pinned": pinned}),
            Some(guild.id.clone()),
            Some(channel_id.to_string()),
            Some(request.user_id.clone()),
        );
        Ok(None)
    }

    /// Invite redemption. The invite and guild rows are locked inside one
    /// serializable transaction so two racing joins cannot both consume the
    /// final use. The ban check runs before the transaction.
    async fn manage_member_join(
        &self,
        guild: &GuildRow,
        sender_id: &str,
        request: &ManageRequest,
    ) -> Result<Option<Value>, FederationError> {
        let code = require_str(&request.data, "code")?;
        let user_id = request.user_id.as_str();

        if amityvox_db::bans::is_banned(&self.db, &guild.id, user_id).await? {
            return Err(FederationError::AuthFailure(format!(
                "user '{user_id}' is banned from '{}'",
                guild.id
            )));
        }

        let lock = row_lock_clause();
        let mut tx = self.db.begin().await?;
        if amityvox_db::active_database_engine() == DatabaseEngine::Postgres {
            sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                .execute(&mut *tx)
                .await?;
        }

        let invite = sqlx::query(&format!(
            "SELECT guild_id, max_uses, uses, expires_at FROM invites WHERE code = $1{lock}"
        ))
        .bind(code)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(invite) = invite else {
            return Err(FederationError::NotFound(format!("invite '{code}'")));
        };
        let invite_guild: String = invite.try_get("guild_id")?;
        if invite_guild != guild.id {
            return Err(FederationError::NotFound(format!("invite '{code}'")));
        }
        let max_uses: i64 = invite.try_get("max_uses")?;
        let uses: i64 = invite.try_get("uses")?;
        let expires_at: Option<String> = invite.try_get("expires_at")?;
        if let Some(raw) = expires_at.as_deref() {
            if let Ok(expiry) = chrono::DateTime::parse_from_rfc3339(raw) {
                if expiry <= chrono::Utc::now() {
                    return Err(FederationError::Gone(format!("invite '{code}' expired")));
                }
            }
        }
        if max_uses > 0 && uses >= max_uses {
            return Err(FederationError::Gone(format!("invite '{code}' exhausted")));
        }

        let guild_row = sqlx::query(&format!(
            "SELECT member_count, max_members FROM guilds WHERE id = $1{lock}"
        ))
        .bind(&guild.id)
        .fetch_one(&mut *tx)
        .await?;
        let member_count: i64 = guild_row.try_get("member_count")?;
        let max_members: i64 = guild_row.try_get("max_members")?;
        if member_count >= max_members {
            return Err(FederationError::Conflict(format!(
                "guild '{}' is full",
                guild.id
            )));
        }

        // The stub only needs the right home instance; profile fields are
        // filled in when richer data arrives.
        let username = data_str(&request.data, "username").unwrap_or(user_id);
        sqlx::query(
            "INSERT INTO users (id, username, display_name, avatar_id, instance_id, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(user_id)
        .bind(username)
        .bind(data_str(&request.data, "display_name"))
        .bind(data_str(&request.data, "avatar_id"))
        .bind(sender_id)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        let inserted = sqlx::query(
            "INSERT INTO guild_members (guild_id, user_id, joined_at) VALUES ($1, $2, $3)
             ON CONFLICT (guild_id, user_id) DO NOTHING",
        )
        .bind(&guild.id)
        .bind(user_id)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if inserted == 0 {
            return Err(FederationError::Conflict(format!(
                "user '{user_id}' is already a member"
            )));
        }

        sqlx::query("UPDATE invites SET uses = uses + 1 WHERE code = $1")
            .bind(code)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE guilds SET member_count = member_count + 1 WHERE id = $1")
            .bind(&guild.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        // The joining instance now receives events for the guild's public
        // channels.
        self.register_guild_channel_peers(&guild.id, sender_id).await;

        self.bus.dispatch(
            subjects::EVENT_GUILD_MEMBER_ADD,
            json!({
                "guild_id": guild.id,
                "user_id": user_id,
                "username": username,
            }),
            Some(guild.id.clone()),
            None,
            Some(user_id.to_string()),
        );

        Ok(Some(json!({
            "guild_id": guild.id,
            "user_id": user_id,
            "member_count": member_count + 1,
        })))
    }

    /// Register an instance as a channel peer for every public channel of a
    /// guild it just gained a member in.
    pub async fn register_guild_channel_peers(&self, guild_id: &str, instance_id: &str) {
        match amityvox_db::channels::list_public_guild_channels(&self.db, guild_id).await {
            Ok(channels) => {
                for channel in channels {
                    if let Err(e) = amityvox_db::channel_peers::add_channel_peer(
                        &self.db,
                        &channel.id,
                        instance_id,
                    )
                    .await
                    {
                        tracing::warn!(channel_id = %channel.id, "channel peer registration failed: {e}");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(guild_id, "listing channels for peer registration failed: {e}")
            }
        }
    }

    /// Drop the instance's channel-peer rows for a guild once its last
    /// member from that instance leaves.
    pub async fn prune_channel_peers_for(&self, guild_id: &str, user_id: &str) {
        let home = match amityvox_db::users::user_instance_id(&self.db, user_id).await {
            Ok(Some(Some(instance_id))) => instance_id,
            _ => return,
        };
        match amityvox_db::members::instance_member_count(&self.db, guild_id, &home).await {
            Ok(0) => {
                if let Err(e) =
                    amityvox_db::channel_peers::remove_guild_peer(&self.db, guild_id, &home).await
                {
                    tracing::warn!(guild_id, instance_id = %home, "channel peer prune failed: {e}");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(guild_id, "channel peer prune count failed: {e}"),
        }
    }
}
