use crate::protocol::{self, FederatedMessage};
use crate::{FederationError, FederationService};
use amityvox_db::{channels, guilds, members, messages, users};
use amityvox_models::channel::CHANNEL_TYPE_CATEGORY;
use serde_json::Value;

fn data_str<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(|v| v.as_str())
}

fn data_i64(data: &Value, key: &str) -> Option<i64> {
    data.get(key).and_then(|v| v.as_i64())
}

fn data_bool(data: &Value, key: &str) -> Option<bool> {
    data.get(key).and_then(|v| v.as_bool())
}

fn require_str<'a>(data: &'a Value, key: &str) -> Result<&'a str, FederationError> {
    data_str(data, key)
        .ok_or_else(|| FederationError::Malformed(format!("event data missing '{key}'")))
}

impl FederationService {
    /// Map a remote channel reference to a local channel: direct id match
    /// first, then the DM mirror table. `None` skips persistence.
    pub(crate) async fn resolve_local_channel(
        &self,
        sender_id: &str,
        channel_id: &str,
    ) -> Result<Option<String>, FederationError> {
        if channels::get_channel(&self.db, channel_id).await?.is_some() {
            return Ok(Some(channel_id.to_string()));
        }
        Ok(amityvox_db::channel_peers::resolve_channel_mirror(&self.db, sender_id, channel_id)
            .await?)
    }

    /// Channel-scoped persistence for one inbound event. Everything is
    /// idempotent on primary keys so redelivery is safe.
    pub(crate) async fn apply_channel_event(
        &self,
        msg: &FederatedMessage,
        local_channel_id: &str,
    ) -> Result<(), FederationError> {
        match msg.event_type.as_str() {
            protocol::MESSAGE_CREATE => {
                let id = require_str(&msg.data, "id")?;
                let author_id = require_str(&msg.data, "author_id")?;
                let content = data_str(&msg.data, "content").unwrap_or_default();
                let created_at = data_str(&msg.data, "created_at")
                    .map(str::to_string)
                    .unwrap_or_else(|| chrono::Utc::now().to_rfc3339());
                messages::insert_message(
                    &self.db,
                    id,
                    local_channel_id,
                    author_id,
                    content,
                    &created_at,
                )
                .await?;
            }
            protocol::MESSAGE_UPDATE => {
                let id = require_str(&msg.data, "id")?;
                let content = data_str(&msg.data, "content").unwrap_or_default();
                messages::update_message_content(&self.db, id, local_channel_id, content).await?;
            }
            protocol::MESSAGE_DELETE => {
                let id = require_str(&msg.data, "id")?;
                messages::delete_message(&self.db, id, local_channel_id).await?;
            }
            protocol::REACTION_ADD => {
                let message_id = require_str(&msg.data, "message_id")?;
                let user_id = require_str(&msg.data, "user_id")?;
                let emoji = require_str(&msg.data, "emoji")?;
                messages::add_reaction(&self.db, message_id, user_id, emoji).await?;
            }
            protocol::REACTION_REMOVE => {
                let message_id = require_str(&msg.data, "message_id")?;
                let user_id = require_str(&msg.data, "user_id")?;
                let emoji = require_str(&msg.data, "emoji")?;
                messages::remove_reaction(&self.db, message_id, user_id, emoji).await?;
            }
            // Ephemeral: bus only, no rows.
            protocol::TYPING_START | protocol::CHANNEL_PINS_UPDATE => {}
            _ => {}
        }
        Ok(())
    }

    /// Guild-level application, called only after the inbox has verified
    /// that the sending instance owns the guild.
    pub(crate) async fn apply_guild_event(
        &self,
        sender_id: &str,
        msg: &FederatedMessage,
    ) -> Result<(), FederationError> {
        let guild_id = msg
            .guild_id
            .as_deref()
            .ok_or_else(|| FederationError::Malformed("guild event without guild_id".to_string()))?;

        match msg.event_type.as_str() {
            protocol::GUILD_UPDATE => {
                guilds::update_guild_fields(
                    &self.db,
                    guild_id,
                    data_str(&msg.data, "name"),
                    data_str(&msg.data, "description"),
                    data_bool(&msg.data, "discoverable"),
                    data_i64(&msg.data, "default_permissions"),
                )
                .await?;
            }
            protocol::GUILD_DELETE => {
                guilds::delete_guild(&self.db, guild_id).await?;
            }
            protocol::CHANNEL_CREATE | protocol::CHANNEL_UPDATE => {
                let id = require_str(&msg.data, "id")?;
                let name = require_str(&msg.data, "name")?;
                let channel_type = data_i64(&msg.data, "channel_type").unwrap_or(0);
                let position = data_i64(&msg.data, "position").unwrap_or(0);
                if channel_type == CHANNEL_TYPE_CATEGORY as i64 {
                    channels::upsert_category(&self.db, id, guild_id, name, position).await?;
                } else {
                    channels::upsert_channel(
                        &self.db,
                        id,
                        guild_id,
                        name,
                        data_str(&msg.data, "topic"),
                        channel_type,
                        data_str(&msg.data, "category_id"),
                        position,
                        data_bool(&msg.data, "private").unwrap_or(false),
                    )
                    .await?;
                }
            }
            protocol::CHANNEL_DELETE => {
                let id = require_str(&msg.data, "id")?;
                let channel_type = data_i64(&msg.data, "channel_type").unwrap_or(0);
                if channel_type == CHANNEL_TYPE_CATEGORY as i64 {
                    channels::delete_category(&self.db, id).await?;
                } else {
                    channels::delete_channel(&self.db, id).await?;
                }
            }
            protocol::GUILD_MEMBER_ADD => {
                let user_id = require_str(&msg.data, "user_id")?;
                let username = data_str(&msg.data, "username").unwrap_or(user_id);
                users::ensure_remote_user_stub(
                    &self.db,
                    user_id,
                    username,
                    data_str(&msg.data, "display_name"),
                    data_str(&msg.data, "avatar_id"),
                    sender_id,
                )
                .await?;
                if members::add_member(&self.db, guild_id, user_id).await? {
                    guilds::adjust_member_count(&self.db, guild_id, 1).await?;
                }
            }
            protocol::GUILD_MEMBER_REMOVE => {
                let user_id = require_str(&msg.data, "user_id")?;
                if members::remove_member(&self.db, guild_id, user_id).await? {
                    guilds::adjust_member_count(&self.db, guild_id, -1).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hlc::Hlc;
    use crate::testutil::test_service;

    fn message(event_type: &str, guild_id: Option<&str>, data: Value) -> FederatedMessage {
        FederatedMessage {
            event_type: event_type.to_string(),
            origin_id: "B".to_string(),
            hlc: Hlc::new(1000, 0),
            guild_id: guild_id.map(str::to_string),
            channel_id: Some("C".to_string()),
            data,
        }
    }

    async fn seed_remote_guild(service: &crate::FederationService) {
        amityvox_db::guilds::create_guild(service.db(), "G", "guild", "owner@B", Some("B"))
            .await
            .expect("guild");
        amityvox_db::channels::upsert_channel(
            service.db(),
            "C",
            "G",
            "general",
            None,
            0,
            None,
            0,
            false,
        )
        .await
        .expect("channel");
    }

    #[tokio::test]
    async fn message_create_applies_once() {
        let service = test_service().await;
        seed_remote_guild(&service).await;

        let msg = message(
            protocol::MESSAGE_CREATE,
            Some("G"),
            serde_json::json!({
                "id": "M",
                "author_id": "U@B",
                "content": "hi",
                "created_at": "2024-01-01T00:00:00Z"
            }),
        );
        service
            .apply_channel_event(&msg, "C")
            .await
            .expect("first apply");
        service
            .apply_channel_event(&msg, "C")
            .await
            .expect("second apply");

        let row = amityvox_db::messages::get_message(service.db(), "M")
            .await
            .expect("query")
            .expect("row");
        assert_eq!(row.content, "hi");
        assert_eq!(row.created_at, "2024-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn channel_routing_splits_categories() {
        let service = test_service().await;
        seed_remote_guild(&service).await;

        let category = message(
            protocol::CHANNEL_CREATE,
            Some("G"),
            serde_json::json!({"id": "CAT", "name": "Topics", "channel_type": 4, "position": 1}),
        );
        service
            .apply_guild_event("B", &category)
            .await
            .expect("category");

        let channel = message(
            protocol::CHANNEL_CREATE,
            Some("G"),
            serde_json::json!({"id": "C2", "name": "random", "channel_type": 0, "category_id": "CAT"}),
        );
        service.apply_guild_event("B", &channel).await.expect("channel");

        let cat_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM categories")
            .fetch_one(service.db())
            .await
            .expect("count");
        assert_eq!(cat_count, 1);
        assert!(amityvox_db::channels::get_channel(service.db(), "C2")
            .await
            .expect("query")
            .is_some());
    }

    #[tokio::test]
    async fn member_add_creates_stub_and_counts_once() {
        let service = test_service().await;
        seed_remote_guild(&service).await;

        let msg = message(
            protocol::GUILD_MEMBER_ADD,
            Some("G"),
            serde_json::json!({"user_id": "U@B", "username": "remote_user"}),
        );
        service.apply_guild_event("B", &msg).await.expect("first");
        service.apply_guild_event("B", &msg).await.expect("second");

        let user = amityvox_db::users::get_user(service.db(), "U@B")
            .await
            .expect("query")
            .expect("stub");
        assert_eq!(user.instance_id.as_deref(), Some("B"));

        let guild = amityvox_db::guilds::get_guild(service.db(), "G")
            .await
            .expect("query")
            .expect("row");
        assert_eq!(guild.member_count, 1);
    }

    #[tokio::test]
    async fn mirror_resolution_falls_back_then_skips() {
        let service = test_service().await;
        seed_remote_guild(&service).await;
        amityvox_db::channel_peers::upsert_channel_mirror(service.db(), "B", "REMOTE_C", "C")
            .await
            .expect("mirror");

        assert_eq!(
            service
                .resolve_local_channel("B", "C")
                .await
                .expect("direct")
                .as_deref(),
            Some("C")
        );
        assert_eq!(
            service
                .resolve_local_channel("B", "REMOTE_C")
                .await
                .expect("mirrored")
                .as_deref(),
            Some("C")
        );
        assert!(service
            .resolve_local_channel("B", "UNKNOWN")
            .await
            .expect("missing")
            .is_none());
    }
}
