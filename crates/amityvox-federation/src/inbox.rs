use crate::protocol::{self, validate_timestamp, FederatedMessage};
use crate::signing::{self, SignedEnvelope};
use crate::{FederationError, FederationService};
use amityvox_models::presence;
use std::net::IpAddr;

/// Maximum accepted inbox body.
pub const MAX_INBOX_BODY_BYTES: usize = 1_048_576;

impl FederationService {
    /// Shared verification pipeline for every signed ingress endpoint:
    /// negative-sender cache, key lookup, signature over the raw payload
    /// bytes, freshness window, source IP, policy.
    pub async fn verify_inbound_envelope(
        &self,
        raw_body: &[u8],
        source_ip: Option<IpAddr>,
    ) -> Result<SignedEnvelope, FederationError> {
        if raw_body.len() > MAX_INBOX_BODY_BYTES {
            return Err(FederationError::Malformed("body too large".to_string()));
        }
        let envelope = SignedEnvelope::from_json(raw_body)?;
        let sender_id = envelope.sender_id.clone();

        if self.negative_senders.get(&sender_id).is_some() {
            return Err(FederationError::AuthFailure(format!(
                "unknown sender '{sender_id}'"
            )));
        }
        let Some(sender_key) = self.sender_public_key(&sender_id).await? else {
            self.negative_senders.set(sender_id.clone(), ());
            return Err(FederationError::AuthFailure(format!(
                "unknown sender '{sender_id}'"
            )));
        };

        if !signing::verify_signature(&sender_key, envelope.payload_bytes(), &envelope.signature) {
            return Err(FederationError::AuthFailure(
                "invalid envelope signature".to_string(),
            ));
        }
        validate_timestamp(envelope.timestamp)?;
        self.verify_source_ip(&sender_id, source_ip).await?;
        if !self.is_federation_allowed(&sender_id).await? {
            return Err(FederationError::AuthFailure(format!(
                "federation policy denies '{sender_id}'"
            )));
        }
        Ok(envelope)
    }

    /// POST /federation/v1/inbox: verify, persist, redispatch. A 202 means
    /// the envelope cleared verification; per-event DB hiccups are logged
    /// rather than failing the whole envelope.
    pub async fn handle_inbox(
        &self,
        raw_body: &[u8],
        source_ip: Option<IpAddr>,
    ) -> Result<(), FederationError> {
        let envelope = self.verify_inbound_envelope(raw_body, source_ip).await?;
        let sender_id = envelope.sender_id.clone();

        let mut msg: FederatedMessage = envelope.decode_payload()?;
        let subject = protocol::bus_subject_for(&msg.event_type).ok_or_else(|| {
            FederationError::Malformed(format!("unknown event type '{}'", msg.event_type))
        })?;
        if msg.guild_id.is_none() {
            if let Some(guild_id) = msg.data.get("guild_id").and_then(|v| v.as_str()) {
                msg.guild_id = Some(guild_id.to_string());
            }
        }

        self.hlc.update(msg.hlc);

        if let Err(e) = amityvox_db::instances::touch_last_seen(&self.db, &sender_id).await {
            tracing::warn!(sender = %sender_id, "updating last_seen_at failed: {e}");
        }
        if let Err(e) =
            amityvox_db::peers::touch_last_synced(&self.db, &self.local_id, &sender_id).await
        {
            tracing::warn!(sender = %sender_id, "updating last_synced_at failed: {e}");
        }

        // Channel-scoped persistence. An unresolvable channel skips the DB
        // work but the event still reaches the bus and the backfill log.
        let local_channel_id = match msg.channel_id.as_deref() {
            Some(channel_id) => self.resolve_local_channel(&sender_id, channel_id).await?,
            None => None,
        };
        if let Some(channel_id) = local_channel_id.as_deref() {
            if let Err(e) = self.apply_channel_event(&msg, channel_id).await {
                tracing::error!(
                    sender = %sender_id,
                    event_type = %msg.event_type,
                    "channel event persistence failed: {e}"
                );
            }
        }

        if msg.event_type == protocol::PRESENCE_UPDATE {
            self.apply_presence_update(&sender_id, &msg).await;
        }

        self.bus.dispatch_remote(
            subject,
            msg.data.clone(),
            msg.guild_id.clone(),
            local_channel_id.or_else(|| msg.channel_id.clone()),
            msg.data
                .get("user_id")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            &sender_id,
        );

        if protocol::is_guild_authority_event(&msg.event_type) {
            self.apply_guild_event_if_owner(&sender_id, &msg).await;
        }

        let created_at = msg
            .data_created_at()
            .unwrap_or_else(chrono::Utc::now)
            .to_rfc3339();
        if let Err(e) = amityvox_db::federation_events::append_event(
            &self.db,
            &amityvox_util::id::generate(),
            &msg.origin_id,
            &msg.event_type,
            msg.guild_id.as_deref(),
            msg.channel_id.as_deref(),
            msg.hlc.wall_ms,
            msg.hlc.counter as i64,
            &msg.data,
            &created_at,
        )
        .await
        {
            tracing::error!(sender = %sender_id, "federation event append failed: {e}");
        }

        self.counters.record_received(&sender_id);
        Ok(())
    }

    /// Guild-level events only apply when the sending instance is the
    /// guild's home; anything else is logged and ignored.
    pub(crate) async fn apply_guild_event_if_owner(&self, sender_id: &str, msg: &FederatedMessage) {
        let Some(guild_id) = msg.guild_id.as_deref() else {
            tracing::warn!(sender = %sender_id, event_type = %msg.event_type, "guild event without guild_id");
            return;
        };
        let guild = match amityvox_db::guilds::get_guild(&self.db, guild_id).await {
            Ok(guild) => guild,
            Err(e) => {
                tracing::error!(guild_id, "guild lookup failed: {e}");
                return;
            }
        };
        let owned_by_sender = match &guild {
            Some(row) => row.instance_id.as_deref() == Some(sender_id),
            // An unknown guild can only come from its home instance
            // announcing it; accept creation-shaped events.
            None => matches!(
                msg.event_type.as_str(),
                protocol::GUILD_UPDATE | protocol::CHANNEL_CREATE | protocol::GUILD_MEMBER_ADD
            ),
        };
        if !owned_by_sender {
            tracing::warn!(
                sender = %sender_id,
                guild_id,
                event_type = %msg.event_type,
                "rejected guild event from non-owner"
            );
            return;
        }
        if guild.is_none() {
            // Materialize the mirror row before applying into it.
            let name = msg
                .data
                .get("guild_name")
                .or_else(|| msg.data.get("name"))
                .and_then(|v| v.as_str())
                .unwrap_or(guild_id);
            let owner = msg
                .data
                .get("owner_id")
                .and_then(|v| v.as_str())
                .unwrap_or(sender_id);
            if let Err(e) =
                amityvox_db::guilds::create_guild(&self.db, guild_id, name, owner, Some(sender_id))
                    .await
            {
                tracing::error!(guild_id, "creating guild mirror failed: {e}");
                return;
            }
        }
        if let Err(e) = self.apply_guild_event(sender_id, msg).await {
            tracing::error!(
                sender = %sender_id,
                guild_id,
                event_type = %msg.event_type,
                "guild event application failed: {e}"
            );
        }
    }

    /// Presence changes for remote users, restricted to the status
    /// allow-list and to users homed on the sending instance.
    async fn apply_presence_update(&self, sender_id: &str, msg: &FederatedMessage) {
        let Some(user_id) = msg.data.get("user_id").and_then(|v| v.as_str()) else {
            return;
        };
        let Some(status) = msg.data.get("status").and_then(|v| v.as_str()) else {
            return;
        };
        if !presence::is_allowed_status(status) {
            tracing::debug!(user_id, status, "dropping presence with unknown status");
            return;
        }
        match amityvox_db::users::user_instance_id(&self.db, user_id).await {
            Ok(Some(Some(home))) if home == sender_id => {
                if let Err(e) = amityvox_db::users::set_presence(&self.db, user_id, status).await {
                    tracing::warn!(user_id, "presence update failed: {e}");
                }
            }
            Ok(_) => {
                tracing::debug!(user_id, sender = %sender_id, "ignoring presence for foreign user");
            }
            Err(e) => tracing::warn!(user_id, "presence lookup failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hlc::Hlc;
    use crate::testutil::{seed_remote, test_service};
    use ed25519_dalek::SigningKey;

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

    fn signed_message(key: &SigningKey, sender: &str, msg: &FederatedMessage) -> Vec<u8> {
        signing::sign_value(key, sender, msg)
            .expect("sign")
            .to_json()
            .expect("encode")
            .into_bytes()
    }

    fn message_create() -> FederatedMessage {
        FederatedMessage {
            event_type: protocol::MESSAGE_CREATE.to_string(),
            origin_id: "B".to_string(),
            hlc: Hlc::new(1000, 0),
            guild_id: Some("G".to_string()),
            channel_id: Some("C".to_string()),
            data: serde_json::json!({
                "id": "M",
                "author_id": "U@B",
                "content": "hi",
                "created_at": "2024-01-01T00:00:00Z"
            }),
        }
    }

    #[tokio::test]
    async fn accepted_message_persists_everywhere() {
        let service = test_service().await;
        let key = seed_remote(&service, "B", "b.example", 11).await;
        seed_remote_guild(&service).await;
        let mut bus_rx = service.bus().subscribe_system();

        let body = signed_message(&key, "B", &message_create());
        service.handle_inbox(&body, None).await.expect("accept");

        // Message row with the origin's created_at.
        let row = amityvox_db::messages::get_message(service.db(), "M")
            .await
            .expect("query")
            .expect("row");
        assert_eq!(row.created_at, "2024-01-01T00:00:00Z");

        // Backfill log carries the original HLC.
        let events = amityvox_db::federation_events::list_events_since(
            service.db(),
            &["G".to_string()],
            0,
            0,
            10,
        )
        .await
        .expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].hlc_wall_ms, 1000);
        assert_eq!(events[0].hlc_counter, 0);

        // Bus got the event, tagged with its remote origin.
        let event = bus_rx.try_recv().expect("bus event");
        assert_eq!(event.event_type, "MESSAGE_CREATE");
        assert_eq!(event.remote_origin.as_deref(), Some("B"));

        // The local clock now strictly exceeds the remote timestamp.
        assert!(Hlc::before(Hlc::new(1000, 0), service.hlc().peek()));
    }

    #[tokio::test]
    async fn redelivery_is_idempotent() {
        let service = test_service().await;
        let key = seed_remote(&service, "B", "b.example", 11).await;
        seed_remote_guild(&service).await;

        let body = signed_message(&key, "B", &message_create());
        service.handle_inbox(&body, None).await.expect("first");
        service.handle_inbox(&body, None).await.expect("second");

        let message_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(service.db())
            .await
            .expect("count");
        assert_eq!(message_count, 1);
        let event_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM federation_events")
            .fetch_one(service.db())
            .await
            .expect("count");
        assert_eq!(event_count, 1);
    }

    #[tokio::test]
    async fn unknown_sender_lands_in_negative_cache() {
        let service = test_service().await;
        let key = SigningKey::from_bytes(&[42u8; 32]);

        let body = signed_message(&key, "GHOST", &message_create());
        let err = service.handle_inbox(&body, None).await.unwrap_err();
        assert!(matches!(err, FederationError::AuthFailure(_)));
        assert!(service.negative_senders.get(&"GHOST".to_string()).is_some());

        // Second delivery is dropped by the cache before any DB work.
        let err = service.handle_inbox(&body, None).await.unwrap_err();
        assert!(matches!(err, FederationError::AuthFailure(_)));
    }

    #[tokio::test]
    async fn wrong_key_is_rejected() {
        let service = test_service().await;
        seed_remote(&service, "B", "b.example", 11).await;
        seed_remote_guild(&service).await;

        let wrong_key = SigningKey::from_bytes(&[42u8; 32]);
        let body = signed_message(&wrong_key, "B", &message_create());
        let err = service.handle_inbox(&body, None).await.unwrap_err();
        assert!(matches!(err, FederationError::AuthFailure(_)));
        assert!(amityvox_db::messages::get_message(service.db(), "M")
            .await
            .expect("query")
            .is_none());
    }

    #[tokio::test]
    async fn guild_event_from_non_owner_is_ignored() {
        let service = test_service().await;
        let key = seed_remote(&service, "B", "b.example", 11).await;
        // Locally owned guild: no remote instance may mutate it via events.
        amityvox_db::guilds::create_guild(service.db(), "G", "guild", "owner", None)
            .await
            .expect("guild");

        let msg = FederatedMessage {
            event_type: protocol::GUILD_UPDATE.to_string(),
            origin_id: "B".to_string(),
            hlc: Hlc::new(2000, 0),
            guild_id: Some("G".to_string()),
            channel_id: None,
            data: serde_json::json!({"name": "hijacked"}),
        };
        let body = signed_message(&key, "B", &msg);
        service.handle_inbox(&body, None).await.expect("accepted");

        let guild = amityvox_db::guilds::get_guild(service.db(), "G")
            .await
            .expect("query")
            .expect("row");
        assert_eq!(guild.name, "guild");
    }

    #[tokio::test]
    async fn presence_respects_allow_list_and_home_instance() {
        let service = test_service().await;
        let key = seed_remote(&service, "B", "b.example", 11).await;
        amityvox_db::users::ensure_remote_user_stub(service.db(), "U@B", "remote", None, None, "B")
            .await
            .expect("stub");

        let mut msg = FederatedMessage {
            event_type: protocol::PRESENCE_UPDATE.to_string(),
            origin_id: "B".to_string(),
            hlc: Hlc::new(3000, 0),
            guild_id: None,
            channel_id: None,
            data: serde_json::json!({"user_id": "U@B", "status": "idle"}),
        };
        let body = signed_message(&key, "B", &msg);
        service.handle_inbox(&body, None).await.expect("accept");
        let user = amityvox_db::users::get_user(service.db(), "U@B")
            .await
            .expect("query")
            .expect("row");
        assert_eq!(user.presence, "idle");

        // A status outside the allow-list is dropped.
        msg.hlc = Hlc::new(3001, 0);
        msg.data = serde_json::json!({"user_id": "U@B", "status": "hacking"});
        let body = signed_message(&key, "B", &msg);
        service.handle_inbox(&body, None).await.expect("accept");
        let user = amityvox_db::users::get_user(service.db(), "U@B")
            .await
            .expect("query")
            .expect("row");
        assert_eq!(user.presence, "idle");
    }

    #[tokio::test]
    async fn guild_id_backfills_from_data() {
        let service = test_service().await;
        let key = seed_remote(&service, "B", "b.example", 11).await;
        seed_remote_guild(&service).await;

        let mut msg = message_create();
        msg.guild_id = None;
        msg.data["guild_id"] = serde_json::json!("G");
        let body = signed_message(&key, "B", &msg);
        service.handle_inbox(&body, None).await.expect("accept");

        let events = amityvox_db::federation_events::list_events_since(
            service.db(),
            &["G".to_string()],
            0,
            0,
            10,
        )
        .await
        .expect("events");
        assert_eq!(events.len(), 1, "guild_id should be backfilled for the log");
    }

    #[tokio::test]
    async fn stale_timestamp_is_rejected() {
        let service = test_service().await;
        let key = seed_remote(&service, "B", "b.example", 11).await;
        seed_remote_guild(&service).await;

        let mut envelope =
            signing::sign_value(&key, "B", &message_create()).expect("sign");
        envelope.timestamp = chrono::Utc::now() - chrono::Duration::minutes(10);
        let body = envelope.to_json().expect("encode");

        let err = service.handle_inbox(body.as_bytes(), None).await.unwrap_err();
        assert!(matches!(err, FederationError::AuthFailure(_)));
    }
}
