use crate::protocol::{self, FederatedMessage};
use crate::{FederationError, FederationService};
use amityvox_db::peers::ActivePeerRow;
use amityvox_models::gateway::ServerEvent;
use std::sync::Arc;

/// Bus subjects the router listens on, with their wire event types.
/// Reaction subjects map back onto the compact wire names.
fn wire_type_for(subject: &str) -> Option<&'static str> {
    match subject {
        "MESSAGE_CREATE" => Some(protocol::MESSAGE_CREATE),
        "MESSAGE_UPDATE" => Some(protocol::MESSAGE_UPDATE),
        "MESSAGE_DELETE" => Some(protocol::MESSAGE_DELETE),
        "MESSAGE_REACTION_ADD" => Some(protocol::REACTION_ADD),
        "MESSAGE_REACTION_REMOVE" => Some(protocol::REACTION_REMOVE),
        "TYPING_START" => Some(protocol::TYPING_START),
        "CHANNEL_PINS_UPDATE" => Some(protocol::CHANNEL_PINS_UPDATE),
        "GUILD_UPDATE" => Some(protocol::GUILD_UPDATE),
        "GUILD_DELETE" => Some(protocol::GUILD_DELETE),
        "CHANNEL_CREATE" => Some(protocol::CHANNEL_CREATE),
        "CHANNEL_UPDATE" => Some(protocol::CHANNEL_UPDATE),
        "CHANNEL_DELETE" => Some(protocol::CHANNEL_DELETE),
        "GUILD_MEMBER_ADD" => Some(protocol::GUILD_MEMBER_ADD),
        "GUILD_MEMBER_REMOVE" => Some(protocol::GUILD_MEMBER_REMOVE),
        "PRESENCE_UPDATE" => Some(protocol::PRESENCE_UPDATE),
        "VOICE_STATE_UPDATE" => Some(protocol::VOICE_STATE_UPDATE),
        "CALL_RING" => Some(protocol::CALL_RING),
        _ => None,
    }
}

/// Run the fan-out loop until the bus closes. Spawn this once at startup.
pub async fn run_router(service: Arc<FederationService>) {
    let mut rx = service.bus().subscribe_system();
    loop {
        match rx.recv().await {
            Ok(event) => {
                if let Err(e) = route_event(&service, event).await {
                    tracing::warn!("router: dropping event: {e}");
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "router: lagged behind the local bus");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn route_event(
    service: &Arc<FederationService>,
    event: ServerEvent,
) -> Result<(), FederationError> {
    // Events applied from a remote envelope never go back out.
    if event.remote_origin.is_some() {
        return Ok(());
    }
    let Some(wire_type) = wire_type_for(&event.event_type) else {
        return Ok(());
    };

    let mut guild_id = event.guild_id.clone();
    let channel_id = event.channel_id.clone();

    // Channel-scoped events without an explicit guild get one from the
    // channel row.
    if guild_id.is_none() {
        if let Some(channel_id) = channel_id.as_deref() {
            guild_id = amityvox_db::channels::guild_id_for_channel(&service.db, channel_id).await?;
        }
    }

    // A guild owned by another instance means the event originated there
    // and arrived via the inbox; do not re-forward.
    if let Some(guild_id) = guild_id.as_deref() {
        if let Some(guild) = amityvox_db::guilds::get_guild(&service.db, guild_id).await? {
            if !guild.is_locally_owned() {
                return Ok(());
            }
        }
    }

    let mut data = (*event.payload).clone();
    if wire_type == protocol::PRESENCE_UPDATE {
        if !attach_presence_guilds(service, &event, &mut data).await? {
            return Ok(());
        }
    }

    let msg = FederatedMessage {
        event_type: wire_type.to_string(),
        origin_id: service.local_id.clone(),
        hlc: service.hlc.now(),
        guild_id: guild_id.clone(),
        channel_id: channel_id.clone(),
        data,
    };

    let targets = select_targets(service, guild_id.as_deref(), channel_id.as_deref()).await?;
    if targets.is_empty() {
        return Ok(());
    }

    // Sign once; each peer gets its own delivery task.
    let envelope = service.sign(&msg)?;
    let envelope_json = Arc::new(envelope.to_json()?);
    let message_id = match wire_type {
        protocol::MESSAGE_CREATE => msg
            .data
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        _ => None,
    };

    tracing::debug!(
        event_type = wire_type,
        peers = targets.len(),
        guild_id = guild_id.as_deref(),
        "fanning out"
    );
    for target in targets {
        let service = Arc::clone(service);
        let envelope_json = Arc::clone(&envelope_json);
        let message_id = message_id.clone();
        tokio::spawn(async move {
            service
                .deliver_to_peer(
                    &target.domain,
                    &target.peer_id,
                    &envelope_json,
                    message_id.as_deref(),
                )
                .await;
        });
    }
    Ok(())
}

/// Presence only federates for local users, and carries the union of the
/// user's guilds so receivers can route it. Lookup failure drops the event.
async fn attach_presence_guilds(
    service: &FederationService,
    event: &ServerEvent,
    data: &mut serde_json::Value,
) -> Result<bool, FederationError> {
    let Some(user_id) = event.user_id.as_deref().or_else(|| {
        data.get("user_id").and_then(|v| v.as_str())
    }) else {
        return Ok(false);
    };
    let user_id = user_id.to_string();

    match amityvox_db::users::user_instance_id(&service.db, &user_id).await {
        Ok(Some(None)) => {}
        // Remote or unknown user: not ours to announce.
        Ok(_) => return Ok(false),
        Err(e) => {
            tracing::warn!(user_id, "presence guild lookup failed, dropping: {e}");
            return Ok(false);
        }
    }

    match amityvox_db::members::list_user_guild_ids(&service.db, &user_id).await {
        Ok(guild_ids) => {
            data["guild_ids"] = serde_json::json!(guild_ids);
            Ok(true)
        }
        Err(e) => {
            tracing::warn!(user_id, "presence guild lookup failed, dropping: {e}");
            Ok(false)
        }
    }
}

/// Channel-scoped events go to peers registered for the channel, falling
/// back to broadcast when none are registered; everything else broadcasts
/// to all active peers.
async fn select_targets(
    service: &FederationService,
    _guild_id: Option<&str>,
    channel_id: Option<&str>,
) -> Result<Vec<ActivePeerRow>, FederationError> {
    if let Some(channel_id) = channel_id {
        let scoped = amityvox_db::channel_peers::list_channel_peer_targets(
            &service.db,
            &service.local_id,
            channel_id,
        )
        .await?;
        if !scoped.is_empty() {
            return Ok(scoped);
        }
    }
    Ok(amityvox_db::peers::list_active_peers(&service.db, &service.local_id).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{seed_remote, test_service};

    async fn seed_active_peer(service: &FederationService, id: &str, domain: &str, seed: u8) {
        seed_remote(service, id, domain, seed).await;
        amityvox_db::peers::upsert_peer(&service.db, service.local_id(), id, "active", "local")
            .await
            .expect("peer");
    }

    #[test]
    fn reaction_subjects_map_back_to_wire_types() {
        assert_eq!(wire_type_for("MESSAGE_REACTION_ADD"), Some("REACTION_ADD"));
        assert_eq!(
            wire_type_for("MESSAGE_REACTION_REMOVE"),
            Some("REACTION_REMOVE")
        );
        assert_eq!(wire_type_for("MESSAGE_CREATE"), Some("MESSAGE_CREATE"));
        assert_eq!(wire_type_for("SESSION_OPEN"), None);
    }

    #[tokio::test]
    async fn channel_scoped_selection_falls_back_to_broadcast() {
        let service = test_service().await;
        seed_active_peer(&service, "B", "b.example", 11).await;
        seed_active_peer(&service, "C2", "c.example", 12).await;
        amityvox_db::guilds::create_guild(service.db(), "G", "guild", "U", None)
            .await
            .expect("guild");
        amityvox_db::channels::upsert_channel(
            service.db(),
            "CH",
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

        // No channel peers registered: broadcast.
        let targets = select_targets(&service, Some("G"), Some("CH"))
            .await
            .expect("targets");
        assert_eq!(targets.len(), 2);

        // With a registration, only the interested peer is selected.
        amityvox_db::channel_peers::add_channel_peer(service.db(), "CH", "B")
            .await
            .expect("register");
        let targets = select_targets(&service, Some("G"), Some("CH"))
            .await
            .expect("targets");
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].peer_id, "B");
    }

    #[tokio::test]
    async fn remote_origin_events_are_not_reforwarded() {
        let service = test_service().await;
        seed_active_peer(&service, "B", "b.example", 11).await;

        let event = ServerEvent {
            event_type: "MESSAGE_CREATE".to_string(),
            payload: std::sync::Arc::new(serde_json::json!({"id": "M"})),
            guild_id: Some("G".to_string()),
            channel_id: Some("C".to_string()),
            user_id: None,
            remote_origin: Some("B".to_string()),
        };
        route_event(&service, event).await.expect("route");
        // Nothing was enqueued, nothing dead-lettered: the event stopped at
        // the re-forwarding guard.
        assert_eq!(
            amityvox_db::delivery::pending_retry_count(service.db())
                .await
                .expect("count"),
            0
        );
    }

    #[tokio::test]
    async fn remotely_owned_guilds_are_not_reforwarded() {
        let service = test_service().await;
        seed_active_peer(&service, "B", "b.example", 11).await;
        amityvox_db::guilds::create_guild(service.db(), "G", "guild", "owner@B", Some("B"))
            .await
            .expect("guild");

        let event = ServerEvent {
            event_type: "GUILD_UPDATE".to_string(),
            payload: std::sync::Arc::new(serde_json::json!({"name": "renamed"})),
            guild_id: Some("G".to_string()),
            channel_id: None,
            user_id: None,
            remote_origin: None,
        };
        // Must not attempt any outbound work for a guild homed elsewhere.
        route_event(&service, event).await.expect("route");
        assert_eq!(
            amityvox_db::delivery::pending_retry_count(service.db())
                .await
                .expect("count"),
            0
        );
    }

    #[tokio::test]
    async fn presence_for_remote_user_is_dropped() {
        let service = test_service().await;
        amityvox_db::users::ensure_remote_user_stub(service.db(), "U@B", "remote", None, None, "B")
            .await
            .expect("stub");

        let event = ServerEvent {
            event_type: "PRESENCE_UPDATE".to_string(),
            payload: std::sync::Arc::new(serde_json::json!({"user_id": "U@B", "status": "online"})),
            guild_id: None,
            channel_id: None,
            user_id: Some("U@B".to_string()),
            remote_origin: None,
        };
        let mut data = serde_json::json!({"user_id": "U@B", "status": "online"});
        let forwarded = attach_presence_guilds(&service, &event, &mut data)
            .await
            .expect("check");
        assert!(!forwarded);
    }

    #[tokio::test]
    async fn presence_for_local_user_carries_guild_union() {
        let service = test_service().await;
        amityvox_db::users::create_local_user(service.db(), "U", "alice", None)
            .await
            .expect("user");
        amityvox_db::guilds::create_guild(service.db(), "G1", "one", "U", None)
            .await
            .expect("g1");
        amityvox_db::guilds::create_guild(service.db(), "G2", "two", "U", None)
            .await
            .expect("g2");
        amityvox_db::members::add_member(service.db(), "G1", "U")
            .await
            .expect("m1");
        amityvox_db::members::add_member(service.db(), "G2", "U")
            .await
            .expect("m2");

        let event = ServerEvent {
            event_type: "PRESENCE_UPDATE".to_string(),
            payload: std::sync::Arc::new(serde_json::json!({"user_id": "U", "status": "online"})),
            guild_id: None,
            channel_id: None,
            user_id: Some("U".to_string()),
            remote_origin: None,
        };
        let mut data = serde_json::json!({"user_id": "U", "status": "online"});
        let forwarded = attach_presence_guilds(&service, &event, &mut data)
            .await
            .expect("check");
        assert!(forwarded);
        let guilds = data["guild_ids"].as_array().expect("guild_ids");
        assert_eq!(guilds.len(), 2);
    }
}
