use crate::hlc::Hlc;
use crate::protocol::{self, FederatedMessage, SyncEvent, SyncRequest, SyncResponse};
use crate::{FederationError, FederationService};
use std::net::IpAddr;
use std::sync::{Arc, Weak};

/// Upper bound on events returned by one sync call.
pub const MAX_SYNC_EVENTS: usize = 1000;

impl FederationService {
    /// POST /federation/v1/sync: replay events since a client-supplied HLC,
    /// restricted to guilds the sender is a channel peer for.
    pub async fn handle_sync(
        &self,
        raw_body: &[u8],
        source_ip: Option<IpAddr>,
    ) -> Result<SyncResponse, FederationError> {
        let envelope = self.verify_inbound_envelope(raw_body, source_ip).await?;
        let sender_id = envelope.sender_id.clone();
        let request: SyncRequest = envelope.decode_payload()?;

        let authorized =
            amityvox_db::channel_peers::list_peer_guild_ids(&self.db, &sender_id).await?;
        let requested: Vec<String> = request
            .guild_ids
            .into_iter()
            .filter(|guild_id| authorized.contains(guild_id))
            .collect();

        let rows = amityvox_db::federation_events::list_events_since(
            &self.db,
            &requested,
            request.last_seen_hlc.wall_ms,
            request.last_seen_hlc.counter as i64,
            MAX_SYNC_EVENTS as i64 + 1,
        )
        .await?;

        let truncated = rows.len() > MAX_SYNC_EVENTS;
        let events = rows
            .into_iter()
            .take(MAX_SYNC_EVENTS)
            .map(|row| SyncEvent {
                id: row.id,
                origin_id: row.instance_id,
                event_type: row.event_type,
                guild_id: row.guild_id,
                channel_id: row.channel_id,
                hlc: Hlc::new(row.hlc_wall_ms, row.hlc_counter as u32),
                payload: row.payload,
                created_at: row.created_at,
            })
            .collect();

        tracing::debug!(sender = %sender_id, truncated, "served sync request");
        Ok(SyncResponse { events, truncated })
    }

    /// Ask a recovered peer for everything since our last exchange and
    /// re-apply it through the normal inbox persistence.
    pub async fn request_backfill(&self, peer_id: &str) -> Result<usize, FederationError> {
        let Some(instance) = amityvox_db::instances::get_instance(&self.db, peer_id).await? else {
            return Err(FederationError::NotFound(format!("instance '{peer_id}'")));
        };
        let peer = amityvox_db::peers::get_peer(&self.db, &self.local_id, peer_id).await?;
        let last_seen_hlc = peer
            .and_then(|p| p.last_synced_at)
            .map(|at| Hlc::new(at.timestamp_millis(), 0))
            .unwrap_or_default();

        let guild_ids =
            amityvox_db::members::list_guilds_shared_with_instance(&self.db, peer_id).await?;
        if guild_ids.is_empty() {
            return Ok(0);
        }

        crate::guard::validate_federation_domain(&instance.domain).await?;
        let request = SyncRequest {
            last_seen_hlc,
            guild_ids,
        };
        let envelope = self.sign(&request)?;
        let response = self.client.post_sync(&instance.domain, &envelope).await?;

        let applied = self.apply_backfill_events(peer_id, response.events).await;
        amityvox_db::peers::touch_last_synced(&self.db, &self.local_id, peer_id).await?;
        tracing::info!(
            peer_id,
            applied,
            truncated = response.truncated,
            "backfill complete"
        );
        Ok(applied)
    }

    /// Re-run the inbox persistence and guild-event applier for replayed
    /// events. Individual failures are logged, not fatal.
    pub(crate) async fn apply_backfill_events(
        &self,
        peer_id: &str,
        events: Vec<SyncEvent>,
    ) -> usize {
        let mut applied = 0;
        for event in events {
            self.hlc.update(event.hlc);
            let msg = FederatedMessage {
                event_type: event.event_type,
                origin_id: event.origin_id,
                hlc: event.hlc,
                guild_id: event.guild_id,
                channel_id: event.channel_id,
                data: event.payload,
            };

            if let Some(channel_id) = msg.channel_id.as_deref() {
                match self.resolve_local_channel(peer_id, channel_id).await {
                    Ok(Some(local_channel_id)) => {
                        if let Err(e) = self.apply_channel_event(&msg, &local_channel_id).await {
                            tracing::warn!(
                                event_type = %msg.event_type,
                                "backfill persistence failed: {e}"
                            );
                            continue;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!("backfill channel resolution failed: {e}");
                        continue;
                    }
                }
            }
            if protocol::is_guild_authority_event(&msg.event_type) {
                self.apply_guild_event_if_owner(peer_id, &msg).await;
            }
            applied += 1;
        }
        applied
    }
}

/// Wire the peer-recovered hook to backfill. Holds only a weak reference so
/// shutdown is not kept alive by its own callback.
pub fn wire_recovery_backfill(service: &Arc<FederationService>) {
    let weak: Weak<FederationService> = Arc::downgrade(service);
    service.set_on_peer_recovered(Arc::new(move |peer_id: String| {
        let Some(service) = weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = service.request_backfill(&peer_id).await {
                tracing::warn!(peer_id, "recovery backfill failed: {e}");
            }
        });
    }));
}
