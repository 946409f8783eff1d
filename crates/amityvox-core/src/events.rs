use amityvox_models::gateway::ServerEvent;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Broadcast-based event bus for real-time dispatch.
///
/// The system channel carries every event; the federation router and other
/// server-side listeners subscribe there. Gateway sessions additionally get
/// per-session channels filtered by guild membership.
#[derive(Clone)]
pub struct EventBus {
    capacity: usize,
    sessions: Arc<DashMap<String, SessionSubscription>>,
    guild_sessions: Arc<DashMap<String, HashSet<String>>>,
    system_sender: broadcast::Sender<ServerEvent>,
}

#[derive(Clone)]
struct SessionSubscription {
    guild_ids: HashSet<String>,
    sender: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (system_sender, _) = broadcast::channel(capacity);
        Self {
            capacity,
            sessions: Arc::new(DashMap::new()),
            guild_sessions: Arc::new(DashMap::new()),
            system_sender,
        }
    }

    pub fn subscribe_system(&self) -> broadcast::Receiver<ServerEvent> {
        self.system_sender.subscribe()
    }

    pub fn register_session(
        &self,
        session_id: impl Into<String>,
        guild_ids: &[String],
    ) -> broadcast::Receiver<ServerEvent> {
        let (sender, receiver) = broadcast::channel(self.capacity.max(256));
        let sid = session_id.into();
        let subscription = SessionSubscription {
            guild_ids: guild_ids.iter().cloned().collect(),
            sender,
        };

        for gid in guild_ids {
            self.guild_sessions
                .entry(gid.clone())
                .or_default()
                .insert(sid.clone());
        }

        self.sessions.insert(sid, subscription);
        receiver
    }

    pub fn unregister_session(&self, session_id: &str) {
        if let Some((_, sub)) = self.sessions.remove(session_id) {
            for gid in &sub.guild_ids {
                if let Some(mut sids) = self.guild_sessions.get_mut(gid) {
                    sids.remove(session_id);
                    if sids.is_empty() {
                        drop(sids);
                        self.guild_sessions.remove(gid);
                    }
                }
            }
        }
    }

    pub fn publish(&self, event: ServerEvent) {
        // Server-side listeners (federation router, bots) see everything.
        let _ = self.system_sender.send(event.clone());

        let session_ids: Vec<String> = if let Some(guild_id) = &event.guild_id {
            self.guild_sessions
                .get(guild_id)
                .map(|sids| sids.iter().cloned().collect())
                .unwrap_or_default()
        } else {
            self.sessions
                .iter()
                .map(|entry| entry.key().clone())
                .collect()
        };

        for sid in session_ids {
            if let Some(sub) = self.sessions.get(&sid) {
                let _ = sub.sender.send(event.clone());
            }
        }
    }

    /// Helper: publish a typed local event.
    pub fn dispatch(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        guild_id: Option<String>,
        channel_id: Option<String>,
        user_id: Option<String>,
    ) {
        self.publish(ServerEvent {
            event_type: event_type.to_string(),
            payload: Arc::new(payload),
            guild_id,
            channel_id,
            user_id,
            remote_origin: None,
        });
    }

    /// Helper: publish an event applied from a remote envelope. The router
    /// skips these so they are never forwarded back out.
    pub fn dispatch_remote(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        guild_id: Option<String>,
        channel_id: Option<String>,
        user_id: Option<String>,
        origin: &str,
    ) {
        self.publish(ServerEvent {
            event_type: event_type.to_string(),
            payload: Arc::new(payload),
            guild_id,
            channel_id,
            user_id,
            remote_origin: Some(origin.to_string()),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4096)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn system_subscribers_see_all_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe_system();

        bus.dispatch("MESSAGE_CREATE", serde_json::json!({"id": "M"}), Some("G".into()), None, None);

        let event = rx.recv().await.expect("event");
        assert_eq!(event.event_type, "MESSAGE_CREATE");
        assert_eq!(event.guild_id.as_deref(), Some("G"));
        assert!(event.remote_origin.is_none());
    }

    #[tokio::test]
    async fn guild_scoped_events_only_reach_member_sessions() {
        let bus = EventBus::new(16);
        let mut in_guild = bus.register_session("s1", &["G".to_string()]);
        let mut outside = bus.register_session("s2", &["H".to_string()]);

        bus.dispatch("MESSAGE_CREATE", serde_json::json!({}), Some("G".into()), None, None);

        assert!(in_guild.try_recv().is_ok());
        assert!(outside.try_recv().is_err());
    }

    #[tokio::test]
    async fn remote_dispatch_is_tagged() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe_system();
        bus.dispatch_remote("GUILD_UPDATE", serde_json::json!({}), Some("G".into()), None, None, "B");
        let event = rx.recv().await.expect("event");
        assert_eq!(event.remote_origin.as_deref(), Some("B"));
    }
}
