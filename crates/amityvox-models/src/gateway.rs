use serde::{Deserialize, Serialize};
use std::sync::Arc;

// Message events
pub const EVENT_MESSAGE_CREATE: &str = "MESSAGE_CREATE";
pub const EVENT_MESSAGE_UPDATE: &str = "MESSAGE_UPDATE";
pub const EVENT_MESSAGE_DELETE: &str = "MESSAGE_DELETE";
pub const EVENT_MESSAGE_REACTION_ADD: &str = "MESSAGE_REACTION_ADD";
pub const EVENT_MESSAGE_REACTION_REMOVE: &str = "MESSAGE_REACTION_REMOVE";

// Guild events
pub const EVENT_GUILD_UPDATE: &str = "GUILD_UPDATE";
pub const EVENT_GUILD_DELETE: &str = "GUILD_DELETE";
pub const EVENT_GUILD_MEMBER_ADD: &str = "GUILD_MEMBER_ADD";
pub const EVENT_GUILD_MEMBER_REMOVE: &str = "GUILD_MEMBER_REMOVE";
pub const EVENT_GUILD_MEMBER_UPDATE: &str = "GUILD_MEMBER_UPDATE";
pub const EVENT_GUILD_ROLE_CREATE: &str = "GUILD_ROLE_CREATE";
pub const EVENT_GUILD_ROLE_UPDATE: &str = "GUILD_ROLE_UPDATE";
pub const EVENT_GUILD_ROLE_DELETE: &str = "GUILD_ROLE_DELETE";
pub const EVENT_GUILD_BAN_ADD: &str = "GUILD_BAN_ADD";
pub const EVENT_GUILD_BAN_REMOVE: &str = "GUILD_BAN_REMOVE";

// Channel events
pub const EVENT_CHANNEL_CREATE: &str = "CHANNEL_CREATE";
pub const EVENT_CHANNEL_UPDATE: &str = "CHANNEL_UPDATE";
pub const EVENT_CHANNEL_DELETE: &str = "CHANNEL_DELETE";
pub const EVENT_CHANNEL_PINS_UPDATE: &str = "CHANNEL_PINS_UPDATE";

// Presence, typing, voice, calls
pub const EVENT_PRESENCE_UPDATE: &str = "PRESENCE_UPDATE";
pub const EVENT_TYPING_START: &str = "TYPING_START";
pub const EVENT_VOICE_STATE_UPDATE: &str = "VOICE_STATE_UPDATE";
pub const EVENT_CALL_RING: &str = "CALL_RING";

/// An event on the local realtime bus.
///
/// The gateway to end-user clients subscribes to these; the federation
/// router also subscribes and forwards a subset to interested peers.
#[derive(Debug, Clone)]
pub struct ServerEvent {
    pub event_type: String,
    pub payload: Arc<serde_json::Value>,
    /// Guild this event belongs to, if applicable.
    pub guild_id: Option<String>,
    /// Channel this event belongs to, if applicable.
    pub channel_id: Option<String>,
    /// Acting user, when the event has a single subject user.
    pub user_id: Option<String>,
    /// Set when the event was applied from a remote envelope; the router
    /// must not forward it back out.
    pub remote_origin: Option<String>,
}

/// Wire shape for typing notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingStart {
    pub channel_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<String>,
}
