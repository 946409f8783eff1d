use serde::{Deserialize, Serialize};

/// Presence statuses accepted from remote instances. Anything else is
/// dropped at the inbox.
pub const ALLOWED_STATUSES: [&str; 6] = ["online", "idle", "focus", "busy", "invisible", "offline"];

pub fn is_allowed_status(status: &str) -> bool {
    ALLOWED_STATUSES.contains(&status)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Presence {
    pub user_id: String,
    pub status: String,
    /// Guilds the user shares with the receiving side, attached by the
    /// origin for routing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guild_ids: Vec<String>,
}
