use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guild {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub owner_id: String,
    /// Owning instance; `None` means this instance is the home.
    pub instance_id: Option<String>,
    pub member_count: i64,
    pub max_members: i64,
    pub discoverable: bool,
    pub default_permissions: u64,
    pub created_at: DateTime<Utc>,
}

/// Public preview served to unauthenticated federation peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuildPreview {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub member_count: i64,
}
