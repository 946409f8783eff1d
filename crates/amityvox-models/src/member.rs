use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub guild_id: String,
    pub user_id: String,
    pub nickname: Option<String>,
    pub joined_at: DateTime<Utc>,
}
