use serde::{Deserialize, Serialize};

pub const CHANNEL_TYPE_TEXT: i16 = 0;
pub const CHANNEL_TYPE_DM: i16 = 1;
pub const CHANNEL_TYPE_VOICE: i16 = 2;
pub const CHANNEL_TYPE_CATEGORY: i16 = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub guild_id: String,
    pub name: String,
    pub topic: Option<String>,
    pub channel_type: i16,
    pub category_id: Option<String>,
    pub position: i32,
    pub private: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub guild_id: String,
    pub name: String,
    pub position: i32,
}
