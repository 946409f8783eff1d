use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub avatar_id: Option<String>,
    /// Home instance; `None` means local.
    pub instance_id: Option<String>,
    pub presence: String,
}

/// Minimal profile served over federation lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub avatar_id: Option<String>,
}
