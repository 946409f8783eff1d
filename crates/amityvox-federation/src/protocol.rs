use crate::hlc::Hlc;
use crate::FederationError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Base protocol version every instance must speak.
pub const PROTOCOL_VERSION_BASE: &str = "1.0";

/// Locally supported protocol versions, highest first. Negotiation walks
/// this list top-down, so the ordering is load-bearing.
pub const SUPPORTED_PROTOCOL_VERSIONS: [&str; 2] = ["1.1", "1.0"];

/// Capabilities this instance advertises, in preference order.
pub const SUPPORTED_CAPABILITIES: [&str; 5] = ["events", "backfill", "manage", "receipts", "voice"];

/// Envelope timestamps older than this are replays.
pub const MAX_TIMESTAMP_AGE_SECS: i64 = 300;
/// Envelope timestamps further in the future than this are clock abuse.
pub const MAX_TIMESTAMP_SKEW_SECS: i64 = 30;

pub fn validate_timestamp(timestamp: DateTime<Utc>) -> Result<(), FederationError> {
    validate_timestamp_at(timestamp, Utc::now())
}

pub fn validate_timestamp_at(
    timestamp: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(), FederationError> {
    let age = now.signed_duration_since(timestamp);
    if age > Duration::seconds(MAX_TIMESTAMP_AGE_SECS) {
        return Err(FederationError::AuthFailure(
            "envelope timestamp too old".to_string(),
        ));
    }
    if -age > Duration::seconds(MAX_TIMESTAMP_SKEW_SECS) {
        return Err(FederationError::AuthFailure(
            "envelope timestamp in the future".to_string(),
        ));
    }
    Ok(())
}

// ---- event types ----

pub const MESSAGE_CREATE: &str = "MESSAGE_CREATE";
pub const MESSAGE_UPDATE: &str = "MESSAGE_UPDATE";
pub const MESSAGE_DELETE: &str = "MESSAGE_DELETE";
pub const TYPING_START: &str = "TYPING_START";
pub const CHANNEL_PINS_UPDATE: &str = "CHANNEL_PINS_UPDATE";
pub const REACTION_ADD: &str = "REACTION_ADD";
pub const REACTION_REMOVE: &str = "REACTION_REMOVE";
pub const GUILD_UPDATE: &str = "GUILD_UPDATE";
pub const GUILD_DELETE: &str = "GUILD_DELETE";
pub const CHANNEL_CREATE: &str = "CHANNEL_CREATE";
pub const CHANNEL_UPDATE: &str = "CHANNEL_UPDATE";
pub const CHANNEL_DELETE: &str = "CHANNEL_DELETE";
pub const GUILD_MEMBER_ADD: &str = "GUILD_MEMBER_ADD";
pub const GUILD_MEMBER_REMOVE: &str = "GUILD_MEMBER_REMOVE";
pub const PRESENCE_UPDATE: &str = "PRESENCE_UPDATE";
pub const VOICE_STATE_UPDATE: &str = "VOICE_STATE_UPDATE";
pub const CALL_RING: &str = "CALL_RING";

/// Local-bus subject for a federated event type. Reaction wire types map
/// onto the gateway's message-reaction subjects; everything else passes
/// through unchanged. Unknown types are not dispatched.
pub fn bus_subject_for(event_type: &str) -> Option<&'static str> {
    match event_type {
        MESSAGE_CREATE => Some(MESSAGE_CREATE),
        MESSAGE_UPDATE => Some(MESSAGE_UPDATE),
        MESSAGE_DELETE => Some(MESSAGE_DELETE),
        TYPING_START => Some(TYPING_START),
        CHANNEL_PINS_UPDATE => Some(CHANNEL_PINS_UPDATE),
        REACTION_ADD => Some("MESSAGE_REACTION_ADD"),
        REACTION_REMOVE => Some("MESSAGE_REACTION_REMOVE"),
        GUILD_UPDATE => Some(GUILD_UPDATE),
        GUILD_DELETE => Some(GUILD_DELETE),
        CHANNEL_CREATE => Some(CHANNEL_CREATE),
        CHANNEL_UPDATE => Some(CHANNEL_UPDATE),
        CHANNEL_DELETE => Some(CHANNEL_DELETE),
        GUILD_MEMBER_ADD => Some(GUILD_MEMBER_ADD),
        GUILD_MEMBER_REMOVE => Some(GUILD_MEMBER_REMOVE),
        PRESENCE_UPDATE => Some(PRESENCE_UPDATE),
        VOICE_STATE_UPDATE => Some(VOICE_STATE_UPDATE),
        CALL_RING => Some(CALL_RING),
        _ => None,
    }
}

/// Guild-level event types the inbox applies to local tables, provided the
/// sender owns the guild.
pub fn is_guild_authority_event(event_type: &str) -> bool {
    matches!(
        event_type,
        GUILD_UPDATE
            | GUILD_DELETE
            | CHANNEL_CREATE
            | CHANNEL_UPDATE
            | CHANNEL_DELETE
            | GUILD_MEMBER_ADD
            | GUILD_MEMBER_REMOVE
    )
}

/// The inner message carried by every signed federation envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederatedMessage {
    #[serde(rename = "type")]
    pub event_type: String,
    pub origin_id: String,
    pub hlc: Hlc,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    pub data: Value,
}

impl FederatedMessage {
    /// `created_at` carried in the event data, when the origin supplied one.
    pub fn data_created_at(&self) -> Option<DateTime<Utc>> {
        self.data
            .get("created_at")
            .and_then(|v| v.as_str())
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

// ---- peering ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub sender_id: String,
    pub sender_domain: String,
    pub protocol_version: String,
    pub supported_versions: Vec<String>,
    pub capabilities: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub accepted: bool,
    pub instance_id: String,
    pub domain: String,
    pub protocol_version: String,
    pub capabilities: Vec<String>,
    pub peer_state: String,
}

// ---- backfill ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub last_seen_hlc: Hlc,
    pub guild_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub id: String,
    pub origin_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub guild_id: Option<String>,
    pub channel_id: Option<String>,
    pub hlc: Hlc,
    pub payload: Value,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub events: Vec<SyncEvent>,
    pub truncated: bool,
}

// ---- manage RPC ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManageRequest {
    pub action: String,
    pub user_id: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManageResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ManageResponse {
    pub fn success(data: Option<Value>) -> Self {
        Self {
            ok: true,
            data,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

// ---- delivery receipts ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceiptNotice {
    pub message_id: String,
    pub source: String,
    pub target: String,
    pub status: String,
    pub attempts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_window_boundaries() {
        let now = Utc::now();
        assert!(validate_timestamp_at(now, now).is_ok());
        assert!(validate_timestamp_at(now - Duration::minutes(4), now).is_ok());
        assert!(validate_timestamp_at(now - Duration::minutes(6), now).is_err());
        assert!(validate_timestamp_at(now + Duration::seconds(29), now).is_ok());
        assert!(validate_timestamp_at(now + Duration::seconds(45), now).is_err());
    }

    #[test]
    fn reaction_subjects_are_remapped() {
        assert_eq!(bus_subject_for("REACTION_ADD"), Some("MESSAGE_REACTION_ADD"));
        assert_eq!(
            bus_subject_for("REACTION_REMOVE"),
            Some("MESSAGE_REACTION_REMOVE")
        );
        assert_eq!(bus_subject_for("MESSAGE_CREATE"), Some("MESSAGE_CREATE"));
        assert_eq!(bus_subject_for("NOT_A_TYPE"), None);
    }

    #[test]
    fn guild_authority_events_are_the_owner_gated_set() {
        for ty in [
            "GUILD_UPDATE",
            "GUILD_DELETE",
            "CHANNEL_CREATE",
            "CHANNEL_UPDATE",
            "CHANNEL_DELETE",
            "GUILD_MEMBER_ADD",
            "GUILD_MEMBER_REMOVE",
        ] {
            assert!(is_guild_authority_event(ty), "{ty}");
        }
        assert!(!is_guild_authority_event("MESSAGE_CREATE"));
        assert!(!is_guild_authority_event("PRESENCE_UPDATE"));
    }

    #[test]
    fn federated_message_reads_created_at_from_data() {
        let msg = FederatedMessage {
            event_type: MESSAGE_CREATE.to_string(),
            origin_id: "B".to_string(),
            hlc: Hlc::new(1000, 0),
            guild_id: Some("G".to_string()),
            channel_id: Some("C".to_string()),
            data: serde_json::json!({"id": "M", "created_at": "2024-01-01T00:00:00Z"}),
        };
        let created = msg.data_created_at().expect("created_at");
        assert_eq!(created.timestamp(), 1_704_067_200);
    }
}
