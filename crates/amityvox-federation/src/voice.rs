use crate::{FederationError, FederationService};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct VideoGrant {
    #[serde(rename = "roomJoin", skip_serializing_if = "Option::is_none")]
    pub room_join: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(rename = "canPublish", skip_serializing_if = "Option::is_none")]
    pub can_publish: Option<bool>,
    #[serde(rename = "canSubscribe", skip_serializing_if = "Option::is_none")]
    pub can_subscribe: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VoiceClaims {
    pub exp: u64,
    pub iss: String,
    pub sub: String,
    pub name: Option<String>,
    pub video: VideoGrant,
}

/// A minted voice token plus where to connect with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceTokenGrant {
    pub token: String,
    pub url: String,
    pub room: String,
}

/// Signed request body for POST /federation/v1/voice/token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceTokenRequest {
    pub user_id: String,
    pub guild_id: String,
    pub channel_id: String,
}

impl FederationService {
    /// Mint a room-scoped voice token for a remote member. 503 when the
    /// capability is switched off.
    pub async fn mint_voice_token(
        &self,
        request: &VoiceTokenRequest,
        sender_id: &str,
    ) -> Result<VoiceTokenGrant, FederationError> {
        let voice = &self.config.voice;
        if !voice.enabled {
            return Err(FederationError::CapabilityDisabled);
        }
        let Some(public_url) = voice.public_url.as_deref() else {
            return Err(FederationError::CapabilityDisabled);
        };

        // The requesting user must be a member, homed on the sender.
        match amityvox_db::users::user_instance_id(&self.db, &request.user_id).await? {
            Some(Some(home)) if home == sender_id => {}
            _ => {
                return Err(FederationError::AuthFailure(format!(
                    "user '{}' is not homed on '{sender_id}'",
                    request.user_id
                )));
            }
        }
        amityvox_core::permissions::ensure_guild_member(&self.db, &request.guild_id, &request.user_id)
            .await?;
        let channel = amityvox_db::channels::get_channel(&self.db, &request.channel_id)
            .await?
            .ok_or_else(|| {
                FederationError::NotFound(format!("channel '{}'", request.channel_id))
            })?;
        if channel.guild_id != request.guild_id {
            return Err(FederationError::NotFound(format!(
                "channel '{}'",
                request.channel_id
            )));
        }

        let room = format!("voice_{}_{}", request.guild_id, request.channel_id);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| FederationError::Internal(format!("system clock: {e}")))?
            .as_secs();
        let claims = VoiceClaims {
            exp: now + 3_600,
            iss: voice.api_key.clone(),
            sub: request.user_id.clone(),
            name: None,
            video: VideoGrant {
                room_join: Some(true),
                room: Some(room.clone()),
                can_publish: Some(true),
                can_subscribe: Some(true),
            },
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(voice.api_secret.as_bytes()),
        )
        .map_err(|e| FederationError::Internal(format!("voice token: {e}")))?;

        Ok(VoiceTokenGrant {
            token,
            url: public_url.to_string(),
            room,
        })
    }
}
