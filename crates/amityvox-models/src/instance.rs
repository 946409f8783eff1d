use serde::{Deserialize, Serialize};

/// How this instance admits remote peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FederationMode {
    Open,
    Closed,
    Allowlist,
}

impl FederationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Allowlist => "allowlist",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            "allowlist" => Some(Self::Allowlist),
            _ => None,
        }
    }
}

/// Per-peer admin override, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerControlAction {
    Block,
    Allow,
    Mute,
}

impl PeerControlAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Allow => "allow",
            Self::Mute => "mute",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "block" => Some(Self::Block),
            "allow" => Some(Self::Allow),
            "mute" => Some(Self::Mute),
            _ => None,
        }
    }
}

/// The discovery document served at `/.well-known/amityvox` and consumed
/// when registering a remote instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    pub instance_id: String,
    pub domain: String,
    pub public_key: String,
    pub software: String,
    pub version: String,
    pub federation_mode: FederationMode,
    pub api_endpoint: String,
    pub protocol_versions: Vec<String>,
    pub capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shorthand: Option<String>,
}

impl DiscoveryDocument {
    /// Canonical federation API endpoint for a domain.
    pub fn api_endpoint_for(domain: &str) -> String {
        format!("https://{domain}/federation/v1")
    }
}
