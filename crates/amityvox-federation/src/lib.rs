pub mod backfill;
pub mod cache;
pub mod client;
pub mod counters;
pub mod guard;
pub mod health;
pub mod hlc;
pub mod identity;
pub mod inbox;
pub mod manage;
pub mod peering;
pub mod policy;
pub mod protocol;
pub mod router;
pub mod signing;
pub mod voice;

mod apply;
mod delivery;

pub use delivery::{
    backoff_delay, run_counter_flusher, run_retry_consumer, ACK_WAIT, MAX_DELIVERY_ATTEMPTS,
};

use amityvox_core::events::EventBus;
use amityvox_db::DbPool;
use amityvox_models::instance::FederationMode;
use cache::TtlCache;
use client::FederationClient;
use counters::CounterBatch;
use ed25519_dalek::SigningKey;
use hlc::HybridLogicalClock;
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum FederationError {
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("authentication failure: {0}")]
    AuthFailure(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("gone: {0}")]
    Gone(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("remote rejected: {0}")]
    RemoteLogical(String),
    #[error("upstream transport failure: {0}")]
    UpstreamTransport(String),
    #[error("capability disabled")]
    CapabilityDisabled,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<amityvox_core::error::CoreError> for FederationError {
    fn from(e: amityvox_core::error::CoreError) -> Self {
        use amityvox_core::error::CoreError;
        match e {
            CoreError::NotFound => FederationError::NotFound("entity".to_string()),
            CoreError::Forbidden | CoreError::MissingPermission => {
                FederationError::AuthFailure("missing permission".to_string())
            }
            CoreError::BadRequest(msg) => FederationError::Malformed(msg),
            CoreError::Conflict(msg) => FederationError::Conflict(msg),
            CoreError::Database(e) => FederationError::Database(e),
            CoreError::Internal(msg) => FederationError::Internal(msg),
        }
    }
}

/// Voice token capability settings. Disabled unless a media endpoint is
/// configured.
#[derive(Debug, Clone, Default)]
pub struct VoiceSettings {
    pub enabled: bool,
    pub public_url: Option<String>,
    pub api_key: String,
    pub api_secret: String,
    pub mode: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FederationConfig {
    /// Public DNS name of this instance.
    pub domain: String,
    /// Federation admission mode applied to unknown peers.
    pub federation_mode: FederationMode,
    /// Treat a source-IP mismatch as fatal rather than a warning.
    pub enforce_source_ip: bool,
    pub software: String,
    pub version: String,
    pub shorthand: Option<String>,
    /// Supported protocol versions, highest first.
    pub protocol_versions: Vec<String>,
    /// Advertised capabilities, in preference order.
    pub capabilities: Vec<String>,
    pub voice: VoiceSettings,
}

impl FederationConfig {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            federation_mode: FederationMode::Open,
            enforce_source_ip: false,
            software: "amityvox".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            shorthand: None,
            protocol_versions: protocol::SUPPORTED_PROTOCOL_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
            capabilities: protocol::SUPPORTED_CAPABILITIES
                .iter()
                .map(|v| v.to_string())
                .collect(),
            voice: VoiceSettings::default(),
        }
    }
}

pub type PeerRecoveredHook = Arc<dyn Fn(String) + Send + Sync>;
pub type InstanceRegisteredHook = Arc<dyn Fn(String) + Send + Sync>;

/// The federation core: identity, policy, ingress, fan-out, retry, backfill
/// and home-instance authority, sharing one signing key and one clock.
pub struct FederationService {
    pub(crate) db: DbPool,
    pub(crate) bus: EventBus,
    pub(crate) config: FederationConfig,
    pub(crate) local_id: String,
    pub(crate) signing_key: SigningKey,
    pub(crate) public_key_pem: String,
    pub(crate) hlc: HybridLogicalClock,
    pub(crate) client: FederationClient,
    pub(crate) counters: CounterBatch,
    /// Allow decisions per remote instance id.
    pub(crate) allow_cache: TtlCache<String, bool>,
    /// Public key PEMs per remote instance id.
    pub(crate) key_cache: TtlCache<String, String>,
    /// The single-entry local federation mode cache, preloaded at startup.
    pub(crate) mode_cache: TtlCache<(), FederationMode>,
    /// Senders we know nothing about; avoids a DB hit per junk envelope.
    pub(crate) negative_senders: TtlCache<String, ()>,
    pub(crate) on_peer_recovered: RwLock<Option<PeerRecoveredHook>>,
    pub(crate) on_instance_registered: RwLock<Option<InstanceRegisteredHook>>,
}

impl FederationService {
    /// Build the service, creating the local instance row on first run and
    /// preloading the federation-mode cache.
    pub async fn bootstrap(
        db: DbPool,
        bus: EventBus,
        config: FederationConfig,
        signing_key: SigningKey,
    ) -> Result<Arc<Self>, FederationError> {
        let public_key_pem = signing::public_key_pem(&signing_key)?;

        let local_id = match amityvox_db::instances::get_local_instance(&db).await? {
            Some(row) => {
                if row.domain != config.domain {
                    return Err(FederationError::Internal(format!(
                        "configured domain '{}' does not match stored local instance '{}'",
                        config.domain, row.domain
                    )));
                }
                row.id
            }
            None => {
                let id = amityvox_util::id::generate();
                let fingerprint = signing::key_fingerprint(&public_key_pem)?;
                amityvox_db::instances::insert_instance(
                    &db,
                    &amityvox_db::instances::NewInstance {
                        id: &id,
                        domain: &config.domain,
                        public_key: &public_key_pem,
                        key_fingerprint: &fingerprint,
                        federation_mode: config.federation_mode.as_str(),
                        software: &config.software,
                        version: &config.version,
                        shorthand: config.shorthand.as_deref(),
                        voice_url: config.voice.public_url.as_deref(),
                        voice_mode: config.voice.mode.as_deref(),
                        is_local: true,
                    },
                )
                .await?;
                tracing::info!(instance_id = %id, domain = %config.domain, "created local instance");
                id
            }
        };

        let service = Arc::new(Self {
            db,
            bus,
            local_id,
            signing_key,
            public_key_pem,
            hlc: HybridLogicalClock::new(),
            client: FederationClient::new(&config.version)?,
            counters: CounterBatch::new(),
            allow_cache: TtlCache::new(Duration::from_secs(60), 500),
            key_cache: TtlCache::new(Duration::from_secs(300), 500),
            mode_cache: TtlCache::new(Duration::from_secs(60), 1),
            negative_senders: TtlCache::new(Duration::from_secs(60), 1000),
            on_peer_recovered: RwLock::new(None),
            on_instance_registered: RwLock::new(None),
            config,
        });
        service.mode_cache.set((), service.config.federation_mode);
        Ok(service)
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn domain(&self) -> &str {
        &self.config.domain
    }

    pub fn config(&self) -> &FederationConfig {
        &self.config
    }

    pub fn db(&self) -> &DbPool {
        &self.db
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn hlc(&self) -> &HybridLogicalClock {
        &self.hlc
    }

    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    /// Sign a payload as this instance.
    pub fn sign<T: serde::Serialize>(
        &self,
        value: &T,
    ) -> Result<signing::SignedEnvelope, FederationError> {
        signing::sign_value(&self.signing_key, &self.local_id, value)
    }

    pub fn set_on_peer_recovered(&self, hook: PeerRecoveredHook) {
        *self
            .on_peer_recovered
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    pub fn set_on_instance_registered(&self, hook: InstanceRegisteredHook) {
        *self
            .on_instance_registered
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    pub(crate) fn peer_recovered_hook(&self) -> Option<PeerRecoveredHook> {
        self.on_peer_recovered
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn instance_registered_hook(&self) -> Option<InstanceRegisteredHook> {
        self.on_instance_registered
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

pub fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

pub fn hex_decode(value: &str) -> Option<Vec<u8>> {
    if !value.len().is_multiple_of(2) {
        return None;
    }
    let mut out = Vec::with_capacity(value.len() / 2);
    let mut i = 0;
    while i < value.len() {
        let byte = u8::from_str_radix(value.get(i..i + 2)?, 16).ok()?;
        out.push(byte);
        i += 2;
    }
    Some(out)
}
