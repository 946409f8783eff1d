use crate::{signing, FederationError, FederationService};
use amityvox_db::instances;
use amityvox_models::instance::{DiscoveryDocument, FederationMode};
use amityvox_util::shorthand;

impl FederationService {
    /// The document served at `/.well-known/amityvox` (cacheable for 1 h).
    pub fn discovery_document(&self) -> DiscoveryDocument {
        DiscoveryDocument {
            instance_id: self.local_id.clone(),
            domain: self.config.domain.clone(),
            public_key: self.public_key_pem.clone(),
            software: self.config.software.clone(),
            version: self.config.version.clone(),
            federation_mode: self.cached_federation_mode(),
            api_endpoint: DiscoveryDocument::api_endpoint_for(&self.config.domain),
            protocol_versions: self.config.protocol_versions.clone(),
            capabilities: self.config.capabilities.clone(),
            voice_url: self.config.voice.public_url.clone(),
            voice_mode: self.config.voice.mode.clone(),
            shorthand: self.config.shorthand.clone(),
        }
    }

    /// Upsert a remote instance from its discovery document, keyed by
    /// domain. Key changes are audited; a changed id means the remote was
    /// rebuilt and every reference migrates to the new id atomically.
    pub async fn register_remote_instance(
        &self,
        doc: &DiscoveryDocument,
    ) -> Result<instances::InstanceRow, FederationError> {
        if doc.instance_id == self.local_id || doc.domain == self.config.domain {
            return Err(FederationError::Malformed(
                "refusing to register the local instance as remote".to_string(),
            ));
        }
        if !amityvox_util::id::is_valid(&doc.instance_id) {
            return Err(FederationError::Malformed(format!(
                "invalid instance id '{}'",
                doc.instance_id
            )));
        }
        let fingerprint = signing::key_fingerprint(&doc.public_key)?;
        let mode = doc.federation_mode.as_str();

        let existing = instances::get_instance_by_domain(&self.db, &doc.domain).await?;
        match existing {
            None => {
                instances::insert_instance(
                    &self.db,
                    &instances::NewInstance {
                        id: &doc.instance_id,
                        domain: &doc.domain,
                        public_key: &doc.public_key,
                        key_fingerprint: &fingerprint,
                        federation_mode: mode,
                        software: &doc.software,
                        version: &doc.version,
                        shorthand: None,
                        voice_url: doc.voice_url.as_deref(),
                        voice_mode: doc.voice_mode.as_deref(),
                        is_local: false,
                    },
                )
                .await?;
                tracing::info!(instance_id = %doc.instance_id, domain = %doc.domain, "registered remote instance");
            }
            Some(ref row) => {
                if row.public_key != doc.public_key {
                    instances::insert_key_audit(
                        &self.db,
                        &amityvox_util::id::generate(),
                        &row.id,
                        &row.key_fingerprint,
                        &fingerprint,
                        &row.public_key,
                    )
                    .await?;
                    tracing::warn!(
                        instance_id = %row.id,
                        domain = %doc.domain,
                        old_fingerprint = %row.key_fingerprint,
                        new_fingerprint = %fingerprint,
                        "instance public key changed"
                    );
                }

                if row.id != doc.instance_id {
                    tracing::warn!(
                        domain = %doc.domain,
                        old_id = %row.id,
                        new_id = %doc.instance_id,
                        "instance was rebuilt, migrating id"
                    );
                    instances::migrate_instance_id(&self.db, &row.id, &doc.instance_id).await?;
                    self.invalidate_instance_caches(&row.id);
                }

                instances::update_instance(
                    &self.db,
                    &doc.instance_id,
                    &doc.public_key,
                    &fingerprint,
                    mode,
                    &doc.software,
                    &doc.version,
                    doc.voice_url.as_deref(),
                    doc.voice_mode.as_deref(),
                )
                .await?;
            }
        }

        if let Some(base) = doc.shorthand.as_deref() {
            self.assign_shorthand(&doc.instance_id, base).await?;
        }

        self.invalidate_instance_caches(&doc.instance_id);
        if let Some(hook) = self.instance_registered_hook() {
            hook(doc.instance_id.clone());
        }

        instances::get_instance(&self.db, &doc.instance_id)
            .await?
            .ok_or_else(|| FederationError::Internal("instance vanished after upsert".to_string()))
    }

    /// Re-fetch a remote discovery document (SSRF-guarded) and register it.
    pub async fn discover_and_register(
        &self,
        domain: &str,
    ) -> Result<instances::InstanceRow, FederationError> {
        let resolved = crate::guard::validate_federation_domain(domain).await?;
        let doc = self.client.discover(domain).await?;
        if doc.domain != domain {
            return Err(FederationError::AuthFailure(format!(
                "discovery document for '{domain}' claims domain '{}'",
                doc.domain
            )));
        }
        let row = self.register_remote_instance(&doc).await?;
        let ips: Vec<String> = resolved.iter().map(|ip| ip.to_string()).collect();
        instances::set_resolved_ips(&self.db, &row.id, &ips).await?;
        Ok(row)
    }

    /// Give the instance a unique shorthand, appending 1..99 and trimming
    /// the base when taken. After 99 attempts the shorthand stays null.
    async fn assign_shorthand(
        &self,
        instance_id: &str,
        base: &str,
    ) -> Result<Option<String>, FederationError> {
        if !shorthand::is_valid_shorthand(base) {
            return Ok(None);
        }
        for attempt in 0..=shorthand::MAX_SHORTHAND_ATTEMPTS {
            let Some(candidate) = shorthand::collision_candidate(base, attempt) else {
                break;
            };
            if !instances::shorthand_taken(&self.db, &candidate, instance_id).await? {
                instances::set_shorthand(&self.db, instance_id, Some(&candidate)).await?;
                return Ok(Some(candidate));
            }
        }
        tracing::warn!(instance_id, base, "gave up resolving shorthand collision");
        instances::set_shorthand(&self.db, instance_id, None).await?;
        Ok(None)
    }

    /// Sender public key, via the 5-minute key cache.
    pub(crate) async fn sender_public_key(
        &self,
        instance_id: &str,
    ) -> Result<Option<String>, FederationError> {
        if let Some(pem) = self.key_cache.get(&instance_id.to_string()) {
            return Ok(Some(pem));
        }
        match instances::get_public_key(&self.db, instance_id).await? {
            Some(pem) => {
                self.key_cache.set(instance_id.to_string(), pem.clone());
                Ok(Some(pem))
            }
            None => Ok(None),
        }
    }

    pub(crate) fn invalidate_instance_caches(&self, instance_id: &str) {
        let key = instance_id.to_string();
        self.allow_cache.invalidate(&key);
        self.key_cache.invalidate(&key);
        self.negative_senders.invalidate(&key);
    }

    pub(crate) fn cached_federation_mode(&self) -> FederationMode {
        if let Some(mode) = self.mode_cache.get(&()) {
            return mode;
        }
        self.config.federation_mode
    }

    /// Reload the local federation mode from the instances table into the
    /// single-entry cache.
    pub async fn refresh_federation_mode(&self) -> Result<FederationMode, FederationError> {
        let row = instances::get_local_instance(&self.db)
            .await?
            .ok_or_else(|| FederationError::Internal("missing local instance".to_string()))?;
        let mode =
            FederationMode::parse(&row.federation_mode).unwrap_or(self.config.federation_mode);
        self.mode_cache.set((), mode);
        Ok(mode)
    }
}
