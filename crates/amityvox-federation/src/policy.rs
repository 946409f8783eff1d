use crate::{FederationError, FederationService};
use amityvox_models::instance::{FederationMode, PeerControlAction};

impl FederationService {
    /// Whether events from `remote_id` are admitted. Per-peer controls win
    /// over the instance-wide mode; results are cached for a minute.
    pub async fn is_federation_allowed(&self, remote_id: &str) -> Result<bool, FederationError> {
        let cache_key = remote_id.to_string();
        if let Some(allowed) = self.allow_cache.get(&cache_key) {
            return Ok(allowed);
        }

        let allowed = self.compute_federation_allowed(remote_id).await?;
        self.allow_cache.set(cache_key, allowed);
        Ok(allowed)
    }

    async fn compute_federation_allowed(&self, remote_id: &str) -> Result<bool, FederationError> {
        let control =
            amityvox_db::peers::get_peer_control(&self.db, &self.local_id, remote_id).await?;
        match control.as_deref().and_then(PeerControlAction::parse) {
            Some(PeerControlAction::Block) => return Ok(false),
            Some(PeerControlAction::Allow) => return Ok(true),
            // Muted peers fall through to the instance-wide mode.
            Some(PeerControlAction::Mute) | None => {}
        }

        match self.cached_federation_mode() {
            FederationMode::Open => Ok(true),
            FederationMode::Closed => Ok(false),
            FederationMode::Allowlist => {
                Ok(amityvox_db::peers::has_active_peer(&self.db, &self.local_id, remote_id).await?)
            }
        }
    }

    /// Admin action: set or clear a per-peer control and drop the cached
    /// decision.
    pub async fn set_peer_control(
        &self,
        peer_id: &str,
        action: Option<PeerControlAction>,
    ) -> Result<(), FederationError> {
        match action {
            Some(action) => {
                amityvox_db::peers::set_peer_control(
                    &self.db,
                    &self.local_id,
                    peer_id,
                    action.as_str(),
                )
                .await?;
            }
            None => {
                amityvox_db::peers::clear_peer_control(&self.db, &self.local_id, peer_id).await?;
            }
        }
        self.allow_cache.invalidate(&peer_id.to_string());
        Ok(())
    }

    /// Admin action: switch the instance-wide federation mode.
    pub async fn set_federation_mode(&self, mode: FederationMode) -> Result<(), FederationError> {
        amityvox_db::instances::set_federation_mode(&self.db, &self.local_id, mode.as_str())
            .await?;
        self.mode_cache.set((), mode);
        self.allow_cache.invalidate_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{seed_remote, test_service, test_service_with};
    use crate::FederationConfig;

    #[tokio::test]
    async fn open_mode_admits_unknown_peers() {
        let service = test_service().await;
        seed_remote(&service, "B", "b.example", 11).await;
        assert!(service.is_federation_allowed("B").await.expect("check"));
    }

    #[tokio::test]
    async fn closed_mode_admits_nobody() {
        let mut config = FederationConfig::new("a.example");
        config.federation_mode = FederationMode::Closed;
        let service = test_service_with(config).await;
        seed_remote(&service, "B", "b.example", 11).await;

        assert!(!service.is_federation_allowed("B").await.expect("check"));

        // An explicit allow control still wins over closed mode.
        service
            .set_peer_control("B", Some(PeerControlAction::Allow))
            .await
            .expect("allow");
        assert!(service.is_federation_allowed("B").await.expect("check"));
    }

    #[tokio::test]
    async fn allowlist_mode_requires_active_peer_row() {
        let mut config = FederationConfig::new("a.example");
        config.federation_mode = FederationMode::Allowlist;
        let service = test_service_with(config).await;
        seed_remote(&service, "B", "b.example", 11).await;

        assert!(!service.is_federation_allowed("B").await.expect("check"));

        amityvox_db::peers::upsert_peer(service.db(), service.local_id(), "B", "active", "local")
            .await
            .expect("peer");
        // The cached denial holds until invalidated.
        assert!(!service.is_federation_allowed("B").await.expect("cached"));
        service.allow_cache.invalidate(&"B".to_string());
        assert!(service.is_federation_allowed("B").await.expect("check"));
    }

    #[tokio::test]
    async fn block_always_wins() {
        let service = test_service().await;
        seed_remote(&service, "B", "b.example", 11).await;
        service
            .set_peer_control("B", Some(PeerControlAction::Block))
            .await
            .expect("block");
        assert!(!service.is_federation_allowed("B").await.expect("check"));

        // Mute falls through to the open mode.
        service
            .set_peer_control("B", Some(PeerControlAction::Mute))
            .await
            .expect("mute");
        assert!(service.is_federation_allowed("B").await.expect("check"));
    }

    #[tokio::test]
    async fn mode_switch_invalidates_decisions() {
        let service = test_service().await;
        seed_remote(&service, "B", "b.example", 11).await;
        assert!(service.is_federation_allowed("B").await.expect("check"));

        service
            .set_federation_mode(FederationMode::Closed)
            .await
            .expect("switch");
        assert!(!service.is_federation_allowed("B").await.expect("check"));
    }
}
