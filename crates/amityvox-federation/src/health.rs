use crate::FederationService;
use amityvox_models::peer::PeerHealth;

impl FederationService {
    /// Record a delivery outcome for a peer. A transition from non-healthy
    /// to healthy fires the registered recovery hook on a background task,
    /// which drives backfill.
    pub async fn update_peer_health(&self, peer_id: &str, healthy: bool, lag_ms: i64) {
        let previous = match amityvox_db::peers::get_peer_status(&self.db, peer_id).await {
            Ok(row) => row
                .and_then(|r| PeerHealth::parse(&r.status))
                .unwrap_or(PeerHealth::Unknown),
            Err(e) => {
                tracing::warn!(peer_id, "peer status lookup failed: {e}");
                PeerHealth::Unknown
            }
        };

        let next = if healthy {
            PeerHealth::Healthy
        } else {
            PeerHealth::Degraded
        };
        if let Err(e) =
            amityvox_db::peers::upsert_peer_health(&self.db, peer_id, next.as_str(), lag_ms).await
        {
            tracing::warn!(peer_id, "peer health upsert failed: {e}");
            return;
        }

        let recovered = healthy && previous != PeerHealth::Healthy;
        if recovered {
            tracing::info!(peer_id, previous = previous.as_str(), "peer recovered");
            if let Some(hook) = self.peer_recovered_hook() {
                let peer_id = peer_id.to_string();
                tokio::spawn(async move { hook(peer_id) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_service;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn recovery_transition_fires_hook_once() {
        let service = test_service().await;
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        service.set_on_peer_recovered(Arc::new(move |peer_id| {
            assert_eq!(peer_id, "B");
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        // unknown -> healthy: recovery.
        service.update_peer_health("B", true, 12).await;
        // healthy -> healthy: no hook.
        service.update_peer_health("B", true, 8).await;
        // healthy -> degraded -> healthy: recovery again.
        service.update_peer_health("B", false, 900).await;
        service.update_peer_health("B", true, 10).await;

        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        let status = amityvox_db::peers::get_peer_status(service.db(), "B")
            .await
            .expect("query")
            .expect("row");
        assert_eq!(status.status, "healthy");
        assert_eq!(status.event_lag_ms, 10);
    }

    #[tokio::test]
    async fn degradation_does_not_fire_hook() {
        let service = test_service().await;
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        service.set_on_peer_recovered(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        service.update_peer_health("B", false, 0).await;
        service.update_peer_health("B", false, 0).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
