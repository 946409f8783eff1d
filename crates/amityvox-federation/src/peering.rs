use crate::protocol::{
    validate_timestamp, HandshakeRequest, HandshakeResponse, PROTOCOL_VERSION_BASE,
};
use crate::signing::{self, SignedEnvelope};
use crate::{FederationError, FederationService};
use amityvox_models::instance::FederationMode;
use amityvox_models::peer::{PeerHealth, PeerInitiator, PeerState};
use chrono::Utc;
use std::net::IpAddr;

/// Highest mutually supported version, walking the local list top-down.
/// Falls back to the base version when the lists do not intersect.
pub fn negotiate_protocol(local: &[String], remote: &[String]) -> String {
    local
        .iter()
        .find(|version| remote.contains(version))
        .cloned()
        .unwrap_or_else(|| PROTOCOL_VERSION_BASE.to_string())
}

/// Capability intersection, preserving the local ordering.
pub fn negotiate_capabilities(local: &[String], remote: &[String]) -> Vec<String> {
    local
        .iter()
        .filter(|capability| remote.contains(capability))
        .cloned()
        .collect()
}

impl FederationService {
    /// Receiver side of POST /federation/v1/handshake.
    pub async fn handle_handshake(
        &self,
        raw_body: &[u8],
        source_ip: Option<IpAddr>,
    ) -> Result<HandshakeResponse, FederationError> {
        let envelope = SignedEnvelope::from_json(raw_body)?;
        let request: HandshakeRequest = envelope.decode_payload()?;
        validate_timestamp(request.timestamp)?;

        if envelope.sender_id != request.sender_id {
            return Err(FederationError::AuthFailure(
                "envelope sender does not match handshake sender".to_string(),
            ));
        }

        // Re-discover the claimed domain; the discovery document is the
        // authority on which id lives there.
        let row = self.discover_and_register(&request.sender_domain).await?;
        if row.id != request.sender_id {
            return Err(FederationError::AuthFailure(format!(
                "discovery for '{}' returned id '{}', handshake claims '{}'",
                request.sender_domain, row.id, request.sender_id
            )));
        }

        if !signing::verify_signature(&row.public_key, envelope.payload_bytes(), &envelope.signature)
        {
            return Err(FederationError::AuthFailure(
                "invalid handshake signature".to_string(),
            ));
        }

        self.verify_source_ip(&request.sender_id, source_ip).await?;
        self.accept_handshake(&request).await
    }

    /// Policy check, negotiation and reverse-peer bookkeeping, after the
    /// sender's identity has been established.
    pub(crate) async fn accept_handshake(
        &self,
        request: &HandshakeRequest,
    ) -> Result<HandshakeResponse, FederationError> {
        if !self.is_federation_allowed(&request.sender_id).await? {
            return Err(FederationError::AuthFailure(format!(
                "federation policy denies '{}'",
                request.sender_id
            )));
        }

        let protocol_version =
            negotiate_protocol(&self.config.protocol_versions, &request.supported_versions);
        let capabilities =
            negotiate_capabilities(&self.config.capabilities, &request.capabilities);

        let peer_state = match self.cached_federation_mode() {
            FederationMode::Open => PeerState::Active,
            _ => PeerState::Pending,
        };
        amityvox_db::peers::upsert_peer(
            &self.db,
            &self.local_id,
            &request.sender_id,
            peer_state.as_str(),
            PeerInitiator::Remote.as_str(),
        )
        .await?;
        amityvox_db::peers::upsert_peer_status_negotiated(
            &self.db,
            &request.sender_id,
            PeerHealth::Healthy.as_str(),
            &protocol_version,
            &capabilities,
        )
        .await?;

        tracing::info!(
            peer_id = %request.sender_id,
            domain = %request.sender_domain,
            version = %protocol_version,
            state = peer_state.as_str(),
            "handshake accepted"
        );

        Ok(HandshakeResponse {
            accepted: true,
            instance_id: self.local_id.clone(),
            domain: self.config.domain.clone(),
            protocol_version,
            capabilities,
            peer_state: peer_state.as_str().to_string(),
        })
    }

    /// Sender side: validate the target domain, discover it, then POST a
    /// signed handshake and record the resulting peer.
    pub async fn send_handshake(
        &self,
        domain: &str,
    ) -> Result<HandshakeResponse, FederationError> {
        let row = self.discover_and_register(domain).await?;

        let request = HandshakeRequest {
            sender_id: self.local_id.clone(),
            sender_domain: self.config.domain.clone(),
            protocol_version: self
                .config
                .protocol_versions
                .first()
                .cloned()
                .unwrap_or_else(|| PROTOCOL_VERSION_BASE.to_string()),
            supported_versions: self.config.protocol_versions.clone(),
            capabilities: self.config.capabilities.clone(),
            timestamp: Utc::now(),
        };
        let envelope = self.sign(&request)?;
        let response = self.client.post_handshake(domain, &envelope).await?;

        if response.instance_id != row.id {
            return Err(FederationError::AuthFailure(format!(
                "handshake response from '{domain}' claims id '{}', discovery said '{}'",
                response.instance_id, row.id
            )));
        }

        let state = if response.accepted {
            PeerState::Active
        } else {
            PeerState::Pending
        };
        amityvox_db::peers::upsert_peer(
            &self.db,
            &self.local_id,
            &row.id,
            state.as_str(),
            PeerInitiator::Local.as_str(),
        )
        .await?;
        amityvox_db::peers::upsert_peer_status_negotiated(
            &self.db,
            &row.id,
            PeerHealth::Healthy.as_str(),
            &response.protocol_version,
            &response.capabilities,
        )
        .await?;
        Ok(response)
    }

    /// Compare the request source against the instance's resolved addresses.
    /// A mismatch is fatal only when enforcement is configured.
    pub(crate) async fn verify_source_ip(
        &self,
        instance_id: &str,
        source_ip: Option<IpAddr>,
    ) -> Result<(), FederationError> {
        let Some(source_ip) = source_ip else {
            return Ok(());
        };
        let Some(row) = amityvox_db::instances::get_instance(&self.db, instance_id).await? else {
            return Ok(());
        };
        if row.resolved_ips.is_empty() {
            return Ok(());
        }
        let matches = row
            .resolved_ips
            .iter()
            .filter_map(|raw| raw.parse::<IpAddr>().ok())
            .any(|ip| ip == source_ip);
        if matches {
            return Ok(());
        }
        if self.config.enforce_source_ip {
            return Err(FederationError::AuthFailure(format!(
                "source address {source_ip} is not among the resolved addresses of '{instance_id}'"
            )));
        }
        tracing::warn!(
            instance_id,
            %source_ip,
            "source address not among resolved addresses (enforcement disabled)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{seed_remote, test_service};

    fn versions(list: &[&str]) -> Vec<String> {
        list.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn protocol_negotiation_walks_local_list_top_down() {
        let local = versions(&["1.2", "1.1", "1.0"]);
        assert_eq!(
            negotiate_protocol(&local, &versions(&["1.0", "1.1"])),
            "1.1"
        );
        assert_eq!(negotiate_protocol(&local, &versions(&["1.2"])), "1.2");
        assert_eq!(
            negotiate_protocol(&local, &versions(&["9.9"])),
            PROTOCOL_VERSION_BASE
        );
        assert_eq!(negotiate_protocol(&local, &[]), PROTOCOL_VERSION_BASE);
    }

    #[test]
    fn capability_negotiation_preserves_local_order() {
        let local = versions(&["events", "backfill", "manage", "voice"]);
        let remote = versions(&["voice", "events", "extra"]);
        assert_eq!(
            negotiate_capabilities(&local, &remote),
            versions(&["events", "voice"])
        );
        assert!(negotiate_capabilities(&local, &[]).is_empty());
    }

    #[tokio::test]
    async fn accepted_handshake_creates_active_reverse_peer_in_open_mode() {
        let service = test_service().await;
        seed_remote(&service, "01BX5ZZKBKACTAV9WEVGEMMVRY", "b.example", 11).await;

        let request = HandshakeRequest {
            sender_id: "01BX5ZZKBKACTAV9WEVGEMMVRY".to_string(),
            sender_domain: "b.example".to_string(),
            protocol_version: "1.1".to_string(),
            supported_versions: versions(&["1.1", "1.0"]),
            capabilities: versions(&["events", "backfill"]),
            timestamp: Utc::now(),
        };
        let response = service.accept_handshake(&request).await.expect("accept");

        assert!(response.accepted);
        assert_eq!(response.protocol_version, "1.1");
        assert_eq!(response.capabilities, versions(&["events", "backfill"]));
        assert_eq!(response.peer_state, "active");

        let peer = amityvox_db::peers::get_peer(
            service.db(),
            service.local_id(),
            "01BX5ZZKBKACTAV9WEVGEMMVRY",
        )
        .await
        .expect("query")
        .expect("row");
        assert_eq!(peer.status, "active");
        assert_eq!(peer.initiated_by, "remote");

        let status =
            amityvox_db::peers::get_peer_status(service.db(), "01BX5ZZKBKACTAV9WEVGEMMVRY")
                .await
                .expect("query")
                .expect("row");
        assert_eq!(status.status, "healthy");
        assert_eq!(status.version.as_deref(), Some("1.1"));
    }

    #[tokio::test]
    async fn handshake_rejects_stale_timestamp_before_discovery() {
        let service = test_service().await;
        let key = seed_remote(&service, "01BX5ZZKBKACTAV9WEVGEMMVRY", "b.example", 11).await;

        let request = HandshakeRequest {
            sender_id: "01BX5ZZKBKACTAV9WEVGEMMVRY".to_string(),
            sender_domain: "b.example".to_string(),
            protocol_version: "1.0".to_string(),
            supported_versions: versions(&["1.0"]),
            capabilities: versions(&["events"]),
            timestamp: Utc::now() - chrono::Duration::minutes(10),
        };
        let envelope = signing::sign_value(&key, "01BX5ZZKBKACTAV9WEVGEMMVRY", &request)
            .expect("sign");
        let raw = envelope.to_json().expect("encode");

        let err = service
            .handle_handshake(raw.as_bytes(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::AuthFailure(_)));
    }

    #[tokio::test]
    async fn source_ip_mismatch_is_fatal_only_when_enforced() {
        let mut config = crate::FederationConfig::new("a.example");
        config.enforce_source_ip = true;
        let service = crate::testutil::test_service_with(config).await;
        seed_remote(&service, "B", "b.example", 11).await;
        amityvox_db::instances::set_resolved_ips(
            service.db(),
            "B",
            &["203.0.113.9".to_string()],
        )
        .await
        .expect("ips");

        let ok = service
            .verify_source_ip("B", Some("203.0.113.9".parse().unwrap()))
            .await;
        assert!(ok.is_ok());

        let err = service
            .verify_source_ip("B", Some("198.51.100.1".parse().unwrap()))
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::AuthFailure(_)));
    }
}
