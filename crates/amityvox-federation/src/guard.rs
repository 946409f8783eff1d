use crate::FederationError;
use std::net::IpAddr;
use tokio::net::lookup_host;

const FORBIDDEN_SUFFIXES: [&str; 3] = [".local", ".internal", ".localhost"];

/// Hostname-level checks that need no resolver: literal loopback names,
/// internal suffixes, and literal IPs in forbidden ranges.
pub fn host_is_forbidden(host: &str) -> bool {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() || host == "localhost" {
        return true;
    }
    if FORBIDDEN_SUFFIXES.iter().any(|s| host.ends_with(s)) {
        return true;
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip_is_forbidden(ip);
    }
    false
}

/// Loopback, private, link-local and unique-local addresses never federate.
pub fn ip_is_forbidden(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || (v6.is_multicast() && (v6.segments()[0] & 0x000f) == 2)
        }
    }
}

/// SSRF gate run before any outbound federation call: validates the bare
/// hostname, resolves it, and rejects when any address falls in a forbidden
/// range. Returns the resolved addresses for source-IP bookkeeping.
pub async fn validate_federation_domain(host: &str) -> Result<Vec<IpAddr>, FederationError> {
    amityvox_util::validation::validate_hostname(host)
        .map_err(|_| FederationError::Malformed(format!("invalid federation domain '{host}'")))?;
    if host_is_forbidden(host) {
        return Err(FederationError::AuthFailure(format!(
            "federation domain '{host}' is not routable"
        )));
    }

    let addrs: Vec<IpAddr> = lookup_host((host, 443_u16))
        .await
        .map_err(|e| FederationError::UpstreamTransport(format!("resolving '{host}': {e}")))?
        .map(|addr| addr.ip())
        .collect();
    if addrs.is_empty() {
        return Err(FederationError::UpstreamTransport(format!(
            "no addresses for '{host}'"
        )));
    }
    if let Some(bad) = addrs.iter().copied().find(|ip| ip_is_forbidden(*ip)) {
        return Err(FederationError::AuthFailure(format!(
            "federation domain '{host}' resolves to forbidden address {bad}"
        )));
    }
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_internal_hostnames() {
        assert!(host_is_forbidden("localhost"));
        assert!(host_is_forbidden("LOCALHOST"));
        assert!(host_is_forbidden("node.local"));
        assert!(host_is_forbidden("svc.internal"));
        assert!(host_is_forbidden("dev.localhost"));
        assert!(!host_is_forbidden("chat.example.com"));
    }

    #[test]
    fn rejects_forbidden_literal_ips() {
        for bad in [
            "127.0.0.1",
            "10.0.0.9",
            "172.16.0.1",
            "172.31.255.254",
            "192.168.1.1",
            "169.254.0.7",
            "::1",
            "fc00::1",
            "fd12::9",
            "fe80::2",
        ] {
            assert!(host_is_forbidden(bad), "{bad} should be forbidden");
        }
        assert!(!host_is_forbidden("93.184.216.34"));
        assert!(!host_is_forbidden("2606:2800:220:1::1"));
    }

    #[test]
    fn boundary_of_172_16_slash_12() {
        assert!(!host_is_forbidden("172.15.255.255"));
        assert!(host_is_forbidden("172.16.0.0"));
        assert!(host_is_forbidden("172.31.255.255"));
        assert!(!host_is_forbidden("172.32.0.0"));
    }

    #[tokio::test]
    async fn validate_rejects_before_resolving() {
        let err = validate_federation_domain("localhost").await.unwrap_err();
        assert!(matches!(err, FederationError::AuthFailure(_)));
        let err = validate_federation_domain("https://x.example").await.unwrap_err();
        assert!(matches!(err, FederationError::Malformed(_)));
    }
}
