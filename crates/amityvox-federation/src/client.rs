use crate::guard;
use crate::protocol::{HandshakeResponse, ManageResponse, SyncResponse};
use crate::signing::SignedEnvelope;
use crate::FederationError;
use amityvox_models::instance::DiscoveryDocument;
use reqwest::redirect::{Attempt, Policy};
use reqwest::{Client, StatusCode};
use std::time::Duration;

pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const MANAGE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(15);

/// Outbound response bodies larger than this are discarded.
pub const MAX_RESPONSE_BYTES: usize = 1_048_576;

const MAX_REDIRECTS_GET: usize = 5;
const MAX_REDIRECTS_POST: usize = 3;

fn https_only_policy(max_redirects: usize) -> Policy {
    Policy::custom(move |attempt: Attempt| {
        if attempt.url().scheme() != "https" {
            return attempt.error("insecure redirect target");
        }
        if let Some(host) = attempt.url().host_str() {
            if guard::host_is_forbidden(host) {
                return attempt.error("redirect into forbidden address space");
            }
        }
        if attempt.previous().len() >= max_redirects {
            attempt.stop()
        } else {
            attempt.follow()
        }
    })
}

/// Classified outcome of a single inbox delivery attempt.
#[derive(Debug)]
pub enum DeliveryOutcome {
    /// 2xx from the peer.
    Delivered,
    /// Transport failure or HTTP >= 500; worth retrying.
    Retryable(String),
    /// HTTP 4xx; the envelope will never be accepted.
    Rejected(StatusCode, String),
}

/// HTTP client for instance-to-instance requests. HTTPS only, including on
/// redirects; SSRF validation happens before any call via the domain guard.
#[derive(Debug, Clone)]
pub struct FederationClient {
    get_client: Client,
    post_client: Client,
}

impl FederationClient {
    pub fn new(version: &str) -> Result<Self, FederationError> {
        let user_agent = format!("AmityVox-Federation/{version}");
        let get_client = Client::builder()
            .user_agent(user_agent.clone())
            .https_only(true)
            .redirect(https_only_policy(MAX_REDIRECTS_GET))
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .map_err(|e| FederationError::Internal(format!("http client: {e}")))?;
        let post_client = Client::builder()
            .user_agent(user_agent)
            .https_only(true)
            .redirect(https_only_policy(MAX_REDIRECTS_POST))
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .map_err(|e| FederationError::Internal(format!("http client: {e}")))?;
        Ok(Self {
            get_client,
            post_client,
        })
    }

    /// Fetch a remote instance's discovery document. The caller must have
    /// run the domain guard first.
    pub async fn discover(&self, domain: &str) -> Result<DiscoveryDocument, FederationError> {
        let url = format!("https://{domain}/.well-known/amityvox");
        let resp = self
            .get_client
            .get(&url)
            .timeout(DISCOVERY_TIMEOUT)
            .send()
            .await
            .map_err(|e| FederationError::UpstreamTransport(format!("discovery {domain}: {e}")))?;
        if !resp.status().is_success() {
            return Err(FederationError::UpstreamTransport(format!(
                "discovery {domain} returned {}",
                resp.status()
            )));
        }
        let body = read_capped(resp).await?;
        serde_json::from_slice(&body)
            .map_err(|e| FederationError::UpstreamTransport(format!("invalid discovery doc: {e}")))
    }

    pub async fn post_handshake(
        &self,
        domain: &str,
        envelope: &SignedEnvelope,
    ) -> Result<HandshakeResponse, FederationError> {
        let url = format!("https://{domain}/federation/v1/handshake");
        let resp = self
            .post_json(&url, envelope, HANDSHAKE_TIMEOUT)
            .await
            .map_err(|e| FederationError::UpstreamTransport(format!("handshake {domain}: {e}")))?;
        if !resp.status().is_success() {
            return Err(FederationError::RemoteLogical(format!(
                "handshake {domain} returned {}",
                resp.status()
            )));
        }
        let body = read_capped(resp).await?;
        serde_json::from_slice(&body).map_err(|e| {
            FederationError::UpstreamTransport(format!("invalid handshake response: {e}"))
        })
    }

    /// One delivery attempt to a peer inbox; the caller decides retry
    /// placement from the returned outcome.
    pub async fn post_inbox(&self, domain: &str, envelope_json: &str) -> DeliveryOutcome {
        let url = format!("https://{domain}/federation/v1/inbox");
        let result = self
            .post_client
            .post(&url)
            .header("content-type", "application/json")
            .body(envelope_json.to_string())
            .timeout(DELIVERY_TIMEOUT)
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => DeliveryOutcome::Delivered,
            Ok(resp) if resp.status().is_server_error() => {
                DeliveryOutcome::Retryable(format!("peer returned {}", resp.status()))
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                DeliveryOutcome::Rejected(status, body.chars().take(200).collect())
            }
            Err(e) => DeliveryOutcome::Retryable(e.to_string()),
        }
    }

    pub async fn post_sync(
        &self,
        domain: &str,
        envelope: &SignedEnvelope,
    ) -> Result<SyncResponse, FederationError> {
        let url = format!("https://{domain}/federation/v1/sync");
        let resp = self
            .post_json(&url, envelope, DELIVERY_TIMEOUT)
            .await
            .map_err(|e| FederationError::UpstreamTransport(format!("sync {domain}: {e}")))?;
        if !resp.status().is_success() {
            return Err(FederationError::UpstreamTransport(format!(
                "sync {domain} returned {}",
                resp.status()
            )));
        }
        let body = read_capped(resp).await?;
        serde_json::from_slice(&body)
            .map_err(|e| FederationError::UpstreamTransport(format!("invalid sync response: {e}")))
    }

    /// Proxy a signed request to an arbitrary federation endpoint and decode
    /// the remote's `{ok, data, error}` response.
    pub async fn post_manage(
        &self,
        url: &str,
        envelope: &SignedEnvelope,
    ) -> Result<ManageResponse, FederationError> {
        let resp = self
            .post_json(url, envelope, MANAGE_TIMEOUT)
            .await
            .map_err(|e| FederationError::UpstreamTransport(format!("manage {url}: {e}")))?;
        let status = resp.status();
        let body = read_capped(resp).await?;
        let decoded: ManageResponse = serde_json::from_slice(&body).map_err(|e| {
            FederationError::UpstreamTransport(format!("invalid manage response ({status}): {e}"))
        })?;
        Ok(decoded)
    }

    /// POST a signed envelope and return the raw capped body on 2xx.
    pub async fn post_signed(
        &self,
        url: &str,
        envelope: &SignedEnvelope,
        timeout: Duration,
    ) -> Result<Vec<u8>, FederationError> {
        let resp = self
            .post_json(url, envelope, timeout)
            .await
            .map_err(|e| FederationError::UpstreamTransport(format!("{url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(FederationError::UpstreamTransport(format!(
                "{url} returned {}",
                resp.status()
            )));
        }
        read_capped(resp).await
    }

    async fn post_json(
        &self,
        url: &str,
        envelope: &SignedEnvelope,
        timeout: Duration,
    ) -> Result<reqwest::Response, reqwest::Error> {
        self.post_client
            .post(url)
            .json(envelope)
            .timeout(timeout)
            .send()
            .await
    }
}

async fn read_capped(resp: reqwest::Response) -> Result<Vec<u8>, FederationError> {
    if let Some(length) = resp.content_length() {
        if length > MAX_RESPONSE_BYTES as u64 {
            return Err(FederationError::UpstreamTransport(format!(
                "response body of {length} bytes exceeds cap"
            )));
        }
    }
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| FederationError::UpstreamTransport(format!("reading body: {e}")))?;
    if bytes.len() > MAX_RESPONSE_BYTES {
        return Err(FederationError::UpstreamTransport(format!(
            "response body of {} bytes exceeds cap",
            bytes.len()
        )));
    }
    Ok(bytes.to_vec())
}
