//! Credential minting
//!
//! The factory mints through this seam so tests can swap the upstream
//! out. `HttpMinter` activates a guest credential against the configured
//! upstream endpoint, sent through the path-bound warm client so every
//! credential inherits its path's egress address.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, HOST};
use http_body_util::Full;
use hyper::Request;
use rand::RngCore;

use crate::client::WarmClient;
use crate::config::UpstreamConfig;
use crate::error::{EngineError, Result};
use crate::models::EgressPathConfig;

/// A freshly issued credential, before the factory stamps budget and TTL
#[derive(Debug, Clone)]
pub struct MintedCredential {
    pub token: String,
    pub csrf: String,
}

/// Mints disposable credentials through a given egress path
#[async_trait]
pub trait CredentialMinter: Send + Sync {
    async fn mint(&self, path: &EgressPathConfig, client: &WarmClient) -> Result<MintedCredential>;
}

/// Mints guest credentials via the upstream activation endpoint
pub struct HttpMinter {
    host: String,
    activation_path: String,
    bearer_token: String,
}

impl HttpMinter {
    pub fn new(upstream: &UpstreamConfig) -> Self {
        Self {
            host: upstream.host.clone(),
            activation_path: upstream.activation_path.clone(),
            bearer_token: upstream.bearer_token.clone(),
        }
    }
}

#[async_trait]
impl CredentialMinter for HttpMinter {
    async fn mint(&self, _path: &EgressPathConfig, client: &WarmClient) -> Result<MintedCredential> {
        let request = Request::builder()
            .method("POST")
            .uri(self.activation_path.as_str())
            .header(HOST, self.host.as_str())
            .header(AUTHORIZATION, format!("Bearer {}", self.bearer_token))
            .header(CONTENT_LENGTH, 0)
            .body(Full::new(Bytes::new()))
            .map_err(|e| EngineError::Internal(format!("Failed to build request: {}", e)))?;

        let response = client.request(request).await?;
        let status = response.status().as_u16();
        let body = response.into_body();

        let token = parse_activation_body(status, body)?;

        Ok(MintedCredential {
            token,
            csrf: random_csrf(),
        })
    }
}

/// Extract the issued token from an activation response
fn parse_activation_body(status: u16, body: Bytes) -> Result<String> {
    if !(200..300).contains(&status) {
        return Err(EngineError::MintRejected { status });
    }

    let value: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| EngineError::MintFailed(format!("invalid activation response: {}", e)))?;

    value
        .get("guest_token")
        .and_then(|t| t.as_str())
        .map(|t| t.to_string())
        .ok_or_else(|| EngineError::MintFailed("activation response missing guest_token".into()))
}

/// 32 hex characters, the upstream's expected CSRF shape
fn random_csrf() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
