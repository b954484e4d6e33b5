//! Warm client cache
//!
//! One reusable HTTP/1.1 session per egress path. The underlying
//! connection is dialed through the path, optionally TLS-wrapped toward
//! the upstream, and kept open across requests so repeated handshake cost
//! is paid once per path instead of once per request.

pub mod transport;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::config::{ClientConfig, UpstreamConfig};
use crate::error::{EngineError, Result};
use crate::models::{EgressPathConfig, EgressPathId};
use transport::{tls_connector, EgressTransport, UpstreamStream};

/// Where warm clients point their requests
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl From<&UpstreamConfig> for UpstreamTarget {
    fn from(cfg: &UpstreamConfig) -> Self {
        Self {
            host: cfg.host.clone(),
            port: cfg.port,
            use_tls: cfg.use_tls,
        }
    }
}

type HttpSender = http1::SendRequest<Full<Bytes>>;

/// A reusable network session bound to one egress path
///
/// Exclusively owned by the cache; leased out through the lease manager
/// and never constructed per request.
pub struct WarmClient {
    path_id: EgressPathId,
    config: Arc<EgressPathConfig>,
    upstream: UpstreamTarget,
    tls: Option<TlsConnector>,
    conn: Mutex<Option<HttpSender>>,
    last_activity: parking_lot::Mutex<Instant>,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl WarmClient {
    fn new(
        path_id: EgressPathId,
        config: Arc<EgressPathConfig>,
        upstream: UpstreamTarget,
        tls: Option<TlsConnector>,
        client_cfg: &ClientConfig,
    ) -> Self {
        Self {
            path_id,
            config,
            upstream,
            tls,
            conn: Mutex::new(None),
            last_activity: parking_lot::Mutex::new(Instant::now()),
            connect_timeout: client_cfg.connect_timeout,
            request_timeout: client_cfg.request_timeout,
        }
    }

    pub fn path_id(&self) -> EgressPathId {
        self.path_id
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Whether a live connection is currently cached
    pub fn is_warm(&self) -> bool {
        match self.conn.try_lock() {
            Ok(guard) => guard.as_ref().map(|s| !s.is_closed()).unwrap_or(false),
            Err(_) => true, // locked means in use
        }
    }

    async fn dial(&self) -> Result<HttpSender> {
        let stream = tokio::time::timeout(
            self.connect_timeout,
            EgressTransport::connect(&self.config, &self.upstream.host, self.upstream.port),
        )
        .await
        .map_err(|_| EngineError::Timeout)??;

        let stream = match (&self.tls, self.upstream.use_tls) {
            (Some(connector), true) => {
                let tls = EgressTransport::wrap_tls(stream, &self.upstream.host, connector).await?;
                UpstreamStream::Tls(Box::new(tls))
            }
            _ => UpstreamStream::Plain(stream),
        };

        let io = TokioIo::new(stream);
        let (sender, conn) = http1::handshake(io)
            .await
            .map_err(|e| EngineError::ConnectionFailed(format!("Handshake failed: {}", e)))?;

        let path_id = self.path_id;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(path = %path_id, "Connection ended: {}", e);
            }
        });

        debug!(path = %self.path_id, "Warm connection established");
        Ok(sender)
    }

    /// Establish the connection ahead of the first request. Best-effort;
    /// failures surface on the first real request instead.
    pub async fn prewarm(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if guard.as_ref().map(|s| !s.is_closed()).unwrap_or(false) {
            return Ok(());
        }
        *guard = Some(self.dial().await?);
        Ok(())
    }

    /// Send a request over the cached connection, re-dialing if it has
    /// gone cold. The connection is replaced, not torn down, on error.
    pub async fn request(&self, req: Request<Full<Bytes>>) -> Result<Response<Bytes>> {
        let mut guard = self.conn.lock().await;

        if guard.as_ref().map(|s| s.is_closed()).unwrap_or(true) {
            *guard = Some(self.dial().await?);
        }
        let sender = guard.as_mut().expect("connection just established");

        let response = match tokio::time::timeout(self.request_timeout, sender.send_request(req))
            .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                *guard = None;
                return Err(EngineError::Http(format!("Request failed: {}", e)));
            }
            Err(_) => {
                *guard = None;
                return Err(EngineError::Timeout);
            }
        };
        drop(guard);

        *self.last_activity.lock() = Instant::now();

        let (parts, body) = response.into_parts();
        let body_bytes = body
            .collect()
            .await
            .map_err(|e| EngineError::Http(format!("Failed to read response: {}", e)))?
            .to_bytes();

        Ok(Response::from_parts(parts, body_bytes))
    }

    /// Drop the cached connection
    pub async fn close(&self) {
        let mut guard = self.conn.lock().await;
        *guard = None;
    }
}

/// Cache of warm clients, one per active egress path
pub struct WarmClientCache {
    clients: DashMap<EgressPathId, Arc<WarmClient>>,
    upstream: UpstreamTarget,
    cfg: ClientConfig,
    tls: Option<TlsConnector>,
}

impl WarmClientCache {
    pub fn new(upstream: &UpstreamConfig, cfg: ClientConfig) -> Self {
        let upstream = UpstreamTarget::from(upstream);
        let tls = upstream.use_tls.then(tls_connector);
        Self {
            clients: DashMap::new(),
            upstream,
            cfg,
            tls,
        }
    }

    /// Return the path's warm client, creating (and, when configured,
    /// prewarming) it on first use
    pub fn get(&self, path_id: EgressPathId, config: Arc<EgressPathConfig>) -> Arc<WarmClient> {
        if let Some(existing) = self.clients.get(&path_id) {
            return existing.clone();
        }

        let client = self
            .clients
            .entry(path_id)
            .or_insert_with(|| {
                let client = Arc::new(WarmClient::new(
                    path_id,
                    config,
                    self.upstream.clone(),
                    self.tls.clone(),
                    &self.cfg,
                ));
                if self.cfg.prewarm {
                    let warmer = client.clone();
                    tokio::spawn(async move {
                        if let Err(e) = warmer.prewarm().await {
                            warn!(path = %warmer.path_id(), "Prewarm failed: {}", e);
                        }
                    });
                }
                client
            })
            .clone();

        client
    }

    /// Drop the client for a path (banned or removed). Outstanding leases
    /// keep their Arc until they finish; the connection dies with the last
    /// reference.
    pub fn evict(&self, path_id: EgressPathId) {
        if let Some((_, client)) = self.clients.remove(&path_id) {
            tokio::spawn(async move { client.close().await });
            debug!(path = %path_id, "Warm client evicted");
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn contains(&self, path_id: EgressPathId) -> bool {
        self.clients.contains_key(&path_id)
    }

    /// Close every cached session. Called on engine teardown.
    pub async fn shutdown(&self) {
        let clients: Vec<Arc<WarmClient>> = self
            .clients
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.clients.clear();

        futures::future::join_all(clients.iter().map(|client| client.close())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cache() -> WarmClientCache {
        let upstream = UpstreamConfig {
            host: "127.0.0.1".to_string(),
            port: 9,
            use_tls: false,
            activation_path: "/activate".to_string(),
            bearer_token: String::new(),
        };
        let cfg = ClientConfig {
            prewarm: false,
            connect_timeout: Duration::from_millis(100),
            request_timeout: Duration::from_millis(100),
        };
        WarmClientCache::new(&upstream, cfg)
    }

    fn test_path_config() -> Arc<EgressPathConfig> {
        Arc::new(EgressPathConfig::direct())
    }

    #[tokio::test]
    async fn test_get_returns_same_client_per_path() {
        let cache = test_cache();

        let a = cache.get(EgressPathId(1), test_path_config());
        let b = cache.get(EgressPathId(1), test_path_config());
        assert!(Arc::ptr_eq(&a, &b));

        let c = cache.get(EgressPathId(2), test_path_config());
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_evict_removes_client() {
        let cache = test_cache();

        cache.get(EgressPathId(1), test_path_config());
        assert!(cache.contains(EgressPathId(1)));

        cache.evict(EgressPathId(1));
        assert!(!cache.contains(EgressPathId(1)));

        // Re-getting creates a fresh client.
        cache.get(EgressPathId(1), test_path_config());
        assert!(cache.contains(EgressPathId(1)));
    }

    #[tokio::test]
    async fn test_new_client_is_cold() {
        let cache = test_cache();
        let client = cache.get(EgressPathId(1), test_path_config());
        assert!(!client.is_warm());
    }

    #[tokio::test]
    async fn test_shutdown_clears_everything() {
        let cache = test_cache();
        cache.get(EgressPathId(1), test_path_config());
        cache.get(EgressPathId(2), test_path_config());

        cache.shutdown().await;
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_request_fails_cleanly_when_unreachable() {
        // Port 9 (discard) is almost certainly closed; the dial must fail
        // with a transport error, not hang.
        let cache = test_cache();
        let client = cache.get(EgressPathId(1), test_path_config());

        let req = Request::builder()
            .method("GET")
            .uri("/")
            .header(http::header::HOST, "127.0.0.1")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let result = client.request(req).await;
        assert!(result.is_err());
    }
}
