//! Lease manager
//!
//! Grants exclusive, time-bounded use of one credential+client pair per
//! in-flight request. Every lease must be completed exactly once; a
//! dropped lease counts as a failure, and a reaper force-fails leases
//! older than the grace period so a stuck caller cannot leak active
//! credentials indefinitely.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::client::{WarmClient, WarmClientCache};
use crate::engine::events::{EngineEvent, EventSender};
use crate::engine::governor::PathGovernor;
use crate::engine::pool::{CredentialPool, FailureReason, LeaseOutcome};
use crate::engine::registry::{EgressRegistry, PathOutcome};
use crate::error::{EngineError, Result};
use crate::models::{Credential, CredentialId, EgressPathId, RetireReason};

/// Pause before re-trying acquisition when the chosen path is paced out
const PACING_RETRY_DELAY: Duration = Duration::from_millis(25);

struct OutstandingLease {
    credential_id: CredentialId,
    path_id: EgressPathId,
    deadline: Instant,
}

/// Grants and tracks leases
pub struct LeaseManager {
    pool: Arc<CredentialPool>,
    registry: Arc<EgressRegistry>,
    clients: Arc<WarmClientCache>,
    governor: Arc<PathGovernor>,
    outstanding: DashMap<u64, OutstandingLease>,
    seq: AtomicU64,
    grace_period: Duration,
    events: EventSender,
}

impl LeaseManager {
    pub fn new(
        pool: Arc<CredentialPool>,
        registry: Arc<EgressRegistry>,
        clients: Arc<WarmClientCache>,
        governor: Arc<PathGovernor>,
        grace_period: Duration,
        events: EventSender,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            registry,
            clients,
            governor,
            outstanding: DashMap::new(),
            seq: AtomicU64::new(0),
            grace_period,
            events,
        })
    }

    /// Acquire a credential and pair it with its path's warm client.
    /// Fails with `PoolEmpty` when nothing is ready within `timeout`.
    pub async fn lease(self: &Arc<Self>, timeout: Duration) -> Result<Lease> {
        let started = Instant::now();

        let credential = loop {
            let remaining = timeout.saturating_sub(started.elapsed());
            let credential = self.pool.acquire(remaining).await?;

            // A path banned while this credential sat pooled takes the
            // credential down with it.
            if self.registry.is_banned(credential.path_id) {
                self.pool.discard(credential, RetireReason::PathBanned);
                continue;
            }

            match self.governor.check(credential.path_id) {
                Ok(()) => break credential,
                Err(_) => {
                    // Path is paced out; put the credential back untouched
                    // and look again.
                    self.pool.requeue(credential);
                    if started.elapsed() >= timeout {
                        return Err(EngineError::PoolEmpty);
                    }
                    tokio::time::sleep(PACING_RETRY_DELAY.min(
                        timeout.saturating_sub(started.elapsed()),
                    ))
                    .await;
                }
            }
        };

        let path_id = credential.path_id;
        let path_cfg = self
            .registry
            .config(path_id)
            .ok_or_else(|| EngineError::Internal(format!("unknown path {}", path_id)))?;
        let client = self.clients.get(path_id, path_cfg);

        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        self.outstanding.insert(
            id,
            OutstandingLease {
                credential_id: credential.id,
                path_id,
                deadline: Instant::now() + self.grace_period,
            },
        );

        self.events.emit(EngineEvent::LeaseGranted {
            credential_id: credential.id,
            path_id,
            wait_ms: started.elapsed().as_millis() as u64,
        });

        Ok(Lease {
            id,
            credential: Some(credential),
            client,
            manager: self.clone(),
        })
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    /// Record a completed lease: credential bookkeeping in the pool, path
    /// health in the registry, client eviction if the path got banned.
    fn finish(&self, credential: Credential, outcome: LeaseOutcome) {
        let path_id = credential.path_id;

        let path_outcome = match outcome {
            LeaseOutcome::Success => PathOutcome::Success,
            LeaseOutcome::Failure(FailureReason::RateLimited) => PathOutcome::RateLimited,
            LeaseOutcome::Failure(_) => PathOutcome::Failure,
        };
        self.registry.report_outcome(path_id, path_outcome);

        if self.registry.is_banned(path_id) {
            self.clients.evict(path_id);
        }

        self.pool.release(credential, outcome);
    }

    /// Spawn the reaper loop that force-fails overdue leases
    pub fn spawn_reaper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let manager = self.clone();
        let tick = (self.grace_period / 4).max(Duration::from_millis(100));

        tokio::spawn(async move {
            let mut ticker = interval(tick);
            ticker.tick().await; // Skip immediate tick

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.reap_overdue();
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!("Lease reaper shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }

    fn reap_overdue(&self) {
        let now = Instant::now();
        let overdue: Vec<u64> = self
            .outstanding
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| *entry.key())
            .collect();

        for id in overdue {
            if let Some((_, lease)) = self.outstanding.remove(&id) {
                warn!(
                    credential = %lease.credential_id,
                    path = %lease.path_id,
                    "Reclaiming overdue lease as failure"
                );
                self.registry
                    .report_outcome(lease.path_id, PathOutcome::Failure);
                self.events.emit(EngineEvent::LeaseReclaimed {
                    credential_id: lease.credential_id,
                    path_id: lease.path_id,
                });
            }
        }
    }

    /// Wait until no leases are outstanding, up to `timeout`
    pub async fn wait_drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.outstanding.is_empty() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.outstanding.is_empty()
    }

    /// Force-fail every outstanding lease (shutdown past drain timeout)
    pub fn force_reclaim_all(&self) {
        let ids: Vec<u64> = self.outstanding.iter().map(|e| *e.key()).collect();
        if !ids.is_empty() {
            info!(count = ids.len(), "Force-reclaiming outstanding leases");
        }
        for id in ids {
            if let Some((_, lease)) = self.outstanding.remove(&id) {
                self.registry
                    .report_outcome(lease.path_id, PathOutcome::Failure);
                self.events.emit(EngineEvent::LeaseReclaimed {
                    credential_id: lease.credential_id,
                    path_id: lease.path_id,
                });
            }
        }
    }
}

/// Exclusive right to use one credential+client pair for a single request
///
/// Complete exactly once with [`Lease::complete`]. Dropping an
/// uncompleted lease records a failure outcome.
pub struct Lease {
    id: u64,
    credential: Option<Credential>,
    client: Arc<WarmClient>,
    manager: Arc<LeaseManager>,
}

impl Lease {
    /// The leased credential. Panics after completion, which consumes it.
    pub fn credential(&self) -> &Credential {
        self.credential.as_ref().expect("lease already completed")
    }

    /// The warm client bound to the credential's egress path
    pub fn client(&self) -> &Arc<WarmClient> {
        &self.client
    }

    /// Report the request outcome. The second call fails with
    /// `DoubleCompletion`; a call after the reaper reclaimed this lease
    /// fails with `LeaseExpired`.
    pub fn complete(&mut self, outcome: LeaseOutcome) -> Result<()> {
        let credential = self
            .credential
            .take()
            .ok_or(EngineError::DoubleCompletion)?;

        if self.manager.outstanding.remove(&self.id).is_none() {
            // The reaper already counted this lease as a failure; the
            // credential cannot re-enter rotation.
            let mut credential = credential;
            credential.retire();
            self.manager.events.emit(EngineEvent::CredentialRetired {
                credential_id: credential.id,
                path_id: credential.path_id,
                reason: RetireReason::Reclaimed,
                requests_made: credential.requests_made,
            });
            return Err(EngineError::LeaseExpired);
        }

        self.manager.finish(credential, outcome);
        Ok(())
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(credential) = self.credential.take() {
            if self.manager.outstanding.remove(&self.id).is_some() {
                debug!(credential = %credential.id, "Lease dropped without completion");
                self.manager
                    .finish(credential, LeaseOutcome::Failure(FailureReason::Dropped));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, CredentialConfig, PoolConfig, RegistryConfig, UpstreamConfig};
    use crate::models::EgressPathConfig;

    fn test_manager(grace_period: Duration, path_rate_limit: u32) -> Arc<LeaseManager> {
        let events = EventSender::new(64);

        let (pool, _refill_rx) = CredentialPool::new(
            PoolConfig {
                target_size: 10,
                low_water: 0,
                max_size: 20,
                ..PoolConfig::default()
            },
            CredentialConfig::default(),
            events.clone(),
        );

        let paths = vec![EgressPathConfig::parse("http://p1.example:3128").unwrap()];
        let registry = Arc::new(
            EgressRegistry::new(&paths, RegistryConfig::default(), events.clone()).unwrap(),
        );

        let upstream = UpstreamConfig {
            host: "127.0.0.1".to_string(),
            port: 9,
            use_tls: false,
            ..UpstreamConfig::default()
        };
        let clients = Arc::new(WarmClientCache::new(
            &upstream,
            ClientConfig {
                prewarm: false,
                ..ClientConfig::default()
            },
        ));

        LeaseManager::new(
            Arc::new(pool),
            registry,
            clients,
            Arc::new(PathGovernor::new(path_rate_limit)),
            grace_period,
            events,
        )
    }

    fn stock(manager: &Arc<LeaseManager>, n: usize) {
        for _ in 0..n {
            manager.pool.insert(Credential::new(
                EgressPathId(1),
                "guest".to_string(),
                "csrf".to_string(),
                10,
                Some(Duration::from_secs(3600)),
            ));
        }
    }

    #[tokio::test]
    async fn test_lease_pairs_credential_with_path_client() {
        let manager = test_manager(Duration::from_secs(60), 0);
        stock(&manager, 1);

        let mut lease = manager.lease(Duration::ZERO).await.unwrap();
        assert_eq!(lease.credential().path_id, EgressPathId(1));
        assert_eq!(lease.client().path_id(), EgressPathId(1));
        assert_eq!(manager.outstanding_count(), 1);

        lease.complete(LeaseOutcome::Success).unwrap();
        assert_eq!(manager.outstanding_count(), 0);
        assert_eq!(manager.pool.len(), 1);
    }

    #[tokio::test]
    async fn test_lease_empty_pool_fails_fast() {
        let manager = test_manager(Duration::from_secs(60), 0);

        let start = Instant::now();
        let result = manager.lease(Duration::ZERO).await;
        assert!(matches!(result, Err(EngineError::PoolEmpty)));
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_double_completion_fails_loudly() {
        let manager = test_manager(Duration::from_secs(60), 0);
        stock(&manager, 1);

        let mut lease = manager.lease(Duration::ZERO).await.unwrap();
        lease.complete(LeaseOutcome::Success).unwrap();

        let second = lease.complete(LeaseOutcome::Success);
        assert!(matches!(second, Err(EngineError::DoubleCompletion)));
        // The first completion's bookkeeping stands: still one pooled
        // credential with one recorded request.
        assert_eq!(manager.pool.len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_lease_counts_as_failure() {
        let manager = test_manager(Duration::from_secs(60), 0);
        stock(&manager, 1);

        {
            let lease = manager.lease(Duration::ZERO).await.unwrap();
            drop(lease);
        }

        assert_eq!(manager.outstanding_count(), 0);
        // Default max_failures is 2, so one dropped lease re-queues the
        // credential with a failure recorded.
        let lease = manager.lease(Duration::ZERO).await.unwrap();
        assert_eq!(lease.credential().failures, 1);
        assert_eq!(lease.credential().requests_made, 1);
    }

    #[tokio::test]
    async fn test_reaper_reclaims_overdue_lease() {
        let manager = test_manager(Duration::from_millis(50), 0);
        stock(&manager, 1);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reaper = manager.spawn_reaper(shutdown_rx);

        let mut lease = manager.lease(Duration::ZERO).await.unwrap();

        // Sit on the lease past the grace period.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(manager.outstanding_count(), 0);

        // Late completion is refused.
        let result = lease.complete(LeaseOutcome::Success);
        assert!(matches!(result, Err(EngineError::LeaseExpired)));

        let _ = shutdown_tx.send(true);
        let _ = reaper.await;
    }

    #[tokio::test]
    async fn test_pacing_requeues_untouched() {
        // One request per second allowed: the second lease inside the
        // window must fail without consuming credential budget.
        let manager = test_manager(Duration::from_secs(60), 1);
        stock(&manager, 2);

        let lease = manager.lease(Duration::ZERO).await.unwrap();
        drop(lease); // recorded as a failure, credential re-queued

        let result = manager.lease(Duration::ZERO).await;
        assert!(matches!(result, Err(EngineError::PoolEmpty)));
        assert_eq!(manager.pool.len(), 2);

        // The requeued credential was not charged for the paced-out
        // attempt: the healthiest pooled credential is still unused.
        let untouched = manager.pool.acquire(Duration::ZERO).await.unwrap();
        assert_eq!(untouched.requests_made, 0);
    }

    #[tokio::test]
    async fn test_credentials_on_banned_path_are_not_leased() {
        let manager = test_manager(Duration::from_secs(60), 0);
        stock(&manager, 3);

        // Default failure threshold is 10.
        for _ in 0..10 {
            manager
                .registry
                .report_outcome(EgressPathId(1), PathOutcome::Failure);
        }
        assert!(manager.registry.is_banned(EgressPathId(1)));

        // Every pooled credential is bound to the banned path: the lease
        // manager discards them all instead of handing one out.
        let result = manager.lease(Duration::ZERO).await;
        assert!(matches!(result, Err(EngineError::PoolEmpty)));
        assert_eq!(manager.pool.len(), 0);
    }

    #[tokio::test]
    async fn test_force_reclaim_all() {
        let manager = test_manager(Duration::from_secs(60), 0);
        stock(&manager, 2);

        let _lease_a = manager.lease(Duration::ZERO).await.unwrap();
        let _lease_b = manager.lease(Duration::ZERO).await.unwrap();
        assert_eq!(manager.outstanding_count(), 2);

        manager.force_reclaim_all();
        assert_eq!(manager.outstanding_count(), 0);
    }
}
