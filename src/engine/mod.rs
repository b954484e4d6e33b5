//! Credential & client rotation engine
//!
//! Composition root wiring the pool, registry, factory, warm client
//! cache, governor, and lease manager together. Everything is
//! constructor-injected so multiple isolated engines can coexist (one per
//! test, one per tenant); there is no process-wide state.

pub mod events;
pub mod factory;
pub mod governor;
pub mod lease;
pub mod pool;
pub mod registry;

pub use events::{EngineEvent, EventSender};
pub use factory::CredentialFactory;
pub use governor::PathGovernor;
pub use lease::{Lease, LeaseManager};
pub use pool::{CredentialPool, FailureReason, LeaseOutcome, PoolStats, RefillSignal};
pub use registry::{EgressRegistry, PathOutcome};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::client::WarmClientCache;
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::mint::CredentialMinter;
use crate::models::PathSnapshot;

/// Point-in-time view of the engine
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub pool: PoolStats,
    pub paths: Vec<PathSnapshot>,
    pub minted: u64,
    pub mint_failures: u64,
    pub leases_outstanding: usize,
}

/// The rotation engine
///
/// Construct with [`RotationEngine::new`] inside a tokio runtime; the
/// factory workers and the lease reaper are spawned immediately and run
/// until [`RotationEngine::shutdown`].
pub struct RotationEngine {
    pool: Arc<CredentialPool>,
    registry: Arc<EgressRegistry>,
    clients: Arc<WarmClientCache>,
    factory: Arc<CredentialFactory>,
    leases: Arc<LeaseManager>,
    events: EventSender,
    shutdown_tx: watch::Sender<bool>,
    stopping: AtomicBool,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl RotationEngine {
    pub fn new(config: Config, minter: Arc<dyn CredentialMinter>) -> Result<Arc<Self>> {
        let events = EventSender::new(1024);

        let registry = Arc::new(EgressRegistry::new(
            &config.paths,
            config.registry.clone(),
            events.clone(),
        )?);

        let (pool, refill_rx) = CredentialPool::new(
            config.pool.clone(),
            config.credential.clone(),
            events.clone(),
        );
        let pool = Arc::new(pool);

        let clients = Arc::new(WarmClientCache::new(
            &config.upstream,
            config.client.clone(),
        ));

        let governor = Arc::new(PathGovernor::new(config.registry.path_rate_limit));

        let factory = CredentialFactory::new(
            pool.clone(),
            registry.clone(),
            clients.clone(),
            minter,
            config.factory.clone(),
            config.credential.clone(),
            events.clone(),
        );

        let leases = LeaseManager::new(
            pool.clone(),
            registry.clone(),
            clients.clone(),
            governor,
            config.lease.grace_period,
            events.clone(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut tasks = factory.spawn(shutdown_rx.clone(), refill_rx);
        tasks.push(leases.spawn_reaper(shutdown_rx));

        info!(
            paths = config.paths.len(),
            pool_target = config.pool.target_size,
            "Rotation engine started"
        );

        Ok(Arc::new(Self {
            pool,
            registry,
            clients,
            factory,
            leases,
            events,
            shutdown_tx,
            stopping: AtomicBool::new(false),
            tasks: parking_lot::Mutex::new(tasks),
        }))
    }

    /// Lease one credential+client pair for a single request attempt
    pub async fn lease(&self, timeout: Duration) -> Result<Lease> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(EngineError::ShuttingDown);
        }
        self.leases.lease(timeout).await
    }

    /// Subscribe to engine observability events
    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            pool: self.pool.stats(),
            paths: self.registry.snapshots(),
            minted: self.factory.minted_count(),
            mint_failures: self.factory.failed_count(),
            leases_outstanding: self.leases.outstanding_count(),
        }
    }

    /// Stop minting, wait up to `drain_timeout` for in-flight leases,
    /// force-fail the stragglers, then close every warm client.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Rotation engine shutting down");

        let _ = self.shutdown_tx.send(true);
        self.pool.close();

        if !self.leases.wait_drain(drain_timeout).await {
            self.leases.force_reclaim_all();
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        futures::future::join_all(tasks).await;

        self.clients.shutdown().await;
        info!("Rotation engine stopped");
    }
}
