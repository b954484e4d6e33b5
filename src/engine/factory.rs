//! Credential factory
//!
//! A fixed-size worker group that keeps the pool stocked. Workers wait on
//! a demand semaphore fed by the pool's refill signals and a periodic
//! top-up tick, mint one credential per permit through a registry-selected
//! path, and report every outcome back to the registry. Failed mints back
//! off exponentially with jitter.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, instrument, warn};

use crate::client::WarmClientCache;
use crate::config::{CredentialConfig, FactoryConfig};
use crate::engine::events::{EngineEvent, EventSender};
use crate::engine::pool::{CredentialPool, RefillSignal};
use crate::engine::registry::{EgressRegistry, PathOutcome};
use crate::error::{EngineError, Result};
use crate::mint::CredentialMinter;
use crate::models::Credential;

/// Background credential factory
pub struct CredentialFactory {
    pool: Arc<CredentialPool>,
    registry: Arc<EgressRegistry>,
    clients: Arc<WarmClientCache>,
    minter: Arc<dyn CredentialMinter>,
    cfg: FactoryConfig,
    cred_cfg: CredentialConfig,
    /// Mint permits; workers consume one per attempt
    demand: Semaphore,
    /// Mints currently in flight, counted against new demand
    inflight: AtomicUsize,
    minted: AtomicU64,
    failed: AtomicU64,
    events: EventSender,
}

impl CredentialFactory {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<CredentialPool>,
        registry: Arc<EgressRegistry>,
        clients: Arc<WarmClientCache>,
        minter: Arc<dyn CredentialMinter>,
        cfg: FactoryConfig,
        cred_cfg: CredentialConfig,
        events: EventSender,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            registry,
            clients,
            minter,
            cfg,
            cred_cfg,
            demand: Semaphore::new(0),
            inflight: AtomicUsize::new(0),
            minted: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            events,
        })
    }

    /// Spawn the coordinator and worker tasks. Returns their handles so
    /// the engine can join them on shutdown.
    pub fn spawn(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
        refill_rx: mpsc::Receiver<RefillSignal>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.cfg.worker_count + 1);

        let coordinator = self.clone();
        let coordinator_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            coordinator
                .run_coordinator(coordinator_shutdown, refill_rx)
                .await;
        }));

        for worker_id in 0..self.cfg.worker_count {
            let worker = self.clone();
            let worker_shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                worker.run_worker(worker_id, worker_shutdown).await;
            }));
        }

        info!(
            workers = self.cfg.worker_count,
            target = self.pool.target_size(),
            "Credential factory started"
        );
        handles
    }

    /// Translate current pool state into new mint permits, capping at the
    /// deficit so concurrent demand never over-provisions.
    fn grant_demand(&self, requested: usize) {
        let inflight = self.inflight.load(Ordering::Acquire);
        let queued = self.demand.available_permits();
        let supply = self.pool.len() + inflight + queued;
        let want = requested.min(self.pool.target_size().saturating_sub(supply));
        if want > 0 {
            debug!(permits = want, "Granting mint demand");
            self.demand.add_permits(want);
        }
    }

    #[instrument(skip_all)]
    async fn run_coordinator(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        mut refill_rx: mpsc::Receiver<RefillSignal>,
    ) {
        // Initial fill toward target.
        self.grant_demand(self.pool.target_size());

        let mut ticker = interval(self.cfg.topup_interval);
        ticker.tick().await; // Skip immediate tick

        loop {
            tokio::select! {
                signal = refill_rx.recv() => {
                    match signal {
                        Some(signal) => self.grant_demand(signal.deficit),
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    self.grant_demand(self.pool.target_size());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Factory coordinator shutting down");
                        break;
                    }
                }
            }
        }
    }

    #[instrument(skip(self, shutdown))]
    async fn run_worker(self: Arc<Self>, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = self.cfg.backoff_base;

        loop {
            tokio::select! {
                permit = self.demand.acquire() => {
                    match permit {
                        Ok(permit) => permit.forget(),
                        Err(_) => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!(worker_id, "Factory worker shutting down");
                        break;
                    }
                    continue;
                }
            }

            if *shutdown.borrow() {
                break;
            }

            self.inflight.fetch_add(1, Ordering::AcqRel);
            let result = self.mint_one().await;
            self.inflight.fetch_sub(1, Ordering::AcqRel);

            match result {
                Ok(()) => {
                    backoff = self.cfg.backoff_base;
                }
                Err(e) => {
                    let sleep_for = with_jitter(backoff);
                    debug!(
                        worker_id,
                        backoff_ms = sleep_for.as_millis() as u64,
                        "Mint failed: {}", e
                    );
                    backoff = (backoff * 2).min(self.cfg.backoff_max);

                    tokio::select! {
                        _ = tokio::time::sleep(sleep_for) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Mint a single credential and insert it into the pool
    async fn mint_one(&self) -> Result<()> {
        let (path_id, path_cfg) = self.registry.select_path()?;
        let client = self.clients.get(path_id, path_cfg.clone());

        let started = Instant::now();
        let minted = match tokio::time::timeout(
            self.cfg.mint_timeout,
            self.minter.mint(&path_cfg, &client),
        )
        .await
        {
            Ok(Ok(minted)) => minted,
            Ok(Err(e)) => return self.record_mint_failure(path_id, e),
            Err(_) => return self.record_mint_failure(path_id, EngineError::Timeout),
        };

        let credential = Credential::new(
            path_id,
            minted.token,
            minted.csrf,
            self.cred_cfg.max_requests,
            self.cred_cfg.ttl,
        );

        self.registry.report_outcome(path_id, PathOutcome::Success);
        self.minted.fetch_add(1, Ordering::Relaxed);
        self.events.emit(EngineEvent::MintSucceeded {
            path_id,
            elapsed_ms: started.elapsed().as_millis() as u64,
        });

        self.pool.insert(credential);
        Ok(())
    }

    fn record_mint_failure(&self, path_id: crate::models::EgressPathId, e: EngineError) -> Result<()> {
        let outcome = if e.is_rate_limited() {
            PathOutcome::RateLimited
        } else {
            PathOutcome::Failure
        };
        self.registry.report_outcome(path_id, outcome);
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.events.emit(EngineEvent::MintFailed {
            path_id,
            error: e.to_string(),
        });

        // A path banned by this failure loses its warm session too.
        if self.registry.is_banned(path_id) {
            warn!(path = %path_id, "Path banned after mint failure");
            self.clients.evict(path_id);
        }

        Err(e)
    }

    pub fn minted_count(&self) -> u64 {
        self.minted.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }
}

/// Add up to 50% random jitter so workers retrying the same dead path
/// do not retry in lockstep
fn with_jitter(base: Duration) -> Duration {
    let jitter_ms = rand::thread_rng().gen_range(0..=(base.as_millis() as u64 / 2).max(1));
    base + Duration::from_millis(jitter_ms)
}
