//! Credential pool
//!
//! A bounded, health-ordered collection of ready credentials. Acquisition
//! pops the highest-scored credential and transitions it to `active`,
//! guaranteeing at most one concurrent holder. Dropping at or below the
//! low-water mark sends a non-blocking refill signal to the factory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use crate::config::{CredentialConfig, ExhaustedPolicy, PoolConfig};
use crate::engine::events::{EngineEvent, EventSender};
use crate::error::{EngineError, Result};
use crate::models::{Credential, RetireReason};

/// Outcome reported when a lease completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    Success,
    Failure(FailureReason),
}

/// Why a leased request failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Generic network or upstream error
    Network,
    /// Upstream explicitly rate limited the credential or its path
    RateLimited,
    /// The lease handle was dropped without completion
    Dropped,
}

/// Demand signal sent to the factory when the pool runs low
#[derive(Debug, Clone, Copy)]
pub struct RefillSignal {
    pub deficit: usize,
}

/// Pool statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub avg_health: f64,
    pub min_health: f64,
    pub max_health: f64,
}

struct PoolInner {
    /// Ready credentials, kept sorted by health score, best first
    ready: Vec<Credential>,
}

/// Bounded credential pool
pub struct CredentialPool {
    inner: Mutex<PoolInner>,
    /// Wakes one blocked `acquire` per inserted credential
    notify: Notify,
    refill_tx: mpsc::Sender<RefillSignal>,
    pool_cfg: PoolConfig,
    cred_cfg: CredentialConfig,
    events: EventSender,
    closed: AtomicBool,
}

impl CredentialPool {
    /// Create the pool and the receiving end of its refill channel.
    pub fn new(
        pool_cfg: PoolConfig,
        cred_cfg: CredentialConfig,
        events: EventSender,
    ) -> (Self, mpsc::Receiver<RefillSignal>) {
        let (refill_tx, refill_rx) = mpsc::channel(8);
        (
            Self {
                inner: Mutex::new(PoolInner { ready: Vec::new() }),
                notify: Notify::new(),
                refill_tx,
                pool_cfg,
                cred_cfg,
                events,
                closed: AtomicBool::new(false),
            },
            refill_rx,
        )
    }

    /// Add a freshly minted credential. Returns false when the pool is at
    /// `max_size` and the credential was discarded instead.
    pub fn insert(&self, credential: Credential) -> bool {
        if self.closed.load(Ordering::Acquire) {
            self.retire_with(credential, RetireReason::Shutdown);
            return false;
        }

        let now = Utc::now();
        let size = {
            let mut inner = self.inner.lock();
            if inner.ready.len() >= self.pool_cfg.max_size {
                drop(inner);
                self.retire_with(credential, RetireReason::Surplus);
                return false;
            }
            insert_by_health(&mut inner.ready, credential, now);
            inner.ready.len()
        };

        self.notify.notify_one();
        self.events.emit(EngineEvent::PoolSize {
            size,
            target: self.pool_cfg.target_size,
        });
        true
    }

    /// Remove and return the best ready credential, transitioned to
    /// `active`. Blocks up to `timeout`; a zero timeout fails fast.
    /// Timing out does not mutate any counters.
    pub async fn acquire(&self, timeout: Duration) -> Result<Credential> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(EngineError::ShuttingDown);
            }

            let (got, expired, size) = {
                let mut inner = self.inner.lock();
                let expired = sweep_expired(&mut inner.ready);
                let got = pop_leasable(&mut inner.ready);
                (got, expired, inner.ready.len())
            };

            for credential in expired {
                self.retire_with(credential, RetireReason::Expired);
            }
            self.maybe_signal_refill(size);

            if let Some(credential) = got {
                return Ok(credential);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(EngineError::PoolEmpty);
            }

            // Re-check after a wake-up or the deadline, whichever is first.
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }

    /// Return a credential untouched (no request counted). Used when the
    /// lease manager backs off a paced path.
    pub fn requeue(&self, credential: Credential) {
        let now = Utc::now();
        {
            let mut inner = self.inner.lock();
            insert_by_health(&mut inner.ready, credential, now);
        }
        self.notify.notify_one();
    }

    /// Record the outcome of one leased request and either re-queue or
    /// retire the credential.
    pub fn release(&self, mut credential: Credential, outcome: LeaseOutcome) {
        let now = Utc::now();
        let expired_mid_lease = credential.is_expired(now);

        if expired_mid_lease && self.pool_cfg.exhausted_policy == ExhaustedPolicy::Immediate {
            self.retire_with(credential, RetireReason::Expired);
            self.signal_refill_from_len();
            return;
        }

        credential.record_attempt();

        if let LeaseOutcome::Failure(reason) = outcome {
            credential.record_failure();

            if reason == FailureReason::RateLimited {
                // The upstream has flagged this credential; using it
                // further only draws attention.
                self.retire_with(credential, RetireReason::RateLimited);
                self.signal_refill_from_len();
                return;
            }

            if credential.failures >= self.cred_cfg.max_failures {
                self.retire_with(credential, RetireReason::Failures);
                self.signal_refill_from_len();
                return;
            }
        }

        if credential.remaining_budget() == 0 {
            credential.mark_exhausted();
            self.retire_with(credential, RetireReason::BudgetExhausted);
            self.signal_refill_from_len();
            return;
        }

        if expired_mid_lease {
            self.retire_with(credential, RetireReason::Expired);
            self.signal_refill_from_len();
            return;
        }

        self.insert(credential);
    }

    /// Retire a credential held outside the pool (e.g. its path was
    /// banned while leased out) without counting a request.
    pub fn discard(&self, credential: Credential, reason: RetireReason) {
        self.retire_with(credential, reason);
        self.signal_refill_from_len();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().ready.len()
    }

    pub fn target_size(&self) -> usize {
        self.pool_cfg.target_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PoolStats {
        let now = Utc::now();
        let inner = self.inner.lock();
        if inner.ready.is_empty() {
            return PoolStats {
                size: 0,
                avg_health: 0.0,
                min_health: 0.0,
                max_health: 0.0,
            };
        }

        let scores: Vec<f64> = inner.ready.iter().map(|c| c.health_score(now)).collect();
        PoolStats {
            size: scores.len(),
            avg_health: scores.iter().sum::<f64>() / scores.len() as f64,
            min_health: scores.iter().cloned().fold(f64::INFINITY, f64::min),
            max_health: scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        }
    }

    /// Stop handing out credentials and retire everything still pooled.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<Credential> = {
            let mut inner = self.inner.lock();
            inner.ready.drain(..).collect()
        };
        for credential in drained {
            self.retire_with(credential, RetireReason::Shutdown);
        }
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn retire_with(&self, mut credential: Credential, reason: RetireReason) {
        credential.retire();
        debug!(credential = %credential.id, reason = %reason, "Credential retired");
        self.events.emit(EngineEvent::CredentialRetired {
            credential_id: credential.id,
            path_id: credential.path_id,
            reason,
            requests_made: credential.requests_made,
        });
    }

    fn signal_refill_from_len(&self) {
        let size = self.len();
        self.maybe_signal_refill(size);
    }

    /// Non-blocking demand signal; dropping it when the channel is full is
    /// fine because the factory also tops up on a timer.
    fn maybe_signal_refill(&self, size: usize) {
        if self.closed.load(Ordering::Acquire) || size > self.pool_cfg.low_water {
            return;
        }
        let deficit = self.pool_cfg.target_size.saturating_sub(size);
        if deficit == 0 {
            return;
        }
        if self.refill_tx.try_send(RefillSignal { deficit }).is_ok() {
            self.events.emit(EngineEvent::RefillRequested { deficit });
        }
    }
}

fn insert_by_health(ready: &mut Vec<Credential>, credential: Credential, now: chrono::DateTime<chrono::Utc>) {
    let score = credential.health_score(now);
    let idx = ready
        .partition_point(|c| c.health_score(now) >= score);
    ready.insert(idx, credential);
}

fn sweep_expired(ready: &mut Vec<Credential>) -> Vec<Credential> {
    let now = Utc::now();
    let mut expired = Vec::new();
    let mut i = 0;
    while i < ready.len() {
        if ready[i].is_expired(now) {
            expired.push(ready.remove(i));
        } else {
            i += 1;
        }
    }
    expired
}

fn pop_leasable(ready: &mut Vec<Credential>) -> Option<Credential> {
    let now = Utc::now();
    let idx = ready.iter().position(|c| c.is_leasable(now))?;
    let mut credential = ready.remove(idx);
    // Removal above makes this the only live handle to the credential.
    if !credential.begin_lease() {
        return None;
    }
    Some(credential)
}
