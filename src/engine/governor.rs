//! Per-path request pacing
//!
//! Uses the governor crate for efficient, lock-free rate limiting, keyed
//! by egress path. A paced-out path makes the lease manager pick another
//! credential instead of burning the path's upstream budget.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovRateLimiter};
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::models::EgressPathId;

#[derive(Debug)]
struct PathLimiter {
    limiter: Arc<GovRateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    last_seen_ms: std::sync::atomic::AtomicU64,
}

impl PathLimiter {
    fn new(
        limiter: Arc<GovRateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
        now_ms: u64,
    ) -> Self {
        Self {
            limiter,
            last_seen_ms: std::sync::atomic::AtomicU64::new(now_ms),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Rate governor for egress paths
pub struct PathGovernor {
    /// Whether pacing is enabled (a zero limit disables it)
    enabled: bool,
    /// Limiters per path id
    limiters: Arc<DashMap<u32, PathLimiter>>,
    /// Request starts per second per path
    requests_per_second: NonZeroU32,
    /// Burst size
    burst_size: NonZeroU32,
    /// How long to keep per-path state without activity
    max_idle: Duration,
}

impl PathGovernor {
    /// Create a governor allowing `requests_per_second` starts per path.
    /// Zero disables pacing entirely.
    pub fn new(requests_per_second: u32) -> Self {
        Self {
            enabled: requests_per_second > 0,
            limiters: Arc::new(DashMap::new()),
            requests_per_second: NonZeroU32::new(requests_per_second.max(1)).unwrap(),
            burst_size: NonZeroU32::new(requests_per_second.max(1)).unwrap(),
            max_idle: Duration::from_secs(10 * 60),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Check whether a request may start on the given path
    pub fn check(&self, path_id: EgressPathId) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let limiter = self.get_or_create_limiter(path_id);

        match limiter.check() {
            Ok(_) => Ok(()),
            Err(_) => {
                debug!("Pacing limit reached for {}", path_id);
                Err(EngineError::PathRateLimited { path_id: path_id.0 })
            }
        }
    }

    fn get_or_create_limiter(
        &self,
        path_id: EgressPathId,
    ) -> Arc<GovRateLimiter<NotKeyed, InMemoryState, DefaultClock>> {
        let now_ms = now_ms();
        let entry = self.limiters.entry(path_id.0).or_insert_with(|| {
            let quota = Quota::per_second(self.requests_per_second).allow_burst(self.burst_size);
            PathLimiter::new(Arc::new(GovRateLimiter::direct(quota)), now_ms)
        });

        entry
            .last_seen_ms
            .store(now_ms, std::sync::atomic::Ordering::Relaxed);

        entry.limiter.clone()
    }

    /// Drop limiter state for paths idle longer than `max_idle`
    pub fn cleanup(&self) {
        let now_ms = now_ms();
        let max_idle_ms = self.max_idle.as_millis() as u64;

        self.limiters.retain(|_, entry| {
            let last_seen = entry
                .last_seen_ms
                .load(std::sync::atomic::Ordering::Relaxed);
            now_ms.saturating_sub(last_seen) <= max_idle_ms
        });
    }

    /// Number of paths with live pacing state
    pub fn tracked_paths(&self) -> usize {
        self.limiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_governor_disabled() {
        let governor = PathGovernor::new(0);
        assert!(!governor.is_enabled());
        for _ in 0..100 {
            assert!(governor.check(EgressPathId(1)).is_ok());
        }
    }

    #[test]
    fn test_governor_allows_within_limit() {
        let governor = PathGovernor::new(10);
        for i in 0..10 {
            assert!(
                governor.check(EgressPathId(1)).is_ok(),
                "Failed on request {}",
                i
            );
        }
    }

    #[test]
    fn test_governor_blocks_over_limit() {
        let governor = PathGovernor::new(2);

        assert!(governor.check(EgressPathId(1)).is_ok());
        assert!(governor.check(EgressPathId(1)).is_ok());
        assert!(matches!(
            governor.check(EgressPathId(1)),
            Err(EngineError::PathRateLimited { path_id: 1 })
        ));
    }

    #[test]
    fn test_governor_paces_paths_independently() {
        let governor = PathGovernor::new(1);

        assert!(governor.check(EgressPathId(1)).is_ok());
        assert!(governor.check(EgressPathId(2)).is_ok());
        assert!(governor.check(EgressPathId(3)).is_ok());

        assert!(governor.check(EgressPathId(1)).is_err());
        assert_eq!(governor.tracked_paths(), 3);
    }
}
