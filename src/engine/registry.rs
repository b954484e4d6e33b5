//! Egress path registry
//!
//! Tracks path health and eligibility, selects paths for minting and
//! leasing via health-weighted round robin, and handles the
//! degraded/banned/probation lifecycle.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::RegistryConfig;
use crate::engine::events::{EngineEvent, EventSender};
use crate::error::{EngineError, Result};
use crate::models::{EgressPath, EgressPathConfig, EgressPathId, EgressStatus, PathSnapshot};

/// Outcome of an operation attributed to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathOutcome {
    Success,
    Failure,
    /// Upstream rate limiting; weighted harsher than a generic failure
    RateLimited,
}

/// EWMA smoothing factor for the decayed health score
const HEALTH_ALPHA: f64 = 0.2;
/// Consecutive failures before a healthy path is deprioritized
const DEGRADE_AFTER: u32 = 3;
/// How many failures one rate-limited outcome counts as
const RATE_LIMIT_WEIGHT: u32 = 3;
/// Health a degraded path must regain to be healthy again
const RECOVER_HEALTH: f64 = 0.7;
/// Health assigned to a path re-entering rotation after a ban
const PROBATION_HEALTH: f64 = 0.5;

/// Registry of configured egress paths
pub struct EgressRegistry {
    paths: Mutex<Vec<EgressPath>>,
    cfg: RegistryConfig,
    events: EventSender,
}

impl EgressRegistry {
    pub fn new(
        configs: &[EgressPathConfig],
        cfg: RegistryConfig,
        events: EventSender,
    ) -> Result<Self> {
        if configs.is_empty() {
            return Err(EngineError::InvalidConfig(
                "at least one egress path is required".into(),
            ));
        }

        let paths = configs
            .iter()
            .enumerate()
            .map(|(i, config)| {
                EgressPath::new(EgressPathId(i as u32 + 1), Arc::new(config.clone()))
            })
            .collect();

        Ok(Self {
            paths: Mutex::new(paths),
            cfg,
            events,
        })
    }

    /// Select the best eligible path: healthy before degraded, higher
    /// health first, least-recently-used breaking ties. Banned paths are
    /// skipped until their cooldown lapses, then re-enter degraded.
    pub fn select_path(&self) -> Result<(EgressPathId, Arc<EgressPathConfig>)> {
        let now = Instant::now();
        let mut paths = self.paths.lock();
        let mut changes = Vec::new();

        // Lift expired bans into probation before selecting.
        for path in paths.iter_mut() {
            if path.status == EgressStatus::Banned {
                if let Some(until) = path.banned_until {
                    if now >= until {
                        path.status = EgressStatus::Degraded;
                        path.health = PROBATION_HEALTH;
                        path.consecutive_failures = 0;
                        path.banned_until = None;
                        changes.push(status_event(path));
                    }
                }
            }
        }

        let best = paths
            .iter_mut()
            .filter(|p| p.status.is_selectable())
            .min_by(|a, b| {
                (a.status != EgressStatus::Healthy)
                    .cmp(&(b.status != EgressStatus::Healthy))
                    .then(
                        b.health
                            .partial_cmp(&a.health)
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
                    .then_with(|| cmp_last_used(a.last_used, b.last_used))
            });

        let result = match best {
            Some(path) => {
                path.last_used = Some(now);
                Ok((path.id, path.config.clone()))
            }
            None => Err(EngineError::NoHealthyPath),
        };

        drop(paths);
        for event in changes {
            self.events.emit(event);
        }
        result
    }

    /// Record the outcome of a mint or leased request on a path
    pub fn report_outcome(&self, path_id: EgressPathId, outcome: PathOutcome) {
        let now = Instant::now();
        let mut paths = self.paths.lock();
        let Some(path) = paths.iter_mut().find(|p| p.id == path_id) else {
            return;
        };

        let mut change = None;
        match outcome {
            PathOutcome::Success => {
                path.successes += 1;
                path.consecutive_failures = 0;
                path.health = path.health * (1.0 - HEALTH_ALPHA) + HEALTH_ALPHA;
                if path.status == EgressStatus::Degraded && path.health >= RECOVER_HEALTH {
                    path.status = EgressStatus::Healthy;
                    change = Some(status_event(path));
                }
            }
            PathOutcome::Failure | PathOutcome::RateLimited => {
                let rate_limited = outcome == PathOutcome::RateLimited;
                let weight = if rate_limited { RATE_LIMIT_WEIGHT } else { 1 };

                path.failures += 1;
                path.consecutive_failures += weight;
                for _ in 0..weight {
                    path.health *= 1.0 - HEALTH_ALPHA;
                }

                if path.consecutive_failures >= self.cfg.failure_threshold {
                    let cooldown = if rate_limited {
                        self.cfg.ban_cooldown * 2
                    } else {
                        self.cfg.ban_cooldown
                    };
                    path.status = EgressStatus::Banned;
                    path.banned_until = Some(now + cooldown);
                    warn!(
                        path = %path.config.address(),
                        cooldown_ms = cooldown.as_millis() as u64,
                        rate_limited,
                        "Egress path banned"
                    );
                    change = Some(status_event(path));
                } else if path.consecutive_failures >= DEGRADE_AFTER
                    && path.status == EgressStatus::Healthy
                {
                    path.status = EgressStatus::Degraded;
                    info!(path = %path.config.address(), "Egress path degraded");
                    change = Some(status_event(path));
                }
            }
        }

        drop(paths);
        if let Some(event) = change {
            self.events.emit(event);
        }
    }

    /// Look up a path's configuration
    pub fn config(&self, path_id: EgressPathId) -> Option<Arc<EgressPathConfig>> {
        self.paths
            .lock()
            .iter()
            .find(|p| p.id == path_id)
            .map(|p| p.config.clone())
    }

    pub fn is_banned(&self, path_id: EgressPathId) -> bool {
        self.paths
            .lock()
            .iter()
            .find(|p| p.id == path_id)
            .map(|p| p.status == EgressStatus::Banned)
            .unwrap_or(false)
    }

    /// Number of paths currently eligible for selection
    pub fn available_count(&self) -> usize {
        self.paths
            .lock()
            .iter()
            .filter(|p| p.status.is_selectable())
            .count()
    }

    pub fn snapshots(&self) -> Vec<PathSnapshot> {
        self.paths.lock().iter().map(|p| p.snapshot()).collect()
    }
}

fn status_event(path: &EgressPath) -> EngineEvent {
    EngineEvent::PathStatusChanged {
        path_id: path.id,
        address: path.config.address(),
        status: path.status,
        health: path.health,
    }
}

fn cmp_last_used(a: Option<Instant>, b: Option<Instant>) -> std::cmp::Ordering {
    // Never-used paths sort first.
    match (a, b) {
        (None, None) => std::cmp::Ordering::Equal,
        (None, Some(_)) => std::cmp::Ordering::Less,
        (Some(_), None) => std::cmp::Ordering::Greater,
        (Some(a), Some(b)) => a.cmp(&b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_paths(n: usize) -> Vec<EgressPathConfig> {
        (0..n)
            .map(|i| {
                EgressPathConfig::parse(&format!("http://proxy{}.example:3128", i + 1)).unwrap()
            })
            .collect()
    }

    fn test_registry(n: usize, cfg: RegistryConfig) -> EgressRegistry {
        EgressRegistry::new(&test_paths(n), cfg, EventSender::new(64)).unwrap()
    }

    #[test]
    fn test_empty_registry_rejected() {
        let err = EgressRegistry::new(&[], RegistryConfig::default(), EventSender::new(4));
        assert!(matches!(err, Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn test_selection_rotates_by_least_recently_used() {
        let registry = test_registry(3, RegistryConfig::default());

        // Equal health: selection cycles through all paths before repeating.
        let first = registry.select_path().unwrap().0;
        let second = registry.select_path().unwrap().0;
        let third = registry.select_path().unwrap().0;
        let mut seen = vec![first.0, second.0, third.0];
        seen.sort();
        assert_eq!(seen, vec![1, 2, 3]);

        // Fourth selection wraps to the least recently used.
        assert_eq!(registry.select_path().unwrap().0, first);
    }

    #[test]
    fn test_unhealthy_path_deprioritized() {
        let registry = test_registry(2, RegistryConfig::default());

        // Two failures on path 1: still healthy but lower health score.
        registry.report_outcome(EgressPathId(1), PathOutcome::Failure);
        registry.report_outcome(EgressPathId(1), PathOutcome::Failure);

        assert_eq!(registry.select_path().unwrap().0, EgressPathId(2));
    }

    #[test]
    fn test_degraded_after_three_consecutive_failures() {
        let registry = test_registry(1, RegistryConfig::default());

        for _ in 0..3 {
            registry.report_outcome(EgressPathId(1), PathOutcome::Failure);
        }

        let snap = &registry.snapshots()[0];
        assert_eq!(snap.status, EgressStatus::Degraded);

        // Degraded paths remain selectable.
        assert!(registry.select_path().is_ok());

        // A success run restores health and status.
        for _ in 0..10 {
            registry.report_outcome(EgressPathId(1), PathOutcome::Success);
        }
        assert_eq!(registry.snapshots()[0].status, EgressStatus::Healthy);
    }

    #[test]
    fn test_ban_after_threshold_and_no_healthy_path() {
        let cfg = RegistryConfig {
            failure_threshold: 3,
            ..RegistryConfig::default()
        };
        let registry = test_registry(2, cfg);

        for _ in 0..3 {
            registry.report_outcome(EgressPathId(1), PathOutcome::Failure);
        }
        assert!(registry.is_banned(EgressPathId(1)));

        // The banned path is skipped in favor of the other one.
        for _ in 0..4 {
            assert_eq!(registry.select_path().unwrap().0, EgressPathId(2));
        }

        for _ in 0..3 {
            registry.report_outcome(EgressPathId(2), PathOutcome::Failure);
        }
        assert!(matches!(
            registry.select_path(),
            Err(EngineError::NoHealthyPath)
        ));
        assert_eq!(registry.available_count(), 0);
    }

    #[test]
    fn test_rate_limited_outcome_is_weighted_harsher() {
        let cfg = RegistryConfig {
            failure_threshold: 3,
            ..RegistryConfig::default()
        };
        let registry = test_registry(1, cfg);

        // One rate-limited outcome counts as three failures: instant ban.
        registry.report_outcome(EgressPathId(1), PathOutcome::RateLimited);
        assert!(registry.is_banned(EgressPathId(1)));
    }

    #[test]
    fn test_ban_cooldown_releases_into_probation() {
        let cfg = RegistryConfig {
            failure_threshold: 2,
            ban_cooldown: Duration::from_millis(20),
            ..RegistryConfig::default()
        };
        let registry = test_registry(1, cfg);

        registry.report_outcome(EgressPathId(1), PathOutcome::Failure);
        registry.report_outcome(EgressPathId(1), PathOutcome::Failure);
        assert!(matches!(
            registry.select_path(),
            Err(EngineError::NoHealthyPath)
        ));

        std::thread::sleep(Duration::from_millis(40));

        // Cooldown elapsed: selectable again, but on probation.
        let (id, _) = registry.select_path().unwrap();
        assert_eq!(id, EgressPathId(1));
        let snap = &registry.snapshots()[0];
        assert_eq!(snap.status, EgressStatus::Degraded);
        assert!((snap.health - PROBATION_HEALTH).abs() < 1e-9);
    }

    #[test]
    fn test_config_lookup() {
        let registry = test_registry(2, RegistryConfig::default());
        let cfg = registry.config(EgressPathId(2)).unwrap();
        assert_eq!(cfg.host, "proxy2.example");
        assert!(registry.config(EgressPathId(99)).is_none());
    }
}
