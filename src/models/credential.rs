use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::EgressPathId;

/// Stable identifier for a credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CredentialId(pub Uuid);

impl CredentialId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CredentialId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CredentialId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Credential lifecycle state
///
/// Transitions are monotonic: fresh -> active -> exhausted -> retired.
/// A credential never returns to an earlier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CredentialState {
    #[default]
    Fresh,
    Active,
    Exhausted,
    Retired,
}

impl CredentialState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialState::Fresh => "fresh",
            CredentialState::Active => "active",
            CredentialState::Exhausted => "exhausted",
            CredentialState::Retired => "retired",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "fresh" => Some(CredentialState::Fresh),
            "active" => Some(CredentialState::Active),
            "exhausted" => Some(CredentialState::Exhausted),
            "retired" => Some(CredentialState::Retired),
            _ => None,
        }
    }

    pub fn is_leasable(&self) -> bool {
        matches!(self, CredentialState::Fresh | CredentialState::Active)
    }
}

impl std::fmt::Display for CredentialState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a credential left the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetireReason {
    BudgetExhausted,
    Expired,
    Failures,
    RateLimited,
    PathBanned,
    Surplus,
    Shutdown,
    Reclaimed,
}

impl RetireReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetireReason::BudgetExhausted => "budget_exhausted",
            RetireReason::Expired => "expired",
            RetireReason::Failures => "failures",
            RetireReason::RateLimited => "rate_limited",
            RetireReason::PathBanned => "path_banned",
            RetireReason::Surplus => "surplus",
            RetireReason::Shutdown => "shutdown",
            RetireReason::Reclaimed => "reclaimed",
        }
    }
}

impl std::fmt::Display for RetireReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One disposable authentication unit, bound to an egress path
#[derive(Debug, Clone, Serialize)]
pub struct Credential {
    pub id: CredentialId,
    pub path_id: EgressPathId,
    #[serde(skip_serializing)]
    pub token: String,
    #[serde(skip_serializing)]
    pub csrf: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_requests: u32,
    pub requests_made: u32,
    pub failures: u32,
    state: CredentialState,
}

impl Credential {
    pub fn new(
        path_id: EgressPathId,
        token: String,
        csrf: String,
        max_requests: u32,
        ttl: Option<std::time::Duration>,
    ) -> Self {
        let created_at = Utc::now();
        let expires_at = ttl.and_then(|ttl| {
            ChronoDuration::from_std(ttl)
                .ok()
                .map(|d| created_at + d)
        });
        Self {
            id: CredentialId::new(),
            path_id,
            token,
            csrf,
            created_at,
            expires_at,
            max_requests,
            requests_made: 0,
            failures: 0,
            state: CredentialState::Fresh,
        }
    }

    pub fn state(&self) -> CredentialState {
        self.state
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }

    pub fn remaining_budget(&self) -> u32 {
        self.max_requests.saturating_sub(self.requests_made)
    }

    /// Whether this credential may be handed to a lease holder.
    pub fn is_leasable(&self, now: DateTime<Utc>) -> bool {
        self.state.is_leasable() && !self.is_expired(now) && self.remaining_budget() > 0
    }

    /// Transition for acquisition. Guarantees at-most-one concurrent holder
    /// because the pool removes the credential before calling this.
    pub fn begin_lease(&mut self) -> bool {
        match self.state {
            CredentialState::Fresh | CredentialState::Active => {
                self.state = CredentialState::Active;
                true
            }
            _ => false,
        }
    }

    /// Count one request attempt against the budget.
    pub fn record_attempt(&mut self) {
        debug_assert!(self.requests_made < self.max_requests);
        self.requests_made = (self.requests_made + 1).min(self.max_requests);
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
    }

    pub fn mark_exhausted(&mut self) {
        if self.state < CredentialState::Exhausted {
            self.state = CredentialState::Exhausted;
        }
    }

    /// Terminal transition. Irreversible.
    pub fn retire(&mut self) {
        self.state = CredentialState::Retired;
    }

    /// Health score in 0.1..=1.0; higher is better. Penalizes recorded
    /// failures and age relative to TTL.
    pub fn health_score(&self, now: DateTime<Utc>) -> f64 {
        let mut score = 1.0 - 0.2 * f64::from(self.failures.min(4));

        if let Some(expires_at) = self.expires_at {
            let ttl = (expires_at - self.created_at).num_milliseconds().max(1) as f64;
            let age = (now - self.created_at).num_milliseconds().max(0) as f64;
            score -= (age / ttl).min(1.0) * 0.3;
        }

        score.max(0.1)
    }
}
