//! Rondo - Credential & Client Rotation Engine
//!
//! Keeps a fleet of short-lived, proxy-bound guest credentials and warm
//! network clients alive and rotating against a hostile, rate-limiting
//! upstream.
//!
//! ## Features
//!
//! - Bounded credential pool with health-ordered acquisition and
//!   asynchronous low-water refill
//! - Fixed-size minting worker group with backoff and jitter
//! - Egress path registry with decayed health scores, degraded/banned
//!   states, and cooldown probation
//! - One warm, reusable HTTP session per egress path (HTTP CONNECT,
//!   SOCKS5, or direct)
//! - Exclusive time-bounded leases with defensive reclamation
//! - Per-path request pacing and observability events

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod mint;
pub mod models;

pub use config::Config;
pub use engine::{EngineEvent, EngineStats, Lease, LeaseOutcome, RotationEngine};
pub use error::{EngineError, Result};
pub use mint::{CredentialMinter, HttpMinter};
