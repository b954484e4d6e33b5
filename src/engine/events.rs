//! Observability events emitted by the engine
//!
//! Events fan out over a bounded broadcast channel; external collectors
//! subscribe through [`EventSender::subscribe`]. Nothing is persisted here.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{CredentialId, EgressPathId, EgressStatus, RetireReason};

/// Engine observability event
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    PoolSize {
        size: usize,
        target: usize,
    },
    RefillRequested {
        deficit: usize,
    },
    MintSucceeded {
        path_id: EgressPathId,
        elapsed_ms: u64,
    },
    MintFailed {
        path_id: EgressPathId,
        error: String,
    },
    PathStatusChanged {
        path_id: EgressPathId,
        address: String,
        status: EgressStatus,
        health: f64,
    },
    LeaseGranted {
        credential_id: CredentialId,
        path_id: EgressPathId,
        wait_ms: u64,
    },
    LeaseReclaimed {
        credential_id: CredentialId,
        path_id: EgressPathId,
    },
    CredentialRetired {
        credential_id: CredentialId,
        path_id: EgressPathId,
        reason: RetireReason,
        requests_made: u32,
    },
}

/// Broadcast sender for engine events
///
/// Sending never fails; events are dropped when nobody subscribes,
/// and slow subscribers observe `Lagged` like any broadcast receiver.
#[derive(Clone)]
pub struct EventSender {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventSender {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
