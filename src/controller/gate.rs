//! Startup barrier between cache population and reconciliation
//!
//! Each watched kind registers with the gate before its watcher starts and
//! reports once its initial listing is in the cache. The gate opens when the
//! last registered kind has reported and never closes again.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

/// Lifecycle of the gate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateState {
    /// Kinds are still being registered
    Uninitialized,
    /// Waiting for registered kinds to finish their initial sync
    Syncing,
    /// Every cache is populated; handlers may run
    Ready,
}

/// One-shot, monotonic readiness barrier
#[derive(Debug)]
pub struct ReadyGate {
    state: watch::Sender<GateState>,
    pending: Mutex<BTreeSet<String>>,
}

impl Default for ReadyGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyGate {
    /// Create a gate in [`GateState::Uninitialized`]
    pub fn new() -> Self {
        let (state, _) = watch::channel(GateState::Uninitialized);
        Self {
            state,
            pending: Mutex::new(BTreeSet::new()),
        }
    }

    /// Current state
    pub fn state(&self) -> GateState {
        *self.state.borrow()
    }

    /// Whether the gate has opened
    pub fn is_ready(&self) -> bool {
        self.state() == GateState::Ready
    }

    /// Add a kind that must sync before the gate opens; ignored once started
    pub fn register(&self, kind: impl Into<String>) {
        if self.state() != GateState::Uninitialized {
            return;
        }
        self.pending.lock().insert(kind.into());
    }

    /// Stop accepting registrations and start waiting for the registered kinds
    pub fn start(&self) {
        let pending = self.pending.lock();
        self.state.send_if_modified(|state| {
            if *state != GateState::Uninitialized {
                return false;
            }
            *state = if pending.is_empty() {
                GateState::Ready
            } else {
                GateState::Syncing
            };
            true
        });
        debug!(pending = ?*pending, state = ?self.state(), "Cache sync started");
    }

    /// Record that `kind` finished its initial sync
    pub fn mark_synced(&self, kind: &str) {
        let mut pending = self.pending.lock();
        if !pending.remove(kind) {
            return;
        }
        debug!(kind, remaining = pending.len(), "Cache synced");

        if pending.is_empty() {
            let opened = self.state.send_if_modified(|state| {
                if *state != GateState::Syncing {
                    return false;
                }
                *state = GateState::Ready;
                true
            });
            if opened {
                info!("All caches synced");
            }
        }
    }

    /// Kinds that have not finished their initial sync
    pub fn pending(&self) -> Vec<String> {
        self.pending.lock().iter().cloned().collect()
    }

    /// Resolve once the gate is open
    pub async fn wait_ready(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|state| *state == GateState::Ready).await;
    }
}
