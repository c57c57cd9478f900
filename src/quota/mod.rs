//! Quota admission control
//!
//! [`Quota`] bounds the number of concurrently secured resources. Each
//! resource identifier holds an *acquired* amount (committed) and at most one
//! *pending* amount (reserved by an open [`Tx`]). At every observable instant
//! `sum(acquired) + sum(pending) <= max`.
//!
//! Admission is two-phase: [`Quota::tx`] reserves, then [`Tx::commit`] moves the
//! reservation into the acquired amount or [`Tx::rollback`] discards it. A
//! transaction dropped without either is rolled back.

mod reporter;

pub use reporter::{run_reporter, UsageReporter};

#[cfg(test)]
pub use reporter::MockUsageReporter;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

/// Reasons a quota transaction is refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaError {
    /// The quota ceiling is zero or negative
    #[error("quota is disabled")]
    Disabled,

    /// The resource already has an open transaction
    #[error("resource {resource} already has a pending transaction")]
    PendingTransaction {
        /// Resource identifier
        resource: String,
    },

    /// Admitting the amount would overshoot the ceiling
    #[error("quota exceeded for {resource}: requested {requested}, in use {in_use}, max {max}")]
    Exceeded {
        /// Resource identifier
        resource: String,
        /// Amount requested by the transaction
        requested: i64,
        /// Acquired plus pending amount across all resources
        in_use: i64,
        /// Quota ceiling
        max: i64,
    },
}

#[derive(Debug, Default)]
struct QuotaState {
    acquired: HashMap<String, i64>,
    pending: HashMap<String, i64>,
}

impl QuotaState {
    fn total_in_use(&self) -> i64 {
        self.acquired.values().sum::<i64>() + self.pending.values().sum::<i64>()
    }

    fn acquired_by(&self, resource: &str) -> i64 {
        self.acquired.get(resource).copied().unwrap_or(0)
    }

    /// Check that replacing `resource`'s acquired amount with `amount` fits
    fn check_admission(&self, resource: &str, amount: i64, max: i64) -> Result<(), QuotaError> {
        if self.pending.contains_key(resource) {
            return Err(QuotaError::PendingTransaction {
                resource: resource.to_string(),
            });
        }

        let in_use = self.total_in_use();
        let diff = amount - self.acquired_by(resource);
        if in_use + diff > max {
            return Err(QuotaError::Exceeded {
                resource: resource.to_string(),
                requested: amount,
                in_use,
                max,
            });
        }
        Ok(())
    }
}

/// Thread-safe admission controller with a global ceiling
#[derive(Debug)]
pub struct Quota {
    max: i64,
    state: RwLock<QuotaState>,
}

impl Quota {
    /// Create a quota with ceiling `max`; a ceiling of zero or less disables it
    pub fn new(max: i64) -> Self {
        Self {
            max,
            state: RwLock::new(QuotaState::default()),
        }
    }

    /// Quota ceiling
    pub fn max(&self) -> i64 {
        self.max
    }

    /// Whether the quota admits anything at all
    pub fn is_enabled(&self) -> bool {
        self.max > 0
    }

    /// Open a transaction reserving `amount` for `resource_id`.
    ///
    /// The amount replaces whatever the resource currently has acquired once
    /// committed, so only the difference counts against the ceiling.
    pub fn tx(&self, resource_id: &str, amount: i64) -> Result<Tx<'_>, QuotaError> {
        if !self.is_enabled() {
            return Err(QuotaError::Disabled);
        }

        if amount == 0 {
            let mut state = self.state.write();
            if state.pending.contains_key(resource_id) {
                return Err(QuotaError::PendingTransaction {
                    resource: resource_id.to_string(),
                });
            }
            state.pending.insert(resource_id.to_string(), 0);
            return Ok(Tx::new(self, resource_id));
        }

        if amount > self.max {
            return Err(QuotaError::Exceeded {
                resource: resource_id.to_string(),
                requested: amount,
                in_use: self.state.read().total_in_use(),
                max: self.max,
            });
        }

        // Cheap check under the shared lock first; most rejections stop here.
        self.state.read().check_admission(resource_id, amount, self.max)?;

        // A concurrent tx may have registered between the two locks.
        let mut state = self.state.write();
        state.check_admission(resource_id, amount, self.max)?;
        state.pending.insert(resource_id.to_string(), amount);

        debug!(resource = %resource_id, amount, "Quota reserved");
        Ok(Tx::new(self, resource_id))
    }

    /// Sum of all acquired amounts
    pub fn used(&self) -> i64 {
        self.state.read().acquired.values().sum()
    }

    /// Amount currently acquired by one resource
    pub fn acquired_by(&self, resource_id: &str) -> i64 {
        self.state.read().acquired_by(resource_id)
    }

    fn commit(&self, resource_id: &str) {
        let mut state = self.state.write();
        if let Some(amount) = state.pending.remove(resource_id) {
            if amount == 0 {
                state.acquired.remove(resource_id);
            } else {
                state.acquired.insert(resource_id.to_string(), amount);
            }
        }
    }

    fn rollback(&self, resource_id: &str) {
        self.state.write().pending.remove(resource_id);
    }
}

/// An open reservation against a [`Quota`]
///
/// Exactly one of [`Tx::commit`] or [`Tx::rollback`] takes effect; later calls
/// are no-ops. Dropping an unfinished transaction rolls it back.
#[derive(Debug)]
pub struct Tx<'a> {
    quota: &'a Quota,
    resource_id: String,
    finalized: AtomicBool,
}

impl<'a> Tx<'a> {
    fn new(quota: &'a Quota, resource_id: &str) -> Self {
        Self {
            quota,
            resource_id: resource_id.to_string(),
            finalized: AtomicBool::new(false),
        }
    }

    /// Resource identifier this transaction reserves for
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Move the pending amount into the acquired amount
    pub fn commit(&self) {
        if self.finalize() {
            self.quota.commit(&self.resource_id);
            debug!(resource = %self.resource_id, "Quota committed");
        }
    }

    /// Discard the pending amount
    pub fn rollback(&self) {
        if self.finalize() {
            self.quota.rollback(&self.resource_id);
            debug!(resource = %self.resource_id, "Quota rolled back");
        }
    }

    /// Returns true for the single caller that wins the transition
    fn finalize(&self) -> bool {
        self.finalized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        self.rollback();
    }
}
