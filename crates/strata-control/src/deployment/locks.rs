//! Per-deployment exclusive locks.
//!
//! An entry exists only while an operation holds it; dropping the guard
//! removes it, so the table never grows beyond the number of in-flight
//! operations. The entry carries the operation's cancellation token, which
//! is how [`LockTable::cancel`] reaches a running engine call.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ControlError, ControlResult};
use crate::types::DeploymentId;

#[derive(Debug)]
struct Held {
    activity: &'static str,
    token: CancellationToken,
}

/// Table of deployments with an operation in flight.
#[derive(Debug, Clone, Default)]
pub struct LockTable {
    entries: Arc<DashMap<DeploymentId, Held>>,
}

impl LockTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `id`, failing fast if another operation holds it.
    ///
    /// `activity` names the holder in conflict errors (`"apply"`,
    /// `"recovery"`).
    pub fn try_lock(&self, id: &DeploymentId, activity: &'static str) -> ControlResult<LockGuard> {
        match self.entries.entry(id.clone()) {
            Entry::Occupied(held) => Err(ControlError::conflict(format!(
                "{} already in flight for deployment {id}",
                held.get().activity
            ))),
            Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                slot.insert(Held {
                    activity,
                    token: token.clone(),
                });
                debug!(deployment_id = %id, activity, "lock acquired");
                Ok(LockGuard {
                    id: id.clone(),
                    token,
                    entries: Arc::clone(&self.entries),
                })
            }
        }
    }

    /// Signal cancellation to the operation holding `id`.
    ///
    /// Returns false if nothing is in flight for it.
    pub fn cancel(&self, id: &DeploymentId) -> bool {
        self.entries.get(id).is_some_and(|held| {
            held.token.cancel();
            true
        })
    }

    /// Returns true if an operation holds `id`.
    #[must_use]
    pub fn is_locked(&self, id: &DeploymentId) -> bool {
        self.entries.contains_key(id)
    }

    /// Deployments with an operation in flight, and what is running.
    #[must_use]
    pub fn in_flight(&self) -> Vec<(DeploymentId, &'static str)> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().activity))
            .collect()
    }
}

/// Exclusive hold on one deployment. Released on drop.
#[derive(Debug)]
pub struct LockGuard {
    id: DeploymentId,
    token: CancellationToken,
    entries: Arc<DashMap<DeploymentId, Held>>,
}

impl LockGuard {
    /// The locked deployment.
    #[must_use]
    pub const fn id(&self) -> &DeploymentId {
        &self.id
    }

    /// Cancellation token for the operation holding the lock.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.entries.remove(&self.id);
        debug!(deployment_id = %self.id, "lock released");
    }
}
