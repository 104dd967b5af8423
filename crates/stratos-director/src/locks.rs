//! Per-instance serialisation of provisioning attempts.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::types::InstanceId;

type LockMap = DashMap<InstanceId, Arc<Mutex<()>>>;

/// Lock map keyed by instance id.
///
/// Attempts for the same instance run one at a time; attempts for different
/// instances do not contend. Clones share the same map.
#[derive(Debug, Default, Clone)]
pub struct InstanceLocks {
    locks: Arc<LockMap>,
}

impl InstanceLocks {
    /// Create an empty lock map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to an instance.
    pub async fn lock(&self, id: &InstanceId) -> InstanceGuard {
        let mutex = self
            .locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        InstanceGuard {
            guard: Some(mutex.lock_owned().await),
            id: id.clone(),
            locks: Arc::clone(&self.locks),
        }
    }
}

/// Exclusive access to one instance. The map entry is removed on drop when no
/// other attempt is holding or waiting for it.
#[derive(Debug)]
pub struct InstanceGuard {
    guard: Option<OwnedMutexGuard<()>>,
    id: InstanceId,
    locks: Arc<LockMap>,
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold their own clone, so a count of one means the map's is the
        // last reference.
        self.locks
            .remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
