use crate::{ChurnError, Result, log_warn};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Caps the number of migrations executing at once.
///
/// Admission order is not guaranteed to match completion order.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl ConcurrencyGate {
    /// Size the gate for a fixed VM set. The configured worker count is capped
    /// at the VM count, with a single warning when that happens.
    pub fn new(workers: usize, vm_count: usize) -> Self {
        let workers = workers.max(1);
        let capacity = if vm_count > 0 && vm_count < workers {
            log_warn!(
                "Amount of workers {} can not be higher than amount of VMs: setting amount of workers to {}",
                workers,
                vm_count
            );
            vm_count
        } else {
            workers
        };

        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a free worker slot. The slot is released when the permit drops.
    pub async fn admit(&self) -> Result<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| ChurnError::Worker(format!("concurrency gate unavailable: {}", err)))
    }
}
