//! Bounded admission queues
//!
//! Two process-wide queues cap concurrent setups and executions. Waiting is
//! cooperative; a caller that goes away simply drops its acquire future, and
//! closing the queue at shutdown fails every waiter with `Cancelled`.

use std::sync::Arc;
use tee_common::{Result, TeeError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Clone)]
pub struct AdmissionQueue {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a permit. The permit releases on drop, on every exit path.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TeeError::Cancelled)
    }

    /// Fail all current and future waiters with `Cancelled`.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
