//! Concurrency gate bounding how many job pipelines run at once.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::error::{JobError, Result};

/// A counting permit pool shared by all supervisors.
///
/// Waiters are served in FIFO order (tokio's semaphore is fair), so no job
/// starves behind later submissions. Dropping the returned permit releases it.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// A held slot in the gate, released on drop.
pub type GatePermit = OwnedSemaphorePermit;

impl ConcurrencyGate {
    /// Create a gate with `capacity` permits (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait until a permit is free.
    pub async fn acquire(&self) -> Result<GatePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| JobError::GateClosed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits not currently held.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Default for ConcurrencyGate {
    fn default() -> Self {
        Self::new(1)
    }
}
