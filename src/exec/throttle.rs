// src/exec/throttle.rs

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::model::TaskId;

/// Engine-wide limit on how many tasks may hold an execution slot.
///
/// A slot is taken in the start step, before the executor start call, and
/// released at per-task teardown. Capacity `0` disables throttling.
#[derive(Debug, Clone)]
pub struct Throttler {
    semaphore: Option<Arc<Semaphore>>,
    held: Arc<DashMap<TaskId, OwnedSemaphorePermit>>,
}

impl Throttler {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: (capacity > 0).then(|| Arc::new(Semaphore::new(capacity))),
            held: Arc::new(DashMap::new()),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Wait for a slot. Idempotent per task.
    pub async fn acquire(&self, task_id: TaskId) {
        let Some(semaphore) = &self.semaphore else {
            return;
        };
        if self.held.contains_key(&task_id) {
            return;
        }
        // The semaphore is never closed.
        if let Ok(permit) = Arc::clone(semaphore).acquire_owned().await {
            debug!(task_id, "throttler slot acquired");
            self.held.insert(task_id, permit);
        }
    }

    pub fn release(&self, task_id: TaskId) {
        if self.held.remove(&task_id).is_some() {
            debug!(task_id, "throttler slot released");
        }
    }

    pub fn in_use(&self) -> usize {
        self.held.len()
    }
}

impl Default for Throttler {
    fn default() -> Self {
        Self::unlimited()
    }
}
