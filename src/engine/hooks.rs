// src/engine/hooks.rs

use async_trait::async_trait;

use crate::errors::Result;
use crate::model::{Pipeline, Task};

/// Post-execution callbacks.
///
/// Hook failures are logged and never change the outcome of a task or
/// pipeline.
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// A task reached a terminal status.
    async fn after_task(&self, _task: &Task) -> Result<()> {
        Ok(())
    }

    /// A pipeline finished its teardown.
    async fn after_pipeline(&self, _pipeline: &Pipeline) -> Result<()> {
        Ok(())
    }
}
