// src/exec/backend.rs

//! Pluggable executor abstraction.
//!
//! The engine talks to an [`Executor`] resolved by name from an
//! [`ExecutorRegistry`] instead of spawning processes itself. This makes it
//! easy to swap in a fake executor in tests while keeping the production
//! implementation in [`super::shell`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::{EngineError, Result};
use crate::model::{Status, Task};

/// What an executor reports about one task.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusDesc {
    pub status: Status,
    /// Values the task published while running.
    pub outputs: BTreeMap<String, String>,
    pub message: Option<String>,
}

impl StatusDesc {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            outputs: BTreeMap::new(),
            message: None,
        }
    }
}

/// A task executor backend.
///
/// Every call failing with an error is an abnormal fault, never a business
/// failure; business failures are reported through [`StatusDesc::status`].
/// Jobs the executor has never seen report [`Status::Born`].
#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    async fn status(&self, task: &Task) -> Result<StatusDesc>;
    async fn create(&self, task: &Task) -> Result<()>;
    async fn start(&self, task: &Task) -> Result<()>;
    async fn cancel(&self, task: &Task) -> Result<()>;
    /// Release compute resources of finished tasks.
    async fn batch_delete(&self, tasks: &[Task]) -> Result<()>;
}

/// Executors by name.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.executors.keys().collect();
        names.sort();
        f.debug_struct("ExecutorRegistry")
            .field("executors", &names)
            .finish()
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the executor's own name, replacing any previous one.
    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        self.executors.insert(executor.name().to_string(), executor);
    }

    pub fn with(mut self, executor: Arc<dyn Executor>) -> Self {
        self.register(executor);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Executor>> {
        self.executors
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::ExecutorNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }
}
