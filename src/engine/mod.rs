// src/engine/mod.rs

//! Pipeline reconcile engine.
//!
//! This module ties together:
//! - the reconcile pass ([`reconciler`]), which aggregates status, asks the
//!   DAG scheduler for runnable tasks and dispatches one unit of work per
//!   admitted task
//! - nested pipelines ([`snippet`]) and parameter substitution ([`params`])
//! - teardown and post-execution hooks ([`teardown`], [`hooks`])
//! - submission, stop and rerun ([`submit`], [`control`])
//! - the wake queue ([`runtime`]): a finished task enqueues a wake for its
//!   pipeline instead of recursing into the next pass
//!
//! [`Engine`] is cheap to clone; every clone shares the same state.

pub mod control;
pub mod hooks;
pub mod params;
pub mod reconciler;
pub mod runtime;
pub mod snippet;
pub mod state;
pub mod submit;
pub mod teardown;

use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

use crate::config::EngineConfig;
use crate::coord::CoordinationStore;
use crate::definition::DefinitionCatalog;
use crate::exec::{Executor, ExecutorRegistry, Throttler};
use crate::gc::GcManager;
use crate::model::PipelineId;
use crate::store::PipelineStore;

pub use hooks::LifecycleHook;
pub use state::{ReconcileContext, ReconcileState};
pub use submit::SubmitOptions;

struct EngineInner {
    store: Arc<dyn PipelineStore>,
    executors: ExecutorRegistry,
    catalog: DefinitionCatalog,
    config: EngineConfig,
    throttler: Throttler,
    hooks: Vec<Arc<dyn LifecycleHook>>,
    state: ReconcileState,
    gc: GcManager,
    wake_tx: mpsc::UnboundedSender<PipelineId>,
    wake_rx: Mutex<Option<mpsc::UnboundedReceiver<PipelineId>>>,
}

/// The reconcile engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("executors", &self.inner.executors)
            .field("definitions", &self.inner.catalog.len())
            .field("hooks", &self.inner.hooks.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn builder(
        store: Arc<dyn PipelineStore>,
        coord: Arc<dyn CoordinationStore>,
    ) -> EngineBuilder {
        EngineBuilder::new(store, coord)
    }

    pub fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.inner.store
    }

    pub fn gc(&self) -> &GcManager {
        &self.inner.gc
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn throttler(&self) -> &Throttler {
        &self.inner.throttler
    }

    pub fn state(&self) -> &ReconcileState {
        &self.inner.state
    }
}

/// Assembles an [`Engine`].
pub struct EngineBuilder {
    store: Arc<dyn PipelineStore>,
    coord: Arc<dyn CoordinationStore>,
    executors: ExecutorRegistry,
    catalog: DefinitionCatalog,
    config: EngineConfig,
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl EngineBuilder {
    pub fn new(store: Arc<dyn PipelineStore>, coord: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            coord,
            executors: ExecutorRegistry::new(),
            catalog: DefinitionCatalog::new(),
            config: EngineConfig::default(),
            hooks: Vec::new(),
        }
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executors.register(executor);
        self
    }

    pub fn catalog(mut self, catalog: DefinitionCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn hook(mut self, hook: Arc<dyn LifecycleHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn build(self) -> Engine {
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let gc = GcManager::new(
            Arc::clone(&self.store),
            self.coord,
            self.executors.clone(),
            self.config.gc.clone(),
        );
        Engine {
            inner: Arc::new(EngineInner {
                throttler: Throttler::new(self.config.reconcile.throttler_capacity),
                store: self.store,
                executors: self.executors,
                catalog: self.catalog,
                config: self.config,
                hooks: self.hooks,
                state: ReconcileState::default(),
                gc,
                wake_tx,
                wake_rx: Mutex::new(Some(wake_rx)),
            }),
        }
    }
}
