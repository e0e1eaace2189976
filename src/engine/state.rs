// src/engine/state.rs

//! In-process reconcile bookkeeping: per-pipeline signals, task admission
//! and the teardown guard.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::model::{PipelineId, TaskId};

/// Signals shared by every unit of work of one pipeline.
#[derive(Debug)]
pub struct ReconcileContext {
    pub pipeline_id: PipelineId,
    /// Fired when the user stops the pipeline.
    pub cancel: CancellationToken,
    /// Fired at teardown (or on cancel); task units stop advancing.
    pub exit: CancellationToken,
    /// Fired once teardown has completed.
    pub done: CancellationToken,
}

impl ReconcileContext {
    fn new(pipeline_id: PipelineId) -> Self {
        let cancel = CancellationToken::new();
        Self {
            pipeline_id,
            exit: cancel.child_token(),
            cancel,
            done: CancellationToken::new(),
        }
    }

    /// Fire `exit` and `done`.
    pub fn finish(&self) {
        self.exit.cancel();
        self.done.cancel();
    }
}

#[derive(Debug, Default)]
pub struct ReconcileState {
    contexts: DashMap<PipelineId, Arc<ReconcileContext>>,
    admitted: DashSet<(PipelineId, TaskId)>,
    tearing_down: DashSet<PipelineId>,
}

impl ReconcileState {
    pub fn context(&self, pipeline_id: PipelineId) -> Arc<ReconcileContext> {
        self.contexts
            .entry(pipeline_id)
            .or_insert_with(|| Arc::new(ReconcileContext::new(pipeline_id)))
            .clone()
    }

    pub fn existing(&self, pipeline_id: PipelineId) -> Option<Arc<ReconcileContext>> {
        self.contexts.get(&pipeline_id).map(|c| c.clone())
    }

    /// Drop the context of a finished pipeline.
    pub fn forget(&self, pipeline_id: PipelineId) {
        if self.contexts.remove(&pipeline_id).is_some() {
            debug!(pipeline_id, "reconcile context released");
        }
    }

    /// Claim a task for one unit of work. `false` means it is already claimed.
    pub fn try_admit(&self, pipeline_id: PipelineId, task_id: TaskId) -> bool {
        self.admitted.insert((pipeline_id, task_id))
    }

    pub fn release(&self, pipeline_id: PipelineId, task_id: TaskId) {
        self.admitted.remove(&(pipeline_id, task_id));
    }

    pub fn is_admitted(&self, pipeline_id: PipelineId, task_id: TaskId) -> bool {
        self.admitted.contains(&(pipeline_id, task_id))
    }

    pub fn begin_teardown(&self, pipeline_id: PipelineId) -> bool {
        self.tearing_down.insert(pipeline_id)
    }

    pub fn end_teardown(&self, pipeline_id: PipelineId) {
        self.tearing_down.remove(&pipeline_id);
    }

    pub fn is_tearing_down(&self, pipeline_id: PipelineId) -> bool {
        self.tearing_down.contains(&pipeline_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_is_exclusive_until_released() {
        let state = ReconcileState::default();
        assert!(state.try_admit(1, 10));
        assert!(!state.try_admit(1, 10));
        assert!(state.try_admit(2, 10));
        state.release(1, 10);
        assert!(state.try_admit(1, 10));
    }

    #[test]
    fn cancel_fires_exit_but_not_done() {
        let state = ReconcileState::default();
        let ctx = state.context(7);
        ctx.cancel.cancel();
        assert!(ctx.exit.is_cancelled());
        assert!(!ctx.done.is_cancelled());
        assert!(Arc::ptr_eq(&ctx, &state.context(7)));
    }
}
