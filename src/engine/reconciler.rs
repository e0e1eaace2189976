// src/engine/reconciler.rs

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::Engine;
use super::params;
use crate::aggregate::{self, TaskView};
use crate::dag::{DagGraph, NodeSpec, ScheduleOptions, get_schedulable};
use crate::errors::{EngineError, Result};
use crate::model::{PipelineId, Status, Task};
use crate::taskrun::{TaskEnv, TaskRunner};

impl Engine {
    /// One reconcile pass over a pipeline.
    ///
    /// Safe to call redundantly and concurrently: a task is dispatched only
    /// by the pass that wins its admission slot.
    pub async fn reconcile(&self, pipeline_id: PipelineId) -> Result<()> {
        let ctx = self.inner.state.context(pipeline_id);
        if ctx.cancel.is_cancelled() {
            debug!(pipeline_id, "pipeline cancelled; skipping reconcile");
            return Ok(());
        }

        let pipeline = self.inner.store.get_pipeline(pipeline_id).await?;
        if pipeline.status.is_end() {
            // While a teardown is in flight it signals completion itself.
            if pipeline.extra.teardown_complete
                && !self.inner.state.is_tearing_down(pipeline_id)
            {
                ctx.finish();
                self.inner.state.forget(pipeline_id);
                return Ok(());
            }
            return self.teardown(pipeline_id).await;
        }

        if let Err(err) = self.inner.gc.delay_resource_gc(pipeline.namespace()).await {
            warn!(pipeline_id, error = %err, "failed to delay resource gc");
        }

        let stages = self.inner.store.list_stages(pipeline_id).await?;
        let tasks = self.inner.store.list_tasks(pipeline_id).await?;

        // A terminal task still held by a unit may be looping or propagating.
        let state = &self.inner.state;
        let settled = |t: &Task| t.status.is_end() && !state.is_admitted(pipeline_id, t.id);

        let mut status = pipeline.status;
        if tasks.iter().all(settled) {
            if ctx.cancel.is_cancelled() {
                return Ok(());
            }
            let computed = aggregate::pipeline_status_of(&stages, &tasks)?;
            if computed != status {
                info!(pipeline_id, from = %status, to = %computed, "pipeline status changed");
                self.inner
                    .store
                    .update_pipeline_status(pipeline_id, computed)
                    .await?;
                status = computed;
            }
        } else if matches!(status, Status::Analyzed | Status::Born | Status::Queue) {
            info!(pipeline_id, from = %status, "pipeline running");
            if let Err(err) = self
                .inner
                .gc
                .join_namespace(pipeline.namespace(), pipeline_id)
                .await
            {
                warn!(pipeline_id, error = %err, "failed to join gc namespace");
            }
            self.inner
                .store
                .update_pipeline_status(pipeline_id, Status::Running)
                .await?;
            if pipeline.time_begin.is_none() {
                self.inner
                    .store
                    .update_pipeline_times(pipeline_id, Some(Utc::now()), None, -1)
                    .await?;
            }
            status = Status::Running;
        }

        if status.is_end() {
            return self.teardown(pipeline_id).await;
        }

        let graph = DagGraph::build(
            tasks
                .iter()
                .map(|t| NodeSpec::new(t.name.clone(), t.after.iter().cloned())),
            false,
        )?;
        let done: HashSet<String> = tasks
            .iter()
            .filter(|t| settled(t))
            .map(|t| t.name.clone())
            .collect();
        let schedulable = get_schedulable(
            &graph,
            &done,
            ScheduleOptions {
                strict: self.inner.config.reconcile.strict_schedule,
            },
        )?;
        if schedulable.is_empty() {
            debug!(pipeline_id, "nothing schedulable");
            return Ok(());
        }

        let done_views: Vec<TaskView> = tasks
            .iter()
            .filter(|t| settled(t))
            .map(TaskView::from)
            .collect();
        let calculated_status = aggregate::flat_pipeline_status(&done_views)?;
        let outputs = params::flatten_outputs(tasks.iter().filter(|t| settled(t)));
        let pipeline = Arc::new(pipeline);

        let mut units = JoinSet::new();
        for task in tasks {
            if !schedulable.contains(&task.name) || task.status == Status::Paused {
                continue;
            }
            if !self.inner.state.try_admit(pipeline_id, task.id) {
                debug!(pipeline_id, task = %task.name, "task already claimed");
                continue;
            }

            let env = TaskEnv {
                pipeline: Arc::clone(&pipeline),
                calculated_status,
                outputs: outputs.clone(),
                exit: ctx.exit.clone(),
            };
            debug!(pipeline_id, task = %task.name, status = %task.status, "dispatching task");
            let engine = self.clone();
            units.spawn(async move { engine.run_unit(task, env).await });
        }

        while let Some(joined) = units.join_next().await {
            if let Err(err) = joined {
                error!(pipeline_id, error = %err, "task unit panicked");
            }
        }
        Ok(())
    }

    /// Drive one admitted task, then release it and wake the pipeline.
    async fn run_unit(&self, task: Task, env: TaskEnv) {
        let pipeline_id = task.pipeline_id;
        let task_id = task.id;
        let name = task.name.clone();

        // The snapshot may predate a unit that finished and released.
        let task = match self.inner.store.get_task(task_id).await {
            Ok(fresh) if fresh.status.is_end() => {
                debug!(pipeline_id, task = %name, status = %fresh.status, "task already finished");
                self.inner.state.release(pipeline_id, task_id);
                return;
            }
            Ok(fresh) => fresh,
            Err(err) => {
                self.inner.throttler.release(task_id);
                self.inner.state.release(pipeline_id, task_id);
                error!(pipeline_id, task = %name, error = %err, "failed to reload task");
                return;
            }
        };

        let result = if task.is_snippet() {
            self.run_snippet(task, &env).await
        } else {
            self.run_task(task, &env).await
        };

        match result {
            Ok(task) => {
                self.task_teardown(&task).await;
                self.inner.state.release(pipeline_id, task_id);
                self.wake(pipeline_id);
            }
            Err(err) => {
                self.inner.throttler.release(task_id);
                self.inner.state.release(pipeline_id, task_id);
                error!(
                    pipeline_id,
                    task = %name,
                    error = %err,
                    "task unit aborted; waiting for the next wake"
                );
            }
        }
    }

    async fn run_task(&self, task: Task, env: &TaskEnv) -> Result<Task> {
        let executor = match self.inner.executors.get(&task.executor) {
            Ok(executor) => executor,
            Err(err) => return self.fail_task(task, err).await,
        };
        let reconcile = &self.inner.config.reconcile;
        let runner = TaskRunner::new(
            Arc::clone(&self.inner.store),
            executor,
            self.inner.throttler.clone(),
            self.inner.config.retry.clone(),
            reconcile.wait_poll(),
        );
        runner.run(task, env).await
    }

    /// Record a non-retryable failure on a task.
    pub(crate) async fn fail_task(&self, mut task: Task, err: EngineError) -> Result<Task> {
        let status = if err.is_user() {
            Status::Failed
        } else {
            Status::Error
        };
        warn!(pipeline_id = task.pipeline_id, task = %task.name, %status, error = %err, "task failed");
        task.status = status;
        task.result.message = Some(err.to_string());
        task.time_end = Some(Utc::now());
        self.inner.store.update_task(&task).await?;
        Ok(task)
    }
}
