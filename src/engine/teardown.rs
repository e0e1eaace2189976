// src/engine/teardown.rs

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::Engine;
use super::params;
use crate::errors::Result;
use crate::model::{NestLink, Pipeline, PipelineId, Status, Task};

impl Engine {
    /// Release per-task resources once a task is terminal.
    pub(crate) async fn task_teardown(&self, task: &Task) {
        if !task.status.is_end() {
            return;
        }
        self.inner.throttler.release(task.id);
        for hook in &self.inner.hooks {
            if let Err(err) = hook.after_task(task).await {
                warn!(pipeline_id = task.pipeline_id, task = %task.name, error = %err, "after_task hook failed");
            }
        }
    }

    /// Finish a terminal pipeline. Runs at most once at a time per pipeline
    /// and is a no-op once the teardown marker is persisted.
    pub async fn teardown(&self, pipeline_id: PipelineId) -> Result<()> {
        if !self.inner.state.begin_teardown(pipeline_id) {
            debug!(pipeline_id, "teardown already in progress");
            return Ok(());
        }
        let result = self.teardown_guarded(pipeline_id).await;
        self.inner.state.end_teardown(pipeline_id);
        if result.is_ok() {
            self.signal_done(pipeline_id);
        }
        result
    }

    async fn teardown_guarded(&self, pipeline_id: PipelineId) -> Result<()> {
        let store = &self.inner.store;
        let mut pipeline = store.get_pipeline(pipeline_id).await?;
        if pipeline.extra.teardown_complete {
            return Ok(());
        }

        let mut tasks = store.list_tasks(pipeline_id).await?;
        for task in tasks.iter_mut().filter(|t| t.status.is_pre_run()) {
            debug!(pipeline_id, task = %task.name, "task never ran; marking not needed");
            task.status = Status::NoNeedBySystem;
            store.update_task_status(task.id, task.status).await?;
        }

        pipeline.extra.output_values = self.output_values(&pipeline, &tasks);

        let end = Utc::now();
        let begin = pipeline.time_begin.unwrap_or(end);
        pipeline.time_end = Some(end);
        pipeline.cost_time_sec = (end - begin).num_seconds();
        store
            .update_pipeline_times(
                pipeline_id,
                pipeline.time_begin,
                pipeline.time_end,
                pipeline.cost_time_sec,
            )
            .await?;

        if let Some(nest) = pipeline.extra.nest.clone() {
            self.propagate_to_parent(&pipeline, &nest, begin, end).await?;
        }

        pipeline.extra.teardown_complete = true;
        store
            .update_pipeline_extra(pipeline_id, pipeline.extra.clone())
            .await?;
        info!(
            pipeline_id,
            status = %pipeline.status,
            cost_secs = pipeline.cost_time_sec,
            "pipeline torn down"
        );

        self.arm_gc(&pipeline).await;
        for hook in &self.inner.hooks {
            if let Err(err) = hook.after_pipeline(&pipeline).await {
                warn!(pipeline_id, error = %err, "after_pipeline hook failed");
            }
        }
        Ok(())
    }

    fn signal_done(&self, pipeline_id: PipelineId) {
        if let Some(ctx) = self.inner.state.existing(pipeline_id) {
            ctx.finish();
        }
        self.inner.state.forget(pipeline_id);
    }

    /// Resolve declared outputs against task results. Unresolvable outputs
    /// are logged and left out.
    fn output_values(&self, pipeline: &Pipeline, tasks: &[Task]) -> BTreeMap<String, String> {
        let outputs = params::flatten_outputs(tasks);
        let run_params = pipeline.extra.snapshot.effective_params();
        let mut values = BTreeMap::new();
        for decl in &pipeline.extra.outputs {
            match params::resolve(&decl.reference, &outputs, run_params) {
                Ok(value) => {
                    values.insert(decl.name.clone(), value);
                }
                Err(err) => warn!(
                    pipeline_id = pipeline.id,
                    output = %decl.name,
                    error = %err,
                    "output not resolved"
                ),
            }
        }
        values
    }

    /// Copy a nested pipeline's outcome onto the task that spawned it.
    async fn propagate_to_parent(
        &self,
        pipeline: &Pipeline,
        nest: &NestLink,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<()> {
        let store = &self.inner.store;
        let mut parent_task = store.get_task(nest.parent_task_id).await?;
        parent_task.status = pipeline.status;
        parent_task
            .result
            .metadata
            .extend(pipeline.extra.output_values.clone());
        parent_task.time_begin.get_or_insert(begin);
        parent_task.time_end = Some(end);
        parent_task.cost_time_sec = parent_task
            .time_begin
            .map(|b| (end - b).num_seconds())
            .unwrap_or(0);
        store.update_task(&parent_task).await?;
        info!(
            pipeline_id = nest.parent_pipeline_id,
            task = %parent_task.name,
            child_pipeline_id = pipeline.id,
            status = %parent_task.status,
            "nested pipeline result propagated"
        );
        self.wake(nest.parent_pipeline_id);
        Ok(())
    }

    /// Best effort: a missed record is re-armed by the compensation sweep.
    async fn arm_gc(&self, pipeline: &Pipeline) {
        let gc = &self.inner.gc;
        let policy = &pipeline.extra.gc;
        if let Err(err) = gc
            .wait_resource_gc(
                pipeline.namespace(),
                pipeline.id,
                policy.resource_ttl_for(pipeline.status),
            )
            .await
        {
            warn!(pipeline_id = pipeline.id, error = %err, "failed to arm resource gc");
        }
        if let Err(err) = gc
            .wait_database_gc(
                pipeline.id,
                policy.database_ttl_for(pipeline.status),
                policy.archive_for(pipeline.status),
            )
            .await
        {
            warn!(pipeline_id = pipeline.id, error = %err, "failed to arm database gc");
        }
    }
}
