// src/engine/control.rs

//! User-initiated operations on existing pipelines.

use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use tracing::{debug, info, warn};

use super::Engine;
use crate::errors::{EngineError, Result};
use crate::model::{Pipeline, PipelineExtra, PipelineId, Stage, Status, Task};

impl Engine {
    /// Stop a running pipeline and every nested pipeline under it.
    ///
    /// In-flight executor jobs are cancelled, unfinished tasks and the
    /// pipeline end as StopByUser, and teardown runs immediately.
    pub async fn stop(&self, pipeline_id: PipelineId) -> Result<()> {
        let pipeline = self.inner.store.get_pipeline(pipeline_id).await?;
        if pipeline.status.is_end() {
            info!(pipeline_id, status = %pipeline.status, "pipeline already finished");
            return Ok(());
        }

        // Parents first; stopped in reverse so children tear down first.
        let mut order = vec![pipeline_id];
        let mut next = 0;
        while next < order.len() {
            for task in self.inner.store.list_tasks(order[next]).await? {
                if task.status.is_end() {
                    continue;
                }
                if let Some(child) = task.snippet.as_ref().and_then(|s| s.pipeline_id) {
                    order.push(child);
                }
            }
            next += 1;
        }

        // Cancel everything up front so no pass finalises a pipeline from a
        // child's stopped status.
        for id in &order {
            self.inner.state.context(*id).cancel.cancel();
        }
        for id in order.into_iter().rev() {
            self.stop_one(id).await?;
        }
        info!(pipeline_id, "pipeline stopped by user");
        Ok(())
    }

    async fn stop_one(&self, pipeline_id: PipelineId) -> Result<()> {
        let store = &self.inner.store;
        let pipeline = store.get_pipeline(pipeline_id).await?;
        if pipeline.extra.teardown_complete {
            self.inner.state.forget(pipeline_id);
            return Ok(());
        }
        self.inner.state.context(pipeline_id).cancel.cancel();

        for task in store.list_tasks(pipeline_id).await? {
            if task.status.is_end() {
                continue;
            }
            if task.reached_executor() && !task.extra.uuid.is_empty() {
                let cancelled = match self.inner.executors.get(&task.executor) {
                    Ok(executor) => executor.cancel(&task).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = cancelled {
                    warn!(pipeline_id, task = %task.name, error = %err, "failed to cancel task");
                }
            }
            store.update_task_status(task.id, Status::StopByUser).await?;
            self.inner.throttler.release(task.id);
            debug!(pipeline_id, task = %task.name, "task stopped");
        }

        if !pipeline.status.is_end() {
            store
                .update_pipeline_status(pipeline_id, Status::StopByUser)
                .await?;
        }
        self.teardown(pipeline_id).await
    }

    /// Start a new pipeline from a finished one, in the same namespace.
    ///
    /// Successful tasks whose predecessors are all reused keep their status,
    /// result and timing; everything else starts over.
    pub async fn rerun_failed(&self, pipeline_id: PipelineId) -> Result<Pipeline> {
        let store = &self.inner.store;
        let old = store.get_pipeline(pipeline_id).await?;
        if !old.status.is_end() {
            return Err(EngineError::User(format!(
                "pipeline {pipeline_id} is still {}",
                old.status
            )));
        }
        if old.is_snippet {
            return Err(EngineError::User(format!(
                "pipeline {pipeline_id} is nested; rerun its parent instead"
            )));
        }

        let stages = store.list_stages(pipeline_id).await?;
        let tasks = store.list_tasks(pipeline_id).await?;
        let reused = reusable_tasks(&tasks);

        let mut labels = old.labels.clone();
        labels.insert("rerun_from".to_string(), pipeline_id.to_string());
        let record = Pipeline {
            id: 0,
            status: Status::Analyzed,
            labels,
            extra: PipelineExtra {
                namespace: old.extra.namespace.clone(),
                gc: old.extra.gc.clone(),
                snapshot: old.extra.snapshot.clone(),
                outputs: old.extra.outputs.clone(),
                ..PipelineExtra::default()
            },
            time_created: Utc::now(),
            time_begin: None,
            time_end: None,
            cost_time_sec: -1,
            ..old.clone()
        };
        let pipeline = store.create_pipeline(record).await?;

        let mut stage_ids = HashMap::new();
        let mut previous = None;
        for stage in &stages {
            let created = store
                .create_stage(Stage {
                    id: 0,
                    pipeline_id: pipeline.id,
                    previous_stage_id: previous,
                    ..stage.clone()
                })
                .await?;
            stage_ids.insert(stage.id, created.id);
            previous = Some(created.id);
        }

        for task in tasks {
            let stage_id = stage_ids.get(&task.stage_id).copied().ok_or_else(|| {
                EngineError::structural(format!(
                    "task '{}' belongs to unknown stage {}",
                    task.name, task.stage_id
                ))
            })?;
            let mut copy = Task {
                id: 0,
                pipeline_id: pipeline.id,
                stage_id,
                ..task
            };
            if reused.contains(&copy.name) {
                // Resources stay owned by the old pipeline.
                copy.extra.uuid.clear();
                copy.extra.previous_uuids.clear();
            } else {
                copy.reset_for_rerun();
                copy.extra.errors.clear();
                if let Some(opts) = copy.loop_options.as_mut() {
                    opts.looped_times = 0;
                }
                if let Some(snippet) = copy.snippet.as_mut() {
                    snippet.pipeline_id = None;
                }
            }
            store.create_task(copy).await?;
        }

        let gc = &self.inner.gc;
        if let Err(err) = gc.delay_resource_gc(pipeline.namespace()).await {
            warn!(pipeline_id = pipeline.id, error = %err, "failed to delay resource gc");
        }
        let policy = &pipeline.extra.gc;
        if let Err(err) = gc
            .wait_database_gc(pipeline.id, policy.database_ttl_analyzed_secs, policy.archive_analyzed)
            .await
        {
            warn!(pipeline_id = pipeline.id, error = %err, "failed to arm database gc");
        }

        info!(
            pipeline_id = pipeline.id,
            rerun_from = pipeline_id,
            reused = reused.len(),
            "pipeline rerun submitted"
        );
        Ok(pipeline)
    }
}

/// Successful tasks whose predecessors are all reusable too.
fn reusable_tasks(tasks: &[Task]) -> BTreeSet<String> {
    let mut kept: BTreeSet<String> = tasks
        .iter()
        .filter(|t| t.status == Status::Success)
        .map(|t| t.name.clone())
        .collect();
    loop {
        let dropped: Vec<String> = tasks
            .iter()
            .filter(|t| kept.contains(&t.name) && t.after.iter().any(|a| !kept.contains(a)))
            .map(|t| t.name.clone())
            .collect();
        if dropped.is_empty() {
            return kept;
        }
        for name in dropped {
            kept.remove(&name);
        }
    }
}
