// src/policy.rs

//! Task policies evaluated just before a task (re)starts.

use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::model::{Pipeline, Status, Task, TaskPolicy};
use crate::store::PipelineStore;

/// Apply `task.policy`. Returns `true` when a historical result was spliced
/// onto the task, in which case it must not be executed.
pub async fn apply_policy(
    store: &dyn PipelineStore,
    pipeline: &Pipeline,
    task: &mut Task,
) -> Result<bool> {
    match task.policy {
        TaskPolicy::NewRun => Ok(false),
        TaskPolicy::TryLatestSuccessResult => reuse_latest_success(store, pipeline, task).await,
    }
}

async fn reuse_latest_success(
    store: &dyn PipelineStore,
    pipeline: &Pipeline,
    task: &mut Task,
) -> Result<bool> {
    let Some(historical) = find_historical(store, pipeline, task).await? else {
        return Ok(false);
    };

    if historical.status != Status::Success {
        debug!(task = %task.name, status = %historical.status, "historical task not reusable");
        return Ok(false);
    }

    info!(
        pipeline_id = pipeline.id,
        task = %task.name,
        from_task = historical.id,
        "reusing latest successful result"
    );
    task.status = historical.status;
    task.result = historical.result;
    task.time_begin = historical.time_begin;
    task.time_end = historical.time_end;
    task.cost_time_sec = historical.cost_time_sec;
    store.update_task(task).await?;
    Ok(true)
}

/// The task that produced the latest successful result for `task`, if any.
/// Missing history of any kind means the task runs normally.
async fn find_historical(
    store: &dyn PipelineStore,
    pipeline: &Pipeline,
    task: &Task,
) -> Result<Option<Task>> {
    match &task.snippet {
        Some(snippet) => {
            let Some(child) = store
                .latest_success_pipeline(&pipeline.source, &snippet.definition, true)
                .await?
            else {
                debug!(task = %task.name, "no successful nested run yet; running normally");
                return Ok(None);
            };
            let Some(nest) = child.extra.nest.as_ref() else {
                warn!(task = %task.name, child_pipeline_id = child.id, "nested run has no parent task link; running normally");
                return Ok(None);
            };
            let parent_task = store.find_task(nest.parent_task_id).await?;
            if parent_task.is_none() {
                debug!(
                    task = %task.name,
                    parent_task_id = nest.parent_task_id,
                    "parent task of the nested run is gone; running normally"
                );
            }
            Ok(parent_task)
        }
        None => {
            let Some(previous) = store
                .latest_success_pipeline(&pipeline.source, &pipeline.name, pipeline.is_snippet)
                .await?
                .filter(|p| p.id != pipeline.id)
            else {
                debug!(task = %task.name, "no successful run of pipeline yet; running normally");
                return Ok(None);
            };
            let found = store
                .list_tasks(previous.id)
                .await?
                .into_iter()
                .find(|t| t.name == task.name);
            if found.is_none() {
                debug!(task = %task.name, previous_pipeline_id = previous.id, "task absent from latest successful run; running normally");
            }
            Ok(found)
        }
    }
}
