// src/engine/snippet.rs

//! Tasks that run a nested pipeline.
//!
//! The parent task creates (once) a child pipeline from the definition
//! catalog, hands it the root ancestor's run-time context, wakes it and
//! waits for its teardown. The child's teardown writes its status and
//! output values back onto the parent task.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use super::params;
use super::submit::{PipelineSeed, SubmitOptions};
use super::Engine;
use crate::errors::Result;
use crate::model::{NestLink, Pipeline, PipelineId, Status, Task};
use crate::policy::apply_policy;
use crate::taskrun::condition::{EvalContext, evaluate};
use crate::taskrun::{TaskEnv, should_skip};

impl Engine {
    pub(crate) async fn run_snippet(&self, task: Task, env: &TaskEnv) -> Result<Task> {
        let task_id = task.id;
        match self.drive_snippet(task, env).await {
            Err(err) if !err.is_abnormal() => {
                let task = self.inner.store.get_task(task_id).await?;
                self.fail_task(task, err).await
            }
            other => other,
        }
    }

    async fn drive_snippet(&self, mut task: Task, env: &TaskEnv) -> Result<Task> {
        let store = &self.inner.store;
        if task.status.is_end() {
            return Ok(task);
        }

        if should_skip(env.calculated_status, &task) {
            info!(
                pipeline_id = task.pipeline_id,
                task = %task.name,
                pipeline_status = %env.calculated_status,
                "pipeline already failed; skipping nested pipeline"
            );
            task.status = Status::NoNeedBySystem;
            task.allow_failure = true;
            store.update_task(&task).await?;
            return Ok(task);
        }

        if task.status == Status::Analyzed {
            if apply_policy(store.as_ref(), &env.pipeline, &mut task).await? {
                return Ok(task);
            }
            if let Some(cond) = &task.condition {
                let ctx = EvalContext {
                    task_status: task.status,
                    pipeline_status: env.calculated_status,
                    looped_times: 0,
                    outputs: env.outputs.clone(),
                };
                if !evaluate(cond, &ctx)? {
                    info!(task = %task.name, condition = %cond, "condition is false; nested pipeline not needed");
                    task.status = Status::NoNeedBySystem;
                    store.update_task(&task).await?;
                    return Ok(task);
                }
            }
        }

        let child_id = match task.snippet.as_ref().and_then(|s| s.pipeline_id) {
            Some(id) => id,
            None => self.create_child(&env.pipeline, &mut task).await?,
        };

        if task.status != Status::Running {
            task.status = Status::Running;
            task.time_begin = Some(Utc::now());
            store.update_task(&task).await?;
        }

        let child = store.get_pipeline(child_id).await?;
        if child.extra.snapshot.resolved_params.is_none() {
            self.inherit_context(&env.pipeline, child, env).await?;
        }

        // The child is redelivered its wake like a root pipeline, so an
        // aborted pass inside it is picked up again.
        let redeliver = self.inner.config.reconcile.redeliver();
        let child_ctx = self.inner.state.context(child_id);
        loop {
            self.wake(child_id);
            tokio::select! {
                _ = child_ctx.done.cancelled() => break,
                _ = env.exit.cancelled() => {
                    debug!(task = %task.name, child_pipeline_id = child_id, "parent exited while nested pipeline runs");
                    return Ok(task);
                }
                _ = tokio::time::sleep(redeliver) => {
                    debug!(task = %task.name, child_pipeline_id = child_id, "nested pipeline still running; redelivering wake");
                }
            }
        }

        store.get_task(task.id).await
    }

    async fn create_child(&self, parent: &Arc<Pipeline>, task: &mut Task) -> Result<PipelineId> {
        let Some(snippet) = task.snippet.clone() else {
            return Err(crate::errors::EngineError::structural(format!(
                "task '{}' is not a nested pipeline task",
                task.name
            )));
        };
        let definition = self.inner.catalog.get(&snippet.definition)?;

        let mut ancestor_ids = parent
            .extra
            .nest
            .as_ref()
            .map(|n| n.ancestor_ids.clone())
            .unwrap_or_default();
        ancestor_ids.push(parent.id);

        let seed = PipelineSeed {
            source: parent.source.clone(),
            nest: Some(NestLink {
                parent_pipeline_id: parent.id,
                parent_task_id: task.id,
                ancestor_ids,
            }),
        };
        let options = SubmitOptions {
            namespace: Some(parent.namespace().to_string()),
            params: snippet.params.clone(),
            ..SubmitOptions::default()
        };
        let child = self.create_pipeline(&definition, seed, options).await?;

        if let Some(s) = task.snippet.as_mut() {
            s.pipeline_id = Some(child.id);
        }
        self.inner.store.update_task(task).await?;
        info!(
            pipeline_id = parent.id,
            task = %task.name,
            child_pipeline_id = child.id,
            definition = %snippet.definition,
            "nested pipeline created"
        );
        Ok(child.id)
    }

    /// First entry of a child: copy secrets and envs from the root
    /// ancestor and resolve run parameters once. The resolved map is cached
    /// on the child, so later passes never resolve again.
    async fn inherit_context(
        &self,
        parent: &Pipeline,
        mut child: Pipeline,
        env: &TaskEnv,
    ) -> Result<()> {
        let root_id = child.root_id();
        let root = if root_id == parent.id {
            parent.clone()
        } else {
            self.inner.store.get_pipeline(root_id).await?
        };

        let snapshot = &mut child.extra.snapshot;
        let mut secrets = root.extra.snapshot.secrets.clone();
        secrets.extend(std::mem::take(&mut snapshot.secrets));
        snapshot.secrets = secrets;
        let mut envs = root.extra.snapshot.envs.clone();
        envs.extend(std::mem::take(&mut snapshot.envs));
        snapshot.envs = envs;

        snapshot.resolved_params = Some(params::resolve_map(
            &snapshot.run_params,
            &env.outputs,
            parent.extra.snapshot.effective_params(),
        )?);
        self.inner
            .store
            .update_pipeline_extra(child.id, child.extra.clone())
            .await?;
        debug!(
            pipeline_id = child.id,
            root_pipeline_id = root_id,
            "nested pipeline context resolved"
        );
        Ok(())
    }
}
