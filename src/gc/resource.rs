// src/gc/resource.rs

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::{GcManager, GcOutcome};
use crate::errors::Result;
use crate::model::{Pipeline, PipelineId, Task};

impl GcManager {
    /// Register the pipeline as a user of the namespace's resources, so a
    /// collection defers while it is still running.
    pub async fn join_namespace(&self, namespace: &str, pipeline_id: PipelineId) -> Result<()> {
        let member = format!("{}{pipeline_id}", self.resource_member_prefix(namespace));
        self.coord.put(&member, String::new(), None).await
    }

    /// Arm (or extend) the namespace wait-record and register the pipeline
    /// as a member of that namespace.
    pub async fn wait_resource_gc(
        &self,
        namespace: &str,
        pipeline_id: PipelineId,
        ttl_secs: u64,
    ) -> Result<()> {
        self.join_namespace(namespace, pipeline_id).await?;
        self.arm(&self.resource_key(namespace), ttl_secs, Value::Null)
            .await?;
        info!(%namespace, pipeline_id, ttl_secs, "resource gc armed");
        Ok(())
    }

    /// Push a pending namespace wait-record out to the delay TTL.
    ///
    /// Returns whether a record was pending.
    pub async fn delay_resource_gc(&self, namespace: &str) -> Result<bool> {
        let key = self.resource_key(namespace);
        if self.coord.get(&key).await?.is_none() {
            return Ok(false);
        }
        self.arm(&key, self.config.delay_ttl_secs, Value::Null).await?;
        debug!(%namespace, ttl_secs = self.config.delay_ttl_secs, "resource gc delayed");
        Ok(true)
    }

    /// Reclaim every executor resource of a namespace.
    ///
    /// The GC-complete markers are written before any executor call, so a
    /// crash never re-triggers deletion against abandoned resources.
    pub async fn handle_resource_gc(&self, namespace: &str) -> Result<GcOutcome> {
        let Some(lock) = self.lock(&format!("resource/{namespace}")).await? else {
            debug!(%namespace, "resource gc locked by another instance");
            return Ok(GcOutcome::Busy);
        };
        let outcome = self.collect_namespace(namespace).await;
        if let Err(err) = lock.unlock().await {
            warn!(%namespace, error = %err, "failed to release resource gc lock");
        }
        outcome
    }

    async fn collect_namespace(&self, namespace: &str) -> Result<GcOutcome> {
        let member_prefix = self.resource_member_prefix(namespace);
        let members = self.coord.list(&member_prefix).await?;
        if members.is_empty() {
            return Ok(GcOutcome::Nothing);
        }

        let mut pipelines: Vec<Pipeline> = Vec::new();
        for (key, _) in &members {
            let Some(id) = key
                .strip_prefix(&member_prefix)
                .and_then(|s| s.parse::<PipelineId>().ok())
            else {
                continue;
            };
            if let Some(p) = self.store.find_pipeline(id).await? {
                pipelines.push(p);
            }
        }

        if let Some(active) = pipelines.iter().find(|p| !p.status.is_end()) {
            info!(
                %namespace,
                pipeline_id = active.id,
                status = %active.status,
                "namespace still in use; deferring resource gc"
            );
            self.arm(
                &self.resource_key(namespace),
                self.config.delay_ttl_secs,
                Value::Null,
            )
            .await?;
            return Ok(GcOutcome::Deferred);
        }

        for pipeline in &mut pipelines {
            if !pipeline.extra.gc_complete {
                pipeline.extra.gc_complete = true;
                self.store
                    .update_pipeline_extra(pipeline.id, pipeline.extra.clone())
                    .await?;
            }
        }

        let mut by_executor: BTreeMap<String, Vec<Task>> = BTreeMap::new();
        for pipeline in &pipelines {
            for task in self.store.list_tasks(pipeline.id).await? {
                if task.reached_executor() {
                    by_executor
                        .entry(task.executor.clone())
                        .or_default()
                        .extend(task.executor_jobs());
                }
            }
        }

        let mut all_ok = true;
        for (name, tasks) in &by_executor {
            let result = match self.executors.get(name) {
                Ok(executor) => executor.batch_delete(tasks).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => info!(%namespace, executor = %name, tasks = tasks.len(), "resources deleted"),
                Err(err) => {
                    all_ok = false;
                    warn!(%namespace, executor = %name, error = %err, "batch delete failed");
                }
            }
        }

        if !all_ok {
            self.arm(
                &self.resource_key(namespace),
                self.config.resource_ttl_failed_secs,
                Value::Null,
            )
            .await?;
            return Ok(GcOutcome::Deferred);
        }

        self.coord.delete_prefix(&member_prefix).await?;
        self.coord.delete(&self.resource_key(namespace)).await?;
        info!(%namespace, pipelines = pipelines.len(), "namespace resources collected");
        Ok(GcOutcome::Collected)
    }
}
