// src/gc/database.rs

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{GcManager, GcOutcome};
use crate::errors::Result;
use crate::model::{Archive, PipelineId};

/// Archive flag carried in a database wait-record payload.
pub fn need_archive(payload: &Value) -> Option<bool> {
    payload.get("need_archive").and_then(Value::as_bool)
}

impl GcManager {
    /// Arm (or extend) the database wait-record of a pipeline.
    pub async fn wait_database_gc(
        &self,
        pipeline_id: PipelineId,
        ttl_secs: u64,
        need_archive: bool,
    ) -> Result<()> {
        self.arm(
            &self.database_key(pipeline_id),
            ttl_secs,
            json!({ "need_archive": need_archive }),
        )
        .await?;
        debug!(pipeline_id, ttl_secs, need_archive, "database gc armed");
        Ok(())
    }

    /// Archive or delete every row of a pipeline.
    ///
    /// `need_archive` comes from the wait-record; `None` falls back to the
    /// pipeline's own GC policy for its status.
    pub async fn handle_database_gc(
        &self,
        pipeline_id: PipelineId,
        need_archive: Option<bool>,
    ) -> Result<GcOutcome> {
        let Some(lock) = self.lock(&format!("database/{pipeline_id}")).await? else {
            debug!(pipeline_id, "database gc locked by another instance");
            return Ok(GcOutcome::Busy);
        };
        let outcome = self.collect_pipeline(pipeline_id, need_archive).await;
        if let Err(err) = lock.unlock().await {
            warn!(pipeline_id, error = %err, "failed to release database gc lock");
        }
        outcome
    }

    async fn collect_pipeline(
        &self,
        pipeline_id: PipelineId,
        need_archive: Option<bool>,
    ) -> Result<GcOutcome> {
        let Some(pipeline) = self.store.find_pipeline(pipeline_id).await? else {
            debug!(pipeline_id, "pipeline already gone");
            return Ok(GcOutcome::Nothing);
        };
        if !pipeline.status.can_delete() {
            info!(pipeline_id, status = %pipeline.status, "pipeline still active; skipping database gc");
            return Ok(GcOutcome::Nothing);
        }

        let archive = need_archive.unwrap_or_else(|| pipeline.extra.gc.archive_for(pipeline.status));
        let tasks = self.store.list_tasks(pipeline_id).await?;
        if !pipeline.extra.gc_complete && tasks.iter().any(|t| t.reached_executor()) {
            info!(pipeline_id, "resources not collected yet; deferring database gc");
            self.arm(
                &self.database_key(pipeline_id),
                self.config.delay_ttl_secs,
                json!({ "need_archive": archive }),
            )
            .await?;
            return Ok(GcOutcome::Deferred);
        }

        if archive {
            let archive = Archive {
                pipeline_id,
                stages: self.store.list_stages(pipeline_id).await?,
                reports: self.store.list_reports(pipeline_id).await?,
                tasks,
                pipeline,
                archived_at: Utc::now(),
            };
            self.store.create_archive(archive).await?;
            info!(pipeline_id, "pipeline archived");
        }

        self.store.delete_pipeline_related(pipeline_id).await?;
        info!(pipeline_id, "pipeline rows deleted");
        Ok(GcOutcome::Collected)
    }

    pub async fn archive_retention_sweep(&self) -> Result<usize> {
        self.archive_retention_sweep_at(Utc::now()).await
    }

    /// Drop archives past their retention. Archives of never-run pipelines
    /// and of pipelines that ran have separate retention windows.
    pub async fn archive_retention_sweep_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let windows = [
            (true, self.config.archive_retain_analyzed_secs),
            (false, self.config.archive_retain_finished_secs),
        ];
        let mut deleted = 0;
        for (analyzed, retain_secs) in windows {
            let Some(cutoff) = i64::try_from(retain_secs)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .and_then(|window| now.checked_sub_signed(window))
            else {
                continue;
            };
            let n = self.store.delete_archives_before(cutoff, analyzed).await?;
            if n > 0 {
                info!(analyzed, deleted = n, "expired pipeline archives deleted");
            }
            deleted += n;
        }
        Ok(deleted)
    }
}
