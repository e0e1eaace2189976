// src/gc/ensure.rs

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::GcManager;
use crate::errors::Result;
use crate::model::PipelineId;
use crate::store::PipelineQuery;

/// TTL given to back-filled wait-records; they fire almost immediately.
const BACKFILL_TTL_SECS: u64 = 5;

/// What one ensure sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records past their deadline that were force-deleted.
    pub expired: usize,
    /// Records created for pipelines that predate tracking.
    pub backfilled: usize,
    /// True when another instance held the sweep lock.
    pub skipped: bool,
}

impl GcManager {
    /// Run one ensure sweep against the current wall clock.
    pub async fn ensure_sweep(&self) -> Result<SweepReport> {
        self.ensure_sweep_at(Utc::now()).await
    }

    /// Force-delete every main wait-record whose deadline is at or before
    /// `now`, then back-fill records for untracked pipelines.
    ///
    /// Deleting a record is observed by the watch listeners exactly like a
    /// lease expiry, so the normal handlers do the collection.
    pub async fn ensure_sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let Some(lock) = self.lock("ensure").await? else {
            debug!("ensure sweep locked by another instance");
            return Ok(SweepReport {
                skipped: true,
                ..SweepReport::default()
            });
        };

        let result = self.sweep_locked(now).await;
        if let Err(err) = lock.unlock().await {
            warn!(error = %err, "failed to release ensure lock");
        }
        result
    }

    async fn sweep_locked(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for prefix in [&self.config.resource_prefix, &self.config.database_prefix] {
            report.expired += self.expire_overdue(prefix, now).await?;
        }
        if let Some(since) = self.config.tracking_since {
            report.backfilled = self.backfill(since).await?;
        }
        if report.expired > 0 || report.backfilled > 0 {
            info!(
                expired = report.expired,
                backfilled = report.backfilled,
                "ensure sweep"
            );
        }
        Ok(report)
    }

    async fn expire_overdue(&self, prefix: &str, now: DateTime<Utc>) -> Result<usize> {
        let mut expired = 0;
        for (key, _) in self.coord.list(&format!("{prefix}/")).await? {
            if Self::record_name(prefix, &key).is_none() {
                continue;
            }
            let Some(record) = self.read_record(&key).await? else {
                continue;
            };
            if record.gc_at <= now && self.coord.delete(&key).await? {
                debug!(%key, gc_at = %record.gc_at, "overdue wait-record deleted");
                expired += 1;
            }
        }
        Ok(expired)
    }

    fn checkpoint_key(&self) -> String {
        format!("{}/checkpoint/db-backfill", self.config.lock_prefix)
    }

    /// Arm records for pipelines created before tracking started. Progress
    /// is checkpointed per page so each pipeline is visited once.
    async fn backfill(&self, since: DateTime<Utc>) -> Result<usize> {
        let checkpoint_key = self.checkpoint_key();
        let mut last_id: Option<PipelineId> = self
            .coord
            .get(&checkpoint_key)
            .await?
            .and_then(|raw| raw.parse().ok());
        let mut armed = 0;

        loop {
            let query = PipelineQuery {
                created_before: Some(since),
                id_after: last_id,
                ..PipelineQuery::default()
            }
            .page(0, self.config.compensate_page_size);
            let page = self.store.list_pipelines(&query).await?;
            let Some(last) = page.last() else { break };
            let page_last = last.id;

            for pipeline in &page {
                if pipeline.status.can_delete()
                    && self
                        .coord
                        .get(&self.database_key(pipeline.id))
                        .await?
                        .is_none()
                {
                    self.wait_database_gc(pipeline.id, BACKFILL_TTL_SECS, pipeline.status.is_end())
                        .await?;
                    armed += 1;
                }
                if pipeline.status.is_end() && !pipeline.extra.gc_complete {
                    self.wait_resource_gc(pipeline.namespace(), pipeline.id, BACKFILL_TTL_SECS)
                        .await?;
                    armed += 1;
                }
            }

            self.coord
                .put(&checkpoint_key, page_last.to_string(), None)
                .await?;
            last_id = Some(page_last);
        }
        Ok(armed)
    }
}
