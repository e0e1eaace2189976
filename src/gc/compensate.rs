// src/gc/compensate.rs

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::GcManager;
use crate::errors::Result;
use crate::model::{Pipeline, PipelineId};
use crate::store::PipelineQuery;

const REARM_TTL_SECS: u64 = 5;

/// What one compensation sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompensationReport {
    pub scanned: usize,
    pub resource_rearmed: usize,
    pub database_rearmed: usize,
    pub skipped: bool,
}

impl GcManager {
    pub async fn compensate_sweep(&self) -> Result<CompensationReport> {
        self.compensate_sweep_at(Utc::now()).await
    }

    /// Re-arm wait-records for terminal pipelines whose resources should
    /// have been collected long ago but were not, typically because a
    /// lease notification was lost.
    pub async fn compensate_sweep_at(&self, now: DateTime<Utc>) -> Result<CompensationReport> {
        let Some(lock) = self.lock("compensate").await? else {
            debug!("compensation sweep locked by another instance");
            return Ok(CompensationReport {
                skipped: true,
                ..CompensationReport::default()
            });
        };

        let result = self.compensate_locked(now).await;
        if let Err(err) = lock.unlock().await {
            warn!(error = %err, "failed to release compensate lock");
        }
        result
    }

    async fn compensate_locked(&self, now: DateTime<Utc>) -> Result<CompensationReport> {
        let buffer = chrono::Duration::seconds(self.config.compensate_buffer_secs as i64);
        let mut report = CompensationReport::default();
        let mut last_id: Option<PipelineId> = None;

        loop {
            let query = PipelineQuery {
                ended_before: Some(now - buffer),
                id_after: last_id,
                ..PipelineQuery::terminal()
            }
            .page(0, self.config.compensate_page_size);
            let page = self.store.list_pipelines(&query).await?;
            let Some(last) = page.last() else { break };
            last_id = Some(last.id);

            for pipeline in &page {
                report.scanned += 1;
                self.compensate_one(pipeline, now, &mut report).await?;
            }
        }

        if report.resource_rearmed > 0 || report.database_rearmed > 0 {
            info!(
                scanned = report.scanned,
                resource = report.resource_rearmed,
                database = report.database_rearmed,
                "compensation re-armed wait-records"
            );
        }
        Ok(report)
    }

    async fn compensate_one(
        &self,
        pipeline: &Pipeline,
        now: DateTime<Utc>,
        report: &mut CompensationReport,
    ) -> Result<()> {
        if pipeline.extra.gc_complete {
            return Ok(());
        }
        let Some(end) = pipeline.time_end else {
            return Ok(());
        };
        let elapsed = (now - end).num_seconds().max(0) as u64;
        let policy = &pipeline.extra.gc;
        if elapsed <= policy.resource_ttl_for(pipeline.status) + self.config.compensate_buffer_secs
        {
            return Ok(());
        }

        let namespace = pipeline.namespace();
        if self
            .coord
            .get(&self.resource_key(namespace))
            .await?
            .is_none()
        {
            self.wait_resource_gc(namespace, pipeline.id, REARM_TTL_SECS)
                .await?;
            report.resource_rearmed += 1;
        }

        if self
            .coord
            .get(&self.database_key(pipeline.id))
            .await?
            .is_none()
        {
            let remaining = policy
                .database_ttl_for(pipeline.status)
                .saturating_sub(elapsed)
                .max(REARM_TTL_SECS);
            self.wait_database_gc(pipeline.id, remaining, policy.archive_for(pipeline.status))
                .await?;
            report.database_rearmed += 1;
        }
        Ok(())
    }
}
