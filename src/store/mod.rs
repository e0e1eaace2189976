// src/store/mod.rs

//! Persistence collaborator.
//!
//! The engine never talks to a database directly; it goes through
//! [`PipelineStore`]. Writes are column-granular (status only, result only,
//! extra only) so concurrent units of work touching different columns of
//! the same row do not clobber each other.
//!
//! [`MemoryStore`] is the in-process implementation used by the CLI and by
//! tests.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::model::{
    Archive, Pipeline, PipelineExtra, PipelineId, Report, Stage, Status, Task, TaskExtra, TaskId,
    TaskResult,
};

pub use memory::MemoryStore;

/// Filter + page for [`PipelineStore::list_pipelines`].
///
/// Results are ordered by ascending pipeline id.
#[derive(Debug, Clone, Default)]
pub struct PipelineQuery {
    /// Empty means any status.
    pub statuses: Vec<Status>,
    pub ended_before: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    /// Only ids strictly greater than this.
    pub id_after: Option<PipelineId>,
    pub offset: usize,
    /// Zero means no limit.
    pub limit: usize,
}

impl PipelineQuery {
    pub fn terminal() -> Self {
        Self {
            statuses: Status::ALL.iter().copied().filter(|s| s.is_end()).collect(),
            ..Self::default()
        }
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }

    pub fn matches(&self, pipeline: &Pipeline) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&pipeline.status) {
            return false;
        }
        if let Some(before) = self.ended_before {
            match pipeline.time_end {
                Some(end) if end < before => {}
                _ => return false,
            }
        }
        if let Some(before) = self.created_before {
            if pipeline.time_created >= before {
                return false;
            }
        }
        if let Some(id) = self.id_after {
            if pipeline.id <= id {
                return false;
            }
        }
        true
    }
}

#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Insert a pipeline; the store assigns the id.
    async fn create_pipeline(&self, pipeline: Pipeline) -> Result<Pipeline>;
    async fn find_pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>>;
    async fn update_pipeline_status(&self, id: PipelineId, status: Status) -> Result<()>;
    async fn update_pipeline_extra(&self, id: PipelineId, extra: PipelineExtra) -> Result<()>;
    async fn update_pipeline_times(
        &self,
        id: PipelineId,
        time_begin: Option<DateTime<Utc>>,
        time_end: Option<DateTime<Utc>>,
        cost_time_sec: i64,
    ) -> Result<()>;
    async fn set_pipeline_label(&self, id: PipelineId, key: &str, value: &str) -> Result<()>;
    async fn list_pipelines(&self, query: &PipelineQuery) -> Result<Vec<Pipeline>>;
    /// Most recent successful run of `source` + `name`, restricted to
    /// nested (`nested = true`) or top-level pipelines.
    async fn latest_success_pipeline(
        &self,
        source: &str,
        name: &str,
        nested: bool,
    ) -> Result<Option<Pipeline>>;

    async fn create_stage(&self, stage: Stage) -> Result<Stage>;
    async fn list_stages(&self, pipeline_id: PipelineId) -> Result<Vec<Stage>>;

    async fn create_task(&self, task: Task) -> Result<Task>;
    async fn find_task(&self, id: TaskId) -> Result<Option<Task>>;
    async fn list_tasks(&self, pipeline_id: PipelineId) -> Result<Vec<Task>>;
    async fn update_task_status(&self, id: TaskId, status: Status) -> Result<()>;
    async fn update_task_result(&self, id: TaskId, result: TaskResult) -> Result<()>;
    async fn update_task_extra(&self, id: TaskId, extra: TaskExtra) -> Result<()>;
    /// Whole-row write; used by resets and policy splices.
    async fn update_task(&self, task: &Task) -> Result<()>;

    async fn create_report(&self, report: Report) -> Result<Report>;
    async fn list_reports(&self, pipeline_id: PipelineId) -> Result<Vec<Report>>;

    async fn create_archive(&self, archive: Archive) -> Result<()>;
    async fn find_archive(&self, pipeline_id: PipelineId) -> Result<Option<Archive>>;
    /// Delete archives of pipelines created before `created_before`, either
    /// those archived while Analyzed (`analyzed = true`) or all others.
    /// Returns the number deleted.
    async fn delete_archives_before(
        &self,
        created_before: DateTime<Utc>,
        analyzed: bool,
    ) -> Result<usize>;

    /// Delete base, extra, labels, stages, tasks and reports of a pipeline.
    async fn delete_pipeline_related(&self, id: PipelineId) -> Result<()>;

    async fn get_pipeline(&self, id: PipelineId) -> Result<Pipeline> {
        self.find_pipeline(id)
            .await?
            .ok_or(crate::errors::EngineError::PipelineNotFound(id))
    }

    async fn get_task(&self, id: TaskId) -> Result<Task> {
        self.find_task(id)
            .await?
            .ok_or(crate::errors::EngineError::TaskNotFound(id))
    }
}
