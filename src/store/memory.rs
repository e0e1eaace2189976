// src/store/memory.rs

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::errors::{EngineError, Result};
use crate::model::{
    Archive, Pipeline, PipelineExtra, PipelineId, Report, Stage, StageId, Status, Task, TaskExtra,
    TaskId, TaskResult,
};

use super::{PipelineQuery, PipelineStore};

#[derive(Debug, Default)]
struct Tables {
    next_id: u64,
    pipelines: BTreeMap<PipelineId, Pipeline>,
    stages: BTreeMap<StageId, Stage>,
    tasks: BTreeMap<TaskId, Task>,
    reports: BTreeMap<u64, Report>,
    archives: BTreeMap<PipelineId, Archive>,
}

impl Tables {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn pipeline_mut(&mut self, id: PipelineId) -> Result<&mut Pipeline> {
        self.pipelines
            .get_mut(&id)
            .ok_or(EngineError::PipelineNotFound(id))
    }

    fn task_mut(&mut self, id: TaskId) -> Result<&mut Task> {
        self.tasks.get_mut(&id).ok_or(EngineError::TaskNotFound(id))
    }
}

/// In-memory [`PipelineStore`].
///
/// One id sequence is shared by every table, so ids are unique across
/// record kinds and strictly increasing in creation order.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of live pipelines; test helper.
    pub async fn pipeline_count(&self) -> usize {
        self.tables.lock().await.pipelines.len()
    }
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn create_pipeline(&self, mut pipeline: Pipeline) -> Result<Pipeline> {
        let mut guard = self.tables.lock().await;
        pipeline.id = guard.allocate();
        guard.pipelines.insert(pipeline.id, pipeline.clone());
        Ok(pipeline)
    }

    async fn find_pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>> {
        Ok(self.tables.lock().await.pipelines.get(&id).cloned())
    }

    async fn update_pipeline_status(&self, id: PipelineId, status: Status) -> Result<()> {
        self.tables.lock().await.pipeline_mut(id)?.status = status;
        Ok(())
    }

    async fn update_pipeline_extra(&self, id: PipelineId, extra: PipelineExtra) -> Result<()> {
        self.tables.lock().await.pipeline_mut(id)?.extra = extra;
        Ok(())
    }

    async fn update_pipeline_times(
        &self,
        id: PipelineId,
        time_begin: Option<DateTime<Utc>>,
        time_end: Option<DateTime<Utc>>,
        cost_time_sec: i64,
    ) -> Result<()> {
        let mut guard = self.tables.lock().await;
        let pipeline = guard.pipeline_mut(id)?;
        pipeline.time_begin = time_begin;
        pipeline.time_end = time_end;
        pipeline.cost_time_sec = cost_time_sec;
        Ok(())
    }

    async fn set_pipeline_label(&self, id: PipelineId, key: &str, value: &str) -> Result<()> {
        self.tables
            .lock()
            .await
            .pipeline_mut(id)?
            .labels
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn list_pipelines(&self, query: &PipelineQuery) -> Result<Vec<Pipeline>> {
        let guard = self.tables.lock().await;
        let iter = guard
            .pipelines
            .values()
            .filter(|p| query.matches(p))
            .skip(query.offset)
            .cloned();
        Ok(if query.limit == 0 {
            iter.collect()
        } else {
            iter.take(query.limit).collect()
        })
    }

    async fn latest_success_pipeline(
        &self,
        source: &str,
        name: &str,
        nested: bool,
    ) -> Result<Option<Pipeline>> {
        let guard = self.tables.lock().await;
        Ok(guard
            .pipelines
            .values()
            .rev()
            .find(|p| {
                p.source == source
                    && p.name == name
                    && p.is_snippet == nested
                    && p.status == Status::Success
            })
            .cloned())
    }

    async fn create_stage(&self, mut stage: Stage) -> Result<Stage> {
        let mut guard = self.tables.lock().await;
        stage.id = guard.allocate();
        guard.stages.insert(stage.id, stage.clone());
        Ok(stage)
    }

    async fn list_stages(&self, pipeline_id: PipelineId) -> Result<Vec<Stage>> {
        let guard = self.tables.lock().await;
        let mut stages: Vec<Stage> = guard
            .stages
            .values()
            .filter(|s| s.pipeline_id == pipeline_id)
            .cloned()
            .collect();
        stages.sort_by_key(|s| s.order);
        Ok(stages)
    }

    async fn create_task(&self, mut task: Task) -> Result<Task> {
        let mut guard = self.tables.lock().await;
        task.id = guard.allocate();
        guard.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn find_task(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.tables.lock().await.tasks.get(&id).cloned())
    }

    async fn list_tasks(&self, pipeline_id: PipelineId) -> Result<Vec<Task>> {
        let guard = self.tables.lock().await;
        Ok(guard
            .tasks
            .values()
            .filter(|t| t.pipeline_id == pipeline_id)
            .cloned()
            .collect())
    }

    async fn update_task_status(&self, id: TaskId, status: Status) -> Result<()> {
        self.tables.lock().await.task_mut(id)?.status = status;
        Ok(())
    }

    async fn update_task_result(&self, id: TaskId, result: TaskResult) -> Result<()> {
        self.tables.lock().await.task_mut(id)?.result = result;
        Ok(())
    }

    async fn update_task_extra(&self, id: TaskId, extra: TaskExtra) -> Result<()> {
        self.tables.lock().await.task_mut(id)?.extra = extra;
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let mut guard = self.tables.lock().await;
        let row = guard.task_mut(task.id)?;
        *row = task.clone();
        Ok(())
    }

    async fn create_report(&self, mut report: Report) -> Result<Report> {
        let mut guard = self.tables.lock().await;
        report.id = guard.allocate();
        guard.reports.insert(report.id, report.clone());
        Ok(report)
    }

    async fn list_reports(&self, pipeline_id: PipelineId) -> Result<Vec<Report>> {
        let guard = self.tables.lock().await;
        Ok(guard
            .reports
            .values()
            .filter(|r| r.pipeline_id == pipeline_id)
            .cloned()
            .collect())
    }

    async fn create_archive(&self, archive: Archive) -> Result<()> {
        self.tables
            .lock()
            .await
            .archives
            .insert(archive.pipeline_id, archive);
        Ok(())
    }

    async fn find_archive(&self, pipeline_id: PipelineId) -> Result<Option<Archive>> {
        Ok(self.tables.lock().await.archives.get(&pipeline_id).cloned())
    }

    async fn delete_archives_before(
        &self,
        created_before: DateTime<Utc>,
        analyzed: bool,
    ) -> Result<usize> {
        let mut guard = self.tables.lock().await;
        let before = guard.archives.len();
        guard.archives.retain(|_, a| {
            (a.pipeline.status == Status::Analyzed) != analyzed
                || a.pipeline.time_created >= created_before
        });
        Ok(before - guard.archives.len())
    }

    async fn delete_pipeline_related(&self, id: PipelineId) -> Result<()> {
        let mut guard = self.tables.lock().await;
        guard.pipelines.remove(&id);
        guard.stages.retain(|_, s| s.pipeline_id != id);
        guard.tasks.retain(|_, t| t.pipeline_id != id);
        guard.reports.retain(|_, r| r.pipeline_id != id);
        Ok(())
    }
}
