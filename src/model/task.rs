// src/model/task.rs

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{PipelineId, StageId, Status, TaskId};

/// Canonical task name type; names are unique within a pipeline.
pub type TaskName = String;

/// A task instance belonging to exactly one stage of one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub pipeline_id: PipelineId,
    pub stage_id: StageId,
    pub stage_order: usize,
    pub name: TaskName,
    pub status: Status,
    /// Predecessor task names (the DAG edges).
    #[serde(default)]
    pub after: Vec<TaskName>,
    /// Executor name, resolved from the registry at dispatch.
    pub executor: String,
    #[serde(default)]
    pub allow_failure: bool,
    /// Guard expression; a task with a guard still runs after a failure.
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub loop_options: Option<LoopOptions>,
    #[serde(default)]
    pub policy: TaskPolicy,
    /// Present when this task runs a nested pipeline.
    #[serde(default)]
    pub snippet: Option<SnippetRef>,
    #[serde(default)]
    pub extra: TaskExtra,
    #[serde(default)]
    pub result: TaskResult,
    pub time_begin: Option<DateTime<Utc>>,
    pub time_end: Option<DateTime<Utc>>,
    pub cost_time_sec: i64,
}

impl Task {
    pub fn is_snippet(&self) -> bool {
        self.snippet.is_some()
    }

    /// Whether the task ever reached an executor.
    pub fn reached_executor(&self) -> bool {
        !self.is_snippet()
            && (!self.extra.uuid.is_empty() || !self.extra.previous_uuids.is_empty())
    }

    /// One view of the task per executor job it created: earlier loop
    /// iterations first, then the current job.
    pub fn executor_jobs(&self) -> Vec<Task> {
        self.extra
            .previous_uuids
            .iter()
            .chain(Some(&self.extra.uuid).filter(|u| !u.is_empty()))
            .map(|uuid| {
                let mut job = self.clone();
                job.extra.uuid = uuid.clone();
                job.extra.previous_uuids.clear();
                job
            })
            .collect()
    }

    /// Clear everything a previous attempt left behind, keeping identity,
    /// declaration and the loop counter.
    pub fn reset_for_rerun(&mut self) {
        self.status = Status::Analyzed;
        self.extra.uuid.clear();
        self.extra.previous_uuids.clear();
        self.extra.volumes.clear();
        self.result = TaskResult::default();
        self.time_begin = None;
        self.time_end = None;
        self.cost_time_sec = -1;
    }
}

/// Executor-facing details filled in while preparing the task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskExtra {
    /// Executor-side job identifier; empty until prepared.
    #[serde(default)]
    pub uuid: String,
    /// Jobs of finished loop iterations, still owned by resource GC.
    #[serde(default)]
    pub previous_uuids: Vec<String>,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    /// Working volumes produced by the task.
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Abnormal errors recorded while reconciling.
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Result metadata reported by the executor or copied from a nested pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Repeat-until configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopOptions {
    /// Loop stops once this evaluates true.
    pub break_expr: String,
    pub strategy: LoopStrategy,
    /// Survives task resets so `max_times` is enforceable.
    #[serde(default)]
    pub looped_times: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopStrategy {
    pub max_times: u64,
    pub interval_sec: u64,
    pub decline_ratio: f64,
    pub decline_limit_sec: u64,
}

impl Default for LoopStrategy {
    fn default() -> Self {
        Self {
            max_times: 10,
            interval_sec: 5,
            decline_ratio: 1.5,
            decline_limit_sec: 60,
        }
    }
}

/// Policy evaluated before a task (re)starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskPolicy {
    #[default]
    NewRun,
    TryLatestSuccessResult,
}

/// Reference from a snippet task to the pipeline it runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnippetRef {
    /// Definition name looked up in the definition catalog.
    pub definition: String,
    /// Parameters handed to the nested pipeline; may reference outputs.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Child pipeline, once created.
    #[serde(default)]
    pub pipeline_id: Option<PipelineId>,
}
