// src/model/mod.rs

//! Records the engine reads and writes through the persistence layer.
//!
//! - [`status`] is the closed status enum shared by every record kind.
//! - [`pipeline`] holds the pipeline base and its extra record.
//! - [`task`] holds tasks, loop options, policies and snippet links.

pub mod pipeline;
pub mod status;
pub mod task;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use pipeline::{GcPolicy, NestLink, OutputDecl, Pipeline, PipelineExtra, Snapshot};
pub use status::Status;
pub use task::{
    LoopOptions, LoopStrategy, SnippetRef, Task, TaskExtra, TaskName, TaskPolicy, TaskResult,
};

pub type PipelineId = u64;
pub type StageId = u64;
pub type TaskId = u64;

/// Ordered position within a pipeline.
///
/// `previous_stage_id` is for display only; scheduling follows task edges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub id: StageId,
    pub pipeline_id: PipelineId,
    pub order: usize,
    pub name: String,
    pub previous_stage_id: Option<StageId>,
}

/// Free-form report attached to a pipeline (test summaries, links, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: u64,
    pub pipeline_id: PipelineId,
    pub kind: String,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

/// Denormalised snapshot of a pipeline written by database GC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Archive {
    pub pipeline_id: PipelineId,
    pub pipeline: Pipeline,
    pub stages: Vec<Stage>,
    pub tasks: Vec<Task>,
    pub reports: Vec<Report>,
    pub archived_at: DateTime<Utc>,
}
