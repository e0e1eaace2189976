// src/model/pipeline.rs

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{PipelineId, Status, TaskId};

/// A single execution of a pipeline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,
    /// Where the definition came from (repository, API caller, ...).
    pub source: String,
    /// Definition name; together with `source` identifies the logical unit.
    pub name: String,
    pub status: Status,
    pub is_snippet: bool,
    /// Free-form labels, used as a generic secondary index.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub extra: PipelineExtra,
    pub time_created: DateTime<Utc>,
    pub time_begin: Option<DateTime<Utc>>,
    pub time_end: Option<DateTime<Utc>>,
    /// Seconds between begin and end, `-1` until the pipeline ends.
    pub cost_time_sec: i64,
}

impl Pipeline {
    pub fn namespace(&self) -> &str {
        &self.extra.namespace
    }

    /// Root of the nesting chain; the pipeline itself when not nested.
    pub fn root_id(&self) -> PipelineId {
        self.extra
            .nest
            .as_ref()
            .map(NestLink::root_id)
            .unwrap_or(self.id)
    }
}

/// Extra record stored next to the pipeline base.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineExtra {
    /// Compute-resource grouping key.
    pub namespace: String,
    pub gc: GcPolicy,
    pub snapshot: Snapshot,
    /// Set when this pipeline runs on behalf of a snippet task.
    pub nest: Option<NestLink>,
    /// Declared outputs: output name -> reference to a task output.
    #[serde(default)]
    pub outputs: Vec<OutputDecl>,
    /// Output values computed at teardown.
    #[serde(default)]
    pub output_values: BTreeMap<String, String>,
    /// Resources have been reclaimed; only valid once the pipeline is terminal.
    #[serde(default)]
    pub gc_complete: bool,
    #[serde(default)]
    pub teardown_complete: bool,
}

/// GC settings captured at submission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcPolicy {
    pub resource_ttl_success_secs: u64,
    pub resource_ttl_failed_secs: u64,
    pub database_ttl_analyzed_secs: u64,
    pub database_ttl_finished_secs: u64,
    /// Archive instead of delete when the database GC fires on a pipeline
    /// that never ran.
    #[serde(default)]
    pub archive_analyzed: bool,
    /// Same, for pipelines that ran.
    #[serde(default)]
    pub archive_finished: bool,
}

impl Default for GcPolicy {
    fn default() -> Self {
        Self {
            resource_ttl_success_secs: 1800,
            resource_ttl_failed_secs: 1800,
            database_ttl_analyzed_secs: 86_400,
            database_ttl_finished_secs: 5_184_000,
            archive_analyzed: false,
            archive_finished: false,
        }
    }
}

impl GcPolicy {
    pub fn resource_ttl_for(&self, status: Status) -> u64 {
        if status.is_success_like() {
            self.resource_ttl_success_secs
        } else {
            self.resource_ttl_failed_secs
        }
    }

    pub fn database_ttl_for(&self, status: Status) -> u64 {
        if status == Status::Analyzed {
            self.database_ttl_analyzed_secs
        } else {
            self.database_ttl_finished_secs
        }
    }

    pub fn archive_for(&self, status: Status) -> bool {
        if status == Status::Analyzed {
            self.archive_analyzed
        } else {
            self.archive_finished
        }
    }
}

/// Run-time context resolved when the pipeline was submitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    /// Declared run parameters, possibly containing output references.
    #[serde(default)]
    pub run_params: BTreeMap<String, String>,
    /// Cached result of resolving `run_params`; `None` until resolved.
    #[serde(default)]
    pub resolved_params: Option<BTreeMap<String, String>>,
}

impl Snapshot {
    /// Parameters as seen by children: resolved when available.
    pub fn effective_params(&self) -> &BTreeMap<String, String> {
        self.resolved_params.as_ref().unwrap_or(&self.run_params)
    }
}

/// Link from a nested pipeline to the task that spawned it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NestLink {
    pub parent_pipeline_id: PipelineId,
    pub parent_task_id: TaskId,
    /// Ancestor pipelines, root first, direct parent last.
    pub ancestor_ids: Vec<PipelineId>,
}

impl NestLink {
    pub fn root_id(&self) -> PipelineId {
        self.ancestor_ids
            .first()
            .copied()
            .unwrap_or(self.parent_pipeline_id)
    }
}

/// A declared pipeline output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDecl {
    pub name: String,
    /// `${{ outputs.alias.key }}` or `${alias:OUTPUT:key}`.
    pub reference: String,
}
