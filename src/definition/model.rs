// src/definition/model.rs

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::model::{LoopStrategy, TaskPolicy};

pub const SNIPPET_EXECUTOR: &str = "snippet";

fn default_source() -> String {
    "local".to_string()
}

fn default_executor() -> String {
    crate::exec::ShellExecutor::DEFAULT_NAME.to_string()
}

/// A pipeline definition as read from TOML.
///
/// ```toml
/// name = "build"
///
/// [params]
/// target = "release"
///
/// [[stage]]
/// name = "compile"
///
///   [[stage.task]]
///   name = "A"
///   cmd = "make ${params.target}"
///
/// [[stage]]
/// name = "test"
///
///   [[stage.task]]
///   name = "B"
///   cmd = "make test"
///   allow_failure = true
///
/// [[output]]
/// name = "version"
/// ref = "${{ outputs.A.version }}"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct RawDefinition {
    pub name: String,
    #[serde(default = "default_source")]
    pub source: String,
    /// Declared run parameters and their default values.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default, rename = "stage")]
    pub stages: Vec<StageDef>,
    #[serde(default, rename = "output")]
    pub outputs: Vec<OutputDef>,
}

/// `[[stage]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct StageDef {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "task")]
    pub tasks: Vec<TaskDef>,
}

/// `[[stage.task]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskDef {
    pub name: String,
    #[serde(default = "default_executor")]
    pub executor: String,
    #[serde(default)]
    pub cmd: String,
    /// Predecessors; `None` means every task of the previous stage.
    #[serde(default)]
    pub after: Option<Vec<String>>,
    #[serde(default)]
    pub allow_failure: bool,
    #[serde(default, rename = "if")]
    pub condition: Option<String>,
    #[serde(default, rename = "loop")]
    pub loop_def: Option<LoopDef>,
    #[serde(default)]
    pub policy: TaskPolicy,
    #[serde(default)]
    pub snippet: Option<SnippetDef>,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
}

/// `[stage.task.loop]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct LoopDef {
    #[serde(default, rename = "break")]
    pub break_expr: String,
    #[serde(default)]
    pub max_times: Option<u64>,
    #[serde(default)]
    pub interval_sec: Option<u64>,
    #[serde(default)]
    pub decline_ratio: Option<f64>,
    #[serde(default)]
    pub decline_limit_sec: Option<u64>,
}

impl LoopDef {
    pub fn strategy(&self) -> LoopStrategy {
        let d = LoopStrategy::default();
        LoopStrategy {
            max_times: self.max_times.unwrap_or(d.max_times),
            interval_sec: self.interval_sec.unwrap_or(d.interval_sec),
            decline_ratio: self.decline_ratio.unwrap_or(d.decline_ratio),
            decline_limit_sec: self.decline_limit_sec.unwrap_or(d.decline_limit_sec),
        }
    }
}

/// `[stage.task.snippet]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct SnippetDef {
    /// Name of the nested definition in the catalog.
    pub definition: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// `[[output]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputDef {
    pub name: String,
    #[serde(rename = "ref")]
    pub reference: String,
}

/// Validated definition; every task carries its resolved predecessor list.
#[derive(Debug, Clone)]
pub struct Definition {
    pub name: String,
    pub source: String,
    pub params: BTreeMap<String, String>,
    pub envs: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub stages: Vec<StageDef>,
    pub outputs: Vec<OutputDef>,
}

impl Definition {
    pub(crate) fn new_unchecked(raw: RawDefinition, stages: Vec<StageDef>) -> Self {
        Self {
            name: raw.name,
            source: raw.source,
            params: raw.params,
            envs: raw.envs,
            secrets: raw.secrets,
            labels: raw.labels,
            stages,
            outputs: raw.outputs,
        }
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskDef> {
        self.stages.iter().flat_map(|s| s.tasks.iter())
    }

    /// Predecessors of a validated task.
    pub fn after_of(task: &TaskDef) -> &[String] {
        task.after.as_deref().unwrap_or(&[])
    }
}
