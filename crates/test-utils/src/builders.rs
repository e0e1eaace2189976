#![allow(dead_code)]

use std::collections::BTreeMap;

use pipengine::definition::{
    Definition, LoopDef, OutputDef, RawDefinition, SnippetDef, StageDef, TaskDef,
};
use pipengine::model::TaskPolicy;

use crate::fake_executor::FAKE_EXECUTOR;

/// Builder for `Definition` to simplify test setup.
pub struct DefinitionBuilder {
    raw: RawDefinition,
}

impl DefinitionBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            raw: RawDefinition {
                name: name.to_string(),
                source: "test".to_string(),
                params: BTreeMap::new(),
                envs: BTreeMap::new(),
                secrets: BTreeMap::new(),
                labels: BTreeMap::new(),
                stages: Vec::new(),
                outputs: Vec::new(),
            },
        }
    }

    pub fn source(mut self, source: &str) -> Self {
        self.raw.source = source.to_string();
        self
    }

    pub fn param(mut self, key: &str, value: &str) -> Self {
        self.raw.params.insert(key.to_string(), value.to_string());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.raw.envs.insert(key.to_string(), value.to_string());
        self
    }

    pub fn secret(mut self, key: &str, value: &str) -> Self {
        self.raw.secrets.insert(key.to_string(), value.to_string());
        self
    }

    /// Append a stage holding `tasks`.
    pub fn stage(mut self, tasks: impl IntoIterator<Item = TaskDefBuilder>) -> Self {
        self.raw.stages.push(StageDef {
            name: format!("stage-{}", self.raw.stages.len()),
            tasks: tasks.into_iter().map(TaskDefBuilder::build).collect(),
        });
        self
    }

    pub fn output(mut self, name: &str, reference: &str) -> Self {
        self.raw.outputs.push(OutputDef {
            name: name.to_string(),
            reference: reference.to_string(),
        });
        self
    }

    pub fn build_raw(self) -> RawDefinition {
        self.raw
    }

    pub fn build(self) -> Definition {
        Definition::try_from(self.raw).expect("Failed to build valid definition from builder")
    }
}

/// Builder for `TaskDef`. Tasks run on the fake executor by default.
pub struct TaskDefBuilder {
    task: TaskDef,
}

impl TaskDefBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            task: TaskDef {
                name: name.to_string(),
                executor: FAKE_EXECUTOR.to_string(),
                cmd: format!("echo {name}"),
                after: None,
                allow_failure: false,
                condition: None,
                loop_def: None,
                policy: TaskPolicy::NewRun,
                snippet: None,
                envs: BTreeMap::new(),
            },
        }
    }

    /// Explicit predecessors; without this the whole previous stage is used.
    pub fn after(mut self, deps: &[&str]) -> Self {
        self.task.after = Some(deps.iter().map(|d| d.to_string()).collect());
        self
    }

    pub fn executor(mut self, executor: &str) -> Self {
        self.task.executor = executor.to_string();
        self
    }

    pub fn cmd(mut self, cmd: &str) -> Self {
        self.task.cmd = cmd.to_string();
        self
    }

    pub fn allow_failure(mut self) -> Self {
        self.task.allow_failure = true;
        self
    }

    pub fn condition(mut self, expr: &str) -> Self {
        self.task.condition = Some(expr.to_string());
        self
    }

    /// Loop until `break_expr` holds, one second apart, at most `max_times`
    /// executions.
    pub fn loop_until(mut self, break_expr: &str, max_times: u64) -> Self {
        self.task.loop_def = Some(LoopDef {
            break_expr: break_expr.to_string(),
            max_times: Some(max_times),
            interval_sec: Some(1),
            decline_ratio: Some(1.0),
            decline_limit_sec: Some(1),
        });
        self
    }

    pub fn policy(mut self, policy: TaskPolicy) -> Self {
        self.task.policy = policy;
        self
    }

    pub fn snippet(mut self, definition: &str, params: &[(&str, &str)]) -> Self {
        self.task.snippet = Some(SnippetDef {
            definition: definition.to_string(),
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.task.envs.insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> TaskDef {
        self.task
    }
}

/// Shorthand for `TaskDefBuilder::new`.
pub fn task(name: &str) -> TaskDefBuilder {
    TaskDefBuilder::new(name)
}
