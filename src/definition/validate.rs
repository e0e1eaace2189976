// src/definition/validate.rs

use std::collections::HashSet;

use crate::dag::{DagGraph, NodeSpec};
use crate::definition::model::{Definition, RawDefinition, SNIPPET_EXECUTOR, StageDef};
use crate::engine::params::output_aliases;
use crate::errors::{EngineError, Result};

impl TryFrom<RawDefinition> for Definition {
    type Error = EngineError;

    fn try_from(raw: RawDefinition) -> std::result::Result<Self, Self::Error> {
        validate_raw_definition(&raw)?;
        let stages = resolve_implicit_after(&raw.stages);
        validate_dag(&stages)?;
        validate_outputs(&raw, &stages)?;
        Ok(Definition::new_unchecked(raw, stages))
    }
}

fn validate_raw_definition(def: &RawDefinition) -> Result<()> {
    if def.name.trim().is_empty() {
        return Err(EngineError::ConfigError(
            "definition must have a non-empty `name`".to_string(),
        ));
    }
    if def.stages.iter().all(|s| s.tasks.is_empty()) {
        return Err(EngineError::ConfigError(format!(
            "definition '{}' must contain at least one [[stage.task]]",
            def.name
        )));
    }

    let mut seen = HashSet::new();
    for task in def.stages.iter().flat_map(|s| s.tasks.iter()) {
        if task.name.trim().is_empty() {
            return Err(EngineError::ConfigError(format!(
                "definition '{}' has a task without a name",
                def.name
            )));
        }
        if !seen.insert(task.name.as_str()) {
            return Err(EngineError::ConfigError(format!(
                "duplicate task name '{}'",
                task.name
            )));
        }
        match &task.snippet {
            Some(snippet) if snippet.definition.trim().is_empty() => {
                return Err(EngineError::ConfigError(format!(
                    "snippet task '{}' must name a `definition`",
                    task.name
                )));
            }
            None if task.executor.trim().is_empty() || task.executor == SNIPPET_EXECUTOR => {
                return Err(EngineError::ConfigError(format!(
                    "task '{}' has invalid executor '{}'",
                    task.name, task.executor
                )));
            }
            _ => {}
        }
    }

    for task in def.stages.iter().flat_map(|s| s.tasks.iter()) {
        for dep in task.after.iter().flatten() {
            if dep == &task.name {
                return Err(EngineError::ConfigError(format!(
                    "task '{}' cannot depend on itself in `after`",
                    task.name
                )));
            }
            if !seen.contains(dep.as_str()) {
                return Err(EngineError::ConfigError(format!(
                    "task '{}' has unknown dependency '{}' in `after`",
                    task.name, dep
                )));
            }
        }
    }
    Ok(())
}

/// Fill omitted `after` lists with every task of the previous stage.
fn resolve_implicit_after(stages: &[StageDef]) -> Vec<StageDef> {
    let mut previous: Vec<String> = Vec::new();
    let mut resolved = Vec::with_capacity(stages.len());
    for stage in stages {
        let mut stage = stage.clone();
        for task in &mut stage.tasks {
            if task.after.is_none() {
                task.after = Some(previous.clone());
            }
        }
        previous = stage.tasks.iter().map(|t| t.name.clone()).collect();
        resolved.push(stage);
    }
    resolved
}

fn validate_dag(stages: &[StageDef]) -> Result<()> {
    let specs = stages.iter().flat_map(|s| s.tasks.iter()).map(|t| {
        NodeSpec::new(t.name.clone(), t.after.clone().unwrap_or_default())
    });
    DagGraph::build(specs, true)?;
    Ok(())
}

fn validate_outputs(raw: &RawDefinition, stages: &[StageDef]) -> Result<()> {
    let names: HashSet<&str> = stages
        .iter()
        .flat_map(|s| s.tasks.iter())
        .map(|t| t.name.as_str())
        .collect();
    let mut seen = HashSet::new();
    for output in &raw.outputs {
        if !seen.insert(output.name.as_str()) {
            return Err(EngineError::ConfigError(format!(
                "duplicate output '{}'",
                output.name
            )));
        }
        let aliases = output_aliases(&output.reference);
        if aliases.is_empty() {
            return Err(EngineError::ConfigError(format!(
                "output '{}' must reference a task output",
                output.name
            )));
        }
        if let Some(unknown) = aliases.iter().find(|a| !names.contains(a.as_str())) {
            return Err(EngineError::ConfigError(format!(
                "output '{}' references unknown task '{}'",
                output.name, unknown
            )));
        }
    }
    Ok(())
}
