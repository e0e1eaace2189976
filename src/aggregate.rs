// src/aggregate.rs

//! Status reduction: task -> stage -> pipeline.
//!
//! Every function here is pure and deterministic. Stored statuses are never
//! rewritten; allow-failure and success-equivalent statuses only affect the
//! computed value.

use std::fmt::Write as _;

use crate::errors::{EngineError, Result};
use crate::model::{Stage, Status, Task};

/// Minimal view of a task needed for aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskView {
    pub status: Option<Status>,
    pub allow_failure: bool,
}

impl TaskView {
    pub fn new(status: Status, allow_failure: bool) -> Self {
        Self {
            status: Some(status),
            allow_failure,
        }
    }
}

impl From<&Task> for TaskView {
    fn from(task: &Task) -> Self {
        Self::new(task.status, task.allow_failure)
    }
}

/// Status of one task as seen by its stage.
pub fn task_status(task: TaskView) -> Result<Status> {
    let status = task
        .status
        .ok_or_else(|| EngineError::EmptyStatus("task".to_string()))?;
    if status.is_end() && task.allow_failure {
        return Ok(Status::Success);
    }
    Ok(status)
}

/// Status of a stage from its tasks.
///
/// Precedence: Born (advance needed), then all-terminal handling where Paused
/// wins over Success, then Running. A stage of only Disabled tasks is itself
/// Disabled; Disabled mixed with Success counts as Success.
pub fn stage_status(tasks: &[TaskView]) -> Result<Status> {
    if tasks.is_empty() {
        return Ok(Status::Success);
    }

    let statuses = tasks
        .iter()
        .map(|t| task_status(*t))
        .collect::<Result<Vec<_>>>()?;

    let born = statuses.iter().filter(|s| **s == Status::Born).count();
    let success_like = statuses.iter().filter(|s| s.is_success_like()).count();
    if born > 0 && born + success_like == statuses.len() {
        return Ok(Status::Born);
    }

    let all_end_or_paused = statuses
        .iter()
        .all(|s| s.is_end() || *s == Status::Paused);
    if all_end_or_paused {
        if statuses.iter().any(|s| *s == Status::Paused) {
            return Ok(Status::Paused);
        }
        if statuses.iter().all(|s| *s == Status::Disabled) {
            return Ok(Status::Disabled);
        }
        if success_like == statuses.len() {
            return Ok(Status::Success);
        }
        return Ok(Status::Failed);
    }

    Ok(Status::Running)
}

/// Status of a whole pipeline from its ordered stages.
///
/// `stages` must be in stage order; each entry carries that stage's tasks.
pub fn pipeline_status(stages: &[Vec<TaskView>]) -> Result<Status> {
    if stages.is_empty() {
        return Ok(Status::Success);
    }

    let stage_statuses = stages
        .iter()
        .map(|tasks| stage_status(tasks))
        .collect::<Result<Vec<_>>>()?;

    let last = stage_statuses.len() - 1;
    for (idx, status) in stage_statuses.iter().copied().enumerate() {
        if status == Status::Paused {
            return Ok(Status::Paused);
        }
        if status == Status::Disabled {
            if idx == last {
                return Ok(Status::Success);
            }
            continue;
        }
        if status.is_end() {
            if status.is_failed() {
                return Ok(Status::Failed);
            }
            if idx == last {
                return Ok(Status::Success);
            }
            continue;
        }
        return Ok(Status::Running);
    }

    Err(EngineError::StrangeStatus {
        summary: summarize(stages, &stage_statuses),
    })
}

/// Group tasks by stage order and aggregate.
pub fn pipeline_status_of(stages: &[Stage], tasks: &[Task]) -> Result<Status> {
    let mut ordered: Vec<&Stage> = stages.iter().collect();
    ordered.sort_by_key(|s| s.order);

    let grouped: Vec<Vec<TaskView>> = ordered
        .iter()
        .map(|stage| {
            tasks
                .iter()
                .filter(|t| t.stage_id == stage.id)
                .map(TaskView::from)
                .collect()
        })
        .collect();

    pipeline_status(&grouped)
}

/// Cheap whole-pipeline status without stage precision.
///
/// Used mid-reconcile to answer "is everything already done".
pub fn flat_pipeline_status(tasks: &[TaskView]) -> Result<Status> {
    let total = tasks.len();
    if total == 0 {
        return Ok(Status::Success);
    }

    let (mut success, mut failed, mut analyzed, mut born, mut paused, mut running) =
        (0usize, 0usize, 0usize, 0usize, 0usize, 0usize);
    for task in tasks {
        match task_status(*task)? {
            s if s.is_success_like() => success += 1,
            s if s.is_end() => failed += 1,
            Status::Analyzed => analyzed += 1,
            Status::Born => born += 1,
            Status::Paused => paused += 1,
            _ => running += 1,
        }
    }

    if analyzed == total {
        return Ok(Status::Analyzed);
    }
    if success == total {
        return Ok(Status::Success);
    }
    if success + failed == total {
        return Ok(Status::Failed);
    }
    if paused > 0 && analyzed + born + running == 0 {
        return Ok(Status::Paused);
    }
    Ok(Status::Running)
}

fn summarize(stages: &[Vec<TaskView>], stage_statuses: &[Status]) -> String {
    let mut out = String::new();
    for (idx, (tasks, status)) in stages.iter().zip(stage_statuses).enumerate() {
        let task_statuses: Vec<String> = tasks
            .iter()
            .map(|t| match t.status {
                Some(s) if t.allow_failure => format!("{s}(allow_failure)"),
                Some(s) => s.to_string(),
                None => "<empty>".to_string(),
            })
            .collect();
        let _ = write!(out, "[stage {idx}: {status} <- {task_statuses:?}]");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_status_is_an_error() {
        let err = task_status(TaskView {
            status: None,
            allow_failure: false,
        })
        .unwrap_err();
        assert!(matches!(err, EngineError::EmptyStatus(_)));
    }

    #[test]
    fn flat_status_buckets() {
        let v = |s| TaskView::new(s, false);
        assert_eq!(
            flat_pipeline_status(&[v(Status::Analyzed), v(Status::Analyzed)]).unwrap(),
            Status::Analyzed
        );
        assert_eq!(
            flat_pipeline_status(&[v(Status::Success), v(Status::NoNeedBySystem)]).unwrap(),
            Status::Success
        );
        assert_eq!(
            flat_pipeline_status(&[v(Status::Success), v(Status::Failed)]).unwrap(),
            Status::Failed
        );
        assert_eq!(
            flat_pipeline_status(&[v(Status::Paused), v(Status::Success)]).unwrap(),
            Status::Paused
        );
        assert_eq!(
            flat_pipeline_status(&[v(Status::Success), v(Status::Running)]).unwrap(),
            Status::Running
        );
    }
}
