// src/dag/scheduler.rs

use std::collections::{BTreeSet, HashSet};

use tracing::{debug, warn};

use crate::dag::graph::DagGraph;
use crate::errors::{EngineError, Result};

/// Options for [`get_schedulable`].
#[derive(Debug, Clone, Copy)]
pub struct ScheduleOptions {
    /// Fail when a done name is never reached from the roots.
    ///
    /// Disable to allow arbitrary external "mark done" operations such as a
    /// manual skip.
    pub strict: bool,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self { strict: true }
    }
}

/// Compute the nodes that can be scheduled now.
///
/// A node is schedulable when it is not done, every predecessor is done, and
/// it is reachable from a root through done nodes only. The traversal starts
/// at every root and only walks past done nodes; each node is visited once.
pub fn get_schedulable(
    graph: &DagGraph,
    done: &HashSet<String>,
    opts: ScheduleOptions,
) -> Result<BTreeSet<String>> {
    let mut schedulable = BTreeSet::new();
    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = graph.roots().collect();
    stack.reverse();

    while let Some(name) = stack.pop() {
        if !visited.insert(name) {
            continue;
        }

        if done.contains(name) {
            for dependent in graph.dependents_of(name).iter().rev() {
                stack.push(dependent.as_str());
            }
            continue;
        }

        let deps_done = graph
            .dependencies_of(name)
            .iter()
            .all(|dep| done.contains(dep));
        if deps_done {
            schedulable.insert(name.to_string());
        }
    }

    let unreached: Vec<&String> = done
        .iter()
        .filter(|name| !visited.contains(name.as_str()))
        .collect();
    if !unreached.is_empty() {
        if opts.strict {
            return Err(EngineError::structural(format!(
                "done nodes not reachable from roots: {unreached:?}"
            )));
        }
        warn!(?unreached, "done nodes not reachable from roots; ignoring");
    }

    debug!(?schedulable, done = done.len(), "computed schedulable nodes");
    Ok(schedulable)
}
