// src/dag/graph.rs

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::errors::{EngineError, Result};

/// Input node for [`DagGraph::build`]: a name plus its predecessor names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub name: String,
    pub after: Vec<String>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, after: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            after: after.into_iter().map(Into::into).collect(),
        }
    }
}

/// Internal node structure: stores immediate deps and dependents.
#[derive(Debug, Clone)]
struct DagNode {
    /// Direct dependencies: nodes that must be done before this one can run.
    deps: Vec<String>,
    /// Direct dependents: nodes that depend on this one.
    dependents: Vec<String>,
}

/// In-memory DAG keyed by node name.
///
/// Node order follows the input order so that traversal (and therefore log
/// output) is deterministic.
#[derive(Debug, Clone)]
pub struct DagGraph {
    order: Vec<String>,
    nodes: HashMap<String, DagNode>,
}

impl DagGraph {
    /// Build a graph, rejecting duplicate names and unresolvable predecessors.
    ///
    /// Cycle detection is optional: callers compiling from an already
    /// validated definition may skip it.
    pub fn build(specs: impl IntoIterator<Item = NodeSpec>, check_cycles: bool) -> Result<Self> {
        let mut order = Vec::new();
        let mut nodes: HashMap<String, DagNode> = HashMap::new();

        // First pass: create nodes with their dependency lists.
        for spec in specs {
            if nodes.contains_key(&spec.name) {
                return Err(EngineError::structural(format!(
                    "duplicate node name '{}'",
                    spec.name
                )));
            }
            order.push(spec.name.clone());
            nodes.insert(
                spec.name,
                DagNode {
                    deps: spec.after,
                    dependents: Vec::new(),
                },
            );
        }

        // Second pass: populate dependents based on deps.
        for name in &order {
            let deps = nodes.get(name).map(|n| n.deps.clone()).unwrap_or_default();
            for dep in deps {
                match nodes.get_mut(&dep) {
                    Some(dep_node) => dep_node.dependents.push(name.clone()),
                    None => {
                        return Err(EngineError::structural(format!(
                            "node '{name}' has unknown predecessor '{dep}'"
                        )));
                    }
                }
            }
        }

        let graph = Self { order, nodes };
        if check_cycles {
            graph.ensure_acyclic()?;
        }
        Ok(graph)
    }

    fn ensure_acyclic(&self) -> Result<()> {
        // Edge direction: dep -> node.
        let mut g: DiGraphMap<&str, ()> = DiGraphMap::new();
        for name in &self.order {
            g.add_node(name.as_str());
        }
        for name in &self.order {
            for dep in self.dependencies_of(name) {
                g.add_edge(dep.as_str(), name.as_str(), ());
            }
        }

        match toposort(&g, None) {
            Ok(_order) => Ok(()),
            Err(cycle) => Err(EngineError::DagCycle(format!(
                "cycle detected involving node '{}'",
                cycle.node_id()
            ))),
        }
    }

    /// All node names, in input order.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Nodes without predecessors.
    pub fn roots(&self) -> impl Iterator<Item = &str> {
        self.nodes().filter(|name| self.dependencies_of(name).is_empty())
    }

    /// Immediate dependencies of a node.
    pub fn dependencies_of(&self, name: &str) -> &[String] {
        self.nodes
            .get(name)
            .map(|n| n.deps.as_slice())
            .unwrap_or(&[])
    }

    /// Immediate dependents of a node.
    pub fn dependents_of(&self, name: &str) -> &[String] {
        self.nodes
            .get(name)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }
}
