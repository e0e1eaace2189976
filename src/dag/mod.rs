// src/dag/mod.rs

//! DAG representation and scheduling.
//!
//! - [`graph`] builds a validated graph from nodes and predecessor names.
//! - [`scheduler`] answers "what can run now" given the set of done nodes.
//!
//! Both are pure: no IO, no persistence, no clocks.

pub mod graph;
pub mod scheduler;

pub use graph::{DagGraph, NodeSpec};
pub use scheduler::{ScheduleOptions, get_schedulable};
