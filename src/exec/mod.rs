// src/exec/mod.rs

//! Task execution layer.
//!
//! - [`backend`] provides the [`Executor`] trait the task state machine
//!   drives, plus the [`ExecutorRegistry`] resolving executors by name.
//! - [`shell`] is a local executor running commands with
//!   `tokio::process::Command`.
//! - [`throttle`] bounds how many tasks hold an execution slot at once.

pub mod backend;
pub mod shell;
pub mod throttle;

pub use backend::{Executor, ExecutorRegistry, StatusDesc};
pub use shell::ShellExecutor;
pub use throttle::Throttler;
