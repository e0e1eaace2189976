// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `pipengine`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "pipengine",
    version,
    about = "Run a pipeline definition through the reconcile engine.",
    long_about = None
)]
pub struct CliArgs {
    /// Pipeline definition to run (TOML).
    #[arg(long, value_name = "PATH")]
    pub definition: String,

    /// Engine configuration file (TOML). Defaults apply when omitted.
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Directory of definitions that nested pipeline tasks may run.
    #[arg(long, value_name = "DIR")]
    pub snippets_dir: Option<String>,

    /// Resource namespace; defaults to `pipeline-<id>`.
    #[arg(long, value_name = "NAME")]
    pub namespace: Option<String>,

    /// Run parameter override, `key=value`. Repeatable.
    #[arg(long = "param", value_name = "KEY=VALUE")]
    pub params: Vec<String>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `PIPENGINE_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print stages and tasks, but don't execute anything.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
