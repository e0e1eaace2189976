// src/lib.rs

pub mod aggregate;
pub mod cli;
pub mod config;
pub mod coord;
pub mod dag;
pub mod definition;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod gc;
pub mod logging;
pub mod model;
pub mod policy;
pub mod store;
pub mod taskrun;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::EngineConfig;
use crate::coord::MemoryCoordinator;
use crate::definition::{Definition, DefinitionCatalog};
use crate::engine::{Engine, SubmitOptions};
use crate::exec::ShellExecutor;
use crate::model::Status;
use crate::store::MemoryStore;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config and definition loading
/// - the in-memory store and coordinator
/// - the shell executor
/// - the GC background tasks and the engine runtime
/// - Ctrl-C handling (stops the pipeline)
pub async fn run(args: CliArgs) -> Result<()> {
    let config = config::load_and_validate(args.config.as_deref().map(Path::new))
        .context("failed to load engine config")?;
    let catalog = match &args.snippets_dir {
        Some(dir) => DefinitionCatalog::load_dir(dir)
            .with_context(|| format!("failed to load definitions from {dir}"))?,
        None => DefinitionCatalog::new(),
    };
    let definition = definition::load_and_validate(&args.definition)
        .with_context(|| format!("failed to load definition {}", args.definition))?;
    let params = parse_params(&args.params)?;

    if args.dry_run {
        print_dry_run(&definition, &catalog, &config);
        return Ok(());
    }

    let engine = Engine::builder(MemoryStore::new(), MemoryCoordinator::new())
        .executor(Arc::new(ShellExecutor::default()))
        .catalog(catalog)
        .config(config)
        .build();

    let shutdown = CancellationToken::new();
    let gc_handles = engine.gc().spawn(shutdown.clone());
    let runtime = engine.start(shutdown.clone());

    let options = SubmitOptions {
        namespace: args.namespace.clone(),
        params,
        ..SubmitOptions::default()
    };
    let pipeline = engine.submit(&definition, options).await?;

    let finished = tokio::select! {
        done = engine.wait_pipeline_done(pipeline.id) => done?,
        _ = tokio::signal::ctrl_c() => {
            warn!(pipeline_id = pipeline.id, "interrupted; stopping pipeline");
            engine.stop(pipeline.id).await?;
            engine.store().get_pipeline(pipeline.id).await?
        }
    };

    for task in engine.store().list_tasks(finished.id).await? {
        println!("{:<24} {}", task.name, task.status);
    }
    println!("pipeline {} {}", finished.id, finished.status);

    shutdown.cancel();
    match runtime.await {
        Ok(Err(err)) => warn!(error = %err, "engine runtime failed"),
        Err(err) => warn!(error = %err, "engine runtime panicked"),
        Ok(Ok(())) => {}
    }
    for handle in gc_handles {
        if let Err(err) = handle.await {
            warn!(error = %err, "gc task panicked");
        }
    }

    if finished.status != Status::Success {
        bail!("pipeline {} finished with status {}", finished.id, finished.status);
    }
    info!(pipeline_id = finished.id, "pipeline succeeded");
    Ok(())
}

/// Parse repeated `key=value` arguments.
pub fn parse_params(raw: &[String]) -> Result<BTreeMap<String, String>> {
    raw.iter()
        .map(|item| {
            let (key, value) = item
                .split_once('=')
                .with_context(|| format!("invalid --param '{item}', expected key=value"))?;
            let key = key.trim();
            if key.is_empty() {
                bail!("invalid --param '{item}', empty key");
            }
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Dry-run output: stages, tasks, predecessors and commands.
fn print_dry_run(definition: &Definition, catalog: &DefinitionCatalog, config: &EngineConfig) {
    println!("pipengine dry-run: {} (source {})", definition.name, definition.source);
    println!(
        "  reconcile.throttler_capacity = {}",
        config.reconcile.throttler_capacity
    );
    println!("  retry.max_retries = {}", config.retry.max_retries);
    println!("  nested definitions = {}", catalog.len());
    println!();

    for (order, stage) in definition.stages.iter().enumerate() {
        println!("stage {order}: {}", stage.name);
        for task in &stage.tasks {
            println!("  - {}", task.name);
            match &task.snippet {
                Some(snippet) => println!("      snippet: {}", snippet.definition),
                None => println!("      {}: {}", task.executor, task.cmd),
            }
            let after = Definition::after_of(task);
            if !after.is_empty() {
                println!("      after: {after:?}");
            }
            if let Some(cond) = &task.condition {
                println!("      if: {cond}");
            }
            if task.allow_failure {
                println!("      allow_failure: true");
            }
        }
    }
    for output in &definition.outputs {
        println!("output {} = {}", output.name, output.reference);
    }

    debug!("dry-run complete (no execution)");
}
