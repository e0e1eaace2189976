// tests/pipeline_reconcile.rs

use std::collections::HashMap;
use std::error::Error;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pipengine::coord::MemoryCoordinator;
use pipengine::definition::DefinitionCatalog;
use pipengine::engine::{Engine, LifecycleHook, SubmitOptions};
use pipengine::model::{Pipeline, PipelineId, Status, Task, TaskPolicy};
use pipengine::store::{MemoryStore, PipelineStore};
use pipengine_test_utils::builders::{DefinitionBuilder, task};
use pipengine_test_utils::fake_executor::{CallKind, FakeExecutor, Run};
use pipengine_test_utils::{TestEngine, fast_config, init_tracing, with_timeout_secs};

type TestResult = Result<(), Box<dyn Error>>;

async fn tasks_by_name(
    store: &dyn PipelineStore,
    pipeline_id: PipelineId,
) -> Result<HashMap<String, Task>, Box<dyn Error>> {
    Ok(store
        .list_tasks(pipeline_id)
        .await?
        .into_iter()
        .map(|t| (t.name.clone(), t))
        .collect())
}

#[tokio::test(start_paused = true)]
async fn fan_out_after_first_stage_succeeds() -> TestResult {
    init_tracing();
    let te = TestEngine::new();
    te.start();

    let def = DefinitionBuilder::new("fan-out")
        .stage([task("a")])
        .stage([task("b"), task("c")])
        .build();

    let pipeline = with_timeout_secs(60, te.engine.run_pipeline(&def, SubmitOptions::default())).await?;
    assert_eq!(pipeline.status, Status::Success);
    assert!(pipeline.extra.teardown_complete);
    assert!(pipeline.time_begin.is_some());
    assert!(pipeline.time_end.is_some());
    assert_eq!(pipeline.namespace(), format!("pipeline-{}", pipeline.id));

    let started = te.executor.started();
    assert_eq!(started.len(), 3);
    assert_eq!(started[0], "a");
    assert!(started[1..].contains(&"b".to_string()));
    assert!(started[1..].contains(&"c".to_string()));

    let tasks = tasks_by_name(te.store.as_ref(), pipeline.id).await?;
    for name in ["a", "b", "c"] {
        assert_eq!(tasks[name].status, Status::Success, "task {name}");
        assert!(tasks[name].time_end.is_some());
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failed_task_fails_the_pipeline_and_skips_downstream() -> TestResult {
    init_tracing();
    let te = TestEngine::new();
    te.start();
    te.executor.script("b", Status::Failed);

    let def = DefinitionBuilder::new("fail")
        .stage([task("a")])
        .stage([task("b"), task("c")])
        .stage([task("d")])
        .build();

    let pipeline = with_timeout_secs(60, te.engine.run_pipeline(&def, SubmitOptions::default())).await?;
    assert_eq!(pipeline.status, Status::Failed);

    let tasks = tasks_by_name(te.store.as_ref(), pipeline.id).await?;
    assert_eq!(tasks["a"].status, Status::Success);
    assert_eq!(tasks["b"].status, Status::Failed);
    // c has no ordering constraint with b, so it still ran.
    assert_eq!(tasks["c"].status, Status::Success);
    assert_eq!(tasks["d"].status, Status::NoNeedBySystem);
    assert_eq!(te.executor.count(CallKind::Create, "d"), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn allowed_failure_does_not_fail_the_pipeline() -> TestResult {
    init_tracing();
    let te = TestEngine::new();
    te.start();
    te.executor.script("b", Status::Failed);

    let def = DefinitionBuilder::new("allowed")
        .stage([task("a")])
        .stage([task("b").allow_failure()])
        .stage([task("c")])
        .build();

    let pipeline = with_timeout_secs(60, te.engine.run_pipeline(&def, SubmitOptions::default())).await?;
    assert_eq!(pipeline.status, Status::Success);

    let tasks = tasks_by_name(te.store.as_ref(), pipeline.id).await?;
    // Stored status is never rewritten.
    assert_eq!(tasks["b"].status, Status::Failed);
    assert_eq!(tasks["c"].status, Status::Success);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn conditions_read_upstream_outputs() -> TestResult {
    init_tracing();
    let te = TestEngine::new();
    te.start();
    te.executor
        .script_runs("a", vec![Run::new(Status::Success).output("ready", "no")]);

    let def = DefinitionBuilder::new("conditions")
        .stage([task("a")])
        .stage([
            task("when-ready").condition("outputs.a.ready == 'yes'"),
            task("when-not-ready").condition("outputs.a.ready == 'no'"),
        ])
        .build();

    let pipeline = with_timeout_secs(60, te.engine.run_pipeline(&def, SubmitOptions::default())).await?;
    assert_eq!(pipeline.status, Status::Success);

    let tasks = tasks_by_name(te.store.as_ref(), pipeline.id).await?;
    assert_eq!(tasks["when-ready"].status, Status::NoNeedBySystem);
    assert_eq!(tasks["when-not-ready"].status, Status::Success);
    assert_eq!(te.executor.count(CallKind::Create, "when-ready"), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn guarded_task_still_runs_after_a_failure() -> TestResult {
    init_tracing();
    let te = TestEngine::new();
    te.start();
    te.executor.script("build", Status::Failed);

    let def = DefinitionBuilder::new("cleanup")
        .stage([task("build")])
        .stage([
            task("notify").condition("pipeline_status == 'Failed'"),
            task("publish"),
        ])
        .build();

    let pipeline = with_timeout_secs(60, te.engine.run_pipeline(&def, SubmitOptions::default())).await?;
    assert_eq!(pipeline.status, Status::Failed);

    let tasks = tasks_by_name(te.store.as_ref(), pipeline.id).await?;
    assert_eq!(tasks["notify"].status, Status::Success);
    assert_eq!(tasks["publish"].status, Status::NoNeedBySystem);
    assert!(tasks["publish"].allow_failure);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn commands_resolve_params_and_outputs() -> TestResult {
    init_tracing();
    let te = TestEngine::new();
    te.start();
    te.executor
        .script_runs("build", vec![Run::new(Status::Success).output("version", "1.2")]);

    let def = DefinitionBuilder::new("deploy")
        .param("env", "staging")
        .secret("TOKEN", "s3cr3t")
        .env("REGION", "eu")
        .stage([task("build")])
        .stage([task("deploy")
            .cmd("deploy --env ${params.env} --version ${{ outputs.build.version }}")
            .env("REGION", "us")])
        .output("version", "${build:OUTPUT:version}")
        .build();

    let options = SubmitOptions {
        params: [("env".to_string(), "prod".to_string())].into(),
        ..SubmitOptions::default()
    };
    let pipeline = with_timeout_secs(60, te.engine.run_pipeline(&def, options)).await?;
    assert_eq!(pipeline.status, Status::Success);
    assert_eq!(
        pipeline.extra.output_values.get("version").map(String::as_str),
        Some("1.2")
    );

    let tasks = tasks_by_name(te.store.as_ref(), pipeline.id).await?;
    let deploy = &tasks["deploy"];
    assert_eq!(deploy.extra.command, "deploy --env prod --version 1.2");
    assert_eq!(deploy.extra.envs.get("TOKEN").map(String::as_str), Some("s3cr3t"));
    // Task envs win over pipeline envs.
    assert_eq!(deploy.extra.envs.get("REGION").map(String::as_str), Some("us"));
    assert_eq!(
        deploy.extra.envs.get("PIPENGINE_TASK_NAME").map(String::as_str),
        Some("deploy")
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unresolved_reference_fails_the_task() -> TestResult {
    init_tracing();
    let te = TestEngine::new();
    te.start();

    let def = DefinitionBuilder::new("missing-param")
        .stage([task("a").cmd("echo ${params.missing}")])
        .build();

    let pipeline = with_timeout_secs(60, te.engine.run_pipeline(&def, SubmitOptions::default())).await?;
    assert_eq!(pipeline.status, Status::Failed);

    let tasks = tasks_by_name(te.store.as_ref(), pipeline.id).await?;
    assert_eq!(tasks["a"].status, Status::Failed);
    let message = tasks["a"].result.message.clone().unwrap_or_default();
    assert!(message.contains("unresolved reference"), "got {message}");
    assert_eq!(te.executor.count(CallKind::Create, "a"), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unknown_executor_is_an_error_status() -> TestResult {
    init_tracing();
    let te = TestEngine::new();
    te.start();

    let def = DefinitionBuilder::new("no-executor")
        .stage([task("a").executor("k8s")])
        .build();

    let pipeline = with_timeout_secs(60, te.engine.run_pipeline(&def, SubmitOptions::default())).await?;
    assert_eq!(pipeline.status, Status::Failed);

    let tasks = tasks_by_name(te.store.as_ref(), pipeline.id).await?;
    assert_eq!(tasks["a"].status, Status::Error);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn concurrent_passes_dispatch_each_task_once() -> TestResult {
    init_tracing();
    // No runtime: passes are driven by hand.
    let te = TestEngine::new();
    let def = DefinitionBuilder::new("idempotent")
        .stage([task("a")])
        .build();
    let pipeline = te.engine.submit(&def, SubmitOptions::default()).await?;

    let (first, second) = with_timeout_secs(
        60,
        async { tokio::join!(te.engine.reconcile(pipeline.id), te.engine.reconcile(pipeline.id)) },
    )
    .await;
    first?;
    second?;
    assert_eq!(te.executor.count(CallKind::Create, "a"), 1);
    assert_eq!(te.executor.count(CallKind::Start, "a"), 1);

    // Every task is done: this pass aggregates and tears down.
    te.engine.reconcile(pipeline.id).await?;
    let finished = te.store.get_pipeline(pipeline.id).await?;
    assert_eq!(finished.status, Status::Success);
    assert!(finished.extra.teardown_complete);

    // Further passes change nothing.
    te.engine.reconcile(pipeline.id).await?;
    te.engine.reconcile(pipeline.id).await?;
    let again = te.store.get_pipeline(pipeline.id).await?;
    assert_eq!(again, finished);
    assert_eq!(te.executor.calls().len(), 2);
    let tasks = tasks_by_name(te.store.as_ref(), pipeline.id).await?;
    assert!(!te.engine.state().is_admitted(pipeline.id, tasks["a"].id));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn throttler_serialises_execution_slots() -> TestResult {
    init_tracing();
    let mut config = fast_config();
    config.reconcile.throttler_capacity = 1;
    let te = TestEngine::with(DefinitionCatalog::new(), config);
    te.start();
    te.executor.script_runs("b", vec![Run::new(Status::Success).polls(3)]);
    te.executor.script_runs("c", vec![Run::new(Status::Success).polls(3)]);

    let def = DefinitionBuilder::new("throttled")
        .stage([task("b"), task("c")])
        .build();
    let pipeline = with_timeout_secs(120, te.engine.run_pipeline(&def, SubmitOptions::default())).await?;
    assert_eq!(pipeline.status, Status::Success);

    let tasks = tasks_by_name(te.store.as_ref(), pipeline.id).await?;
    let (b, c) = (&tasks["b"], &tasks["c"]);
    let (b_begin, b_end) = (b.time_begin.ok_or("b never began")?, b.time_end.ok_or("b never ended")?);
    let (c_begin, c_end) = (c.time_begin.ok_or("c never began")?, c.time_end.ok_or("c never ended")?);
    assert!(b_end <= c_begin || c_end <= b_begin, "b and c overlapped");
    assert_eq!(te.engine.throttler().in_use(), 0);
    Ok(())
}

#[derive(Default)]
struct RecordingHook {
    tasks: Mutex<Vec<String>>,
    pipelines: Mutex<Vec<(PipelineId, Status)>>,
}

#[async_trait]
impl LifecycleHook for RecordingHook {
    async fn after_task(&self, task: &Task) -> pipengine::errors::Result<()> {
        self.tasks.lock().unwrap().push(task.name.clone());
        Ok(())
    }

    async fn after_pipeline(&self, pipeline: &Pipeline) -> pipengine::errors::Result<()> {
        self.pipelines
            .lock()
            .unwrap()
            .push((pipeline.id, pipeline.status));
        Err(pipengine::errors::EngineError::abnormal("hook failures are only logged"))
    }
}

#[tokio::test(start_paused = true)]
async fn hooks_run_after_tasks_and_pipeline() -> TestResult {
    init_tracing();
    let hook = Arc::new(RecordingHook::default());
    let executor = FakeExecutor::new();
    let engine = Engine::builder(MemoryStore::new(), MemoryCoordinator::new())
        .executor(executor.clone())
        .config(fast_config())
        .hook(hook.clone())
        .build();
    let shutdown = tokio_util::sync::CancellationToken::new();
    engine.start(shutdown.clone());

    let def = DefinitionBuilder::new("hooked")
        .stage([task("a")])
        .stage([task("b")])
        .build();
    let pipeline = with_timeout_secs(60, engine.run_pipeline(&def, SubmitOptions::default())).await?;
    shutdown.cancel();
    assert_eq!(pipeline.status, Status::Success);

    let mut tasks = hook.tasks.lock().unwrap().clone();
    tasks.sort();
    assert_eq!(tasks, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(
        hook.pipelines.lock().unwrap().clone(),
        vec![(pipeline.id, Status::Success)]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_give_back_the_execution_slot() -> TestResult {
    init_tracing();
    let mut config = fast_config();
    config.reconcile.throttler_capacity = 1;
    let te = TestEngine::with(DefinitionCatalog::new(), config);
    te.start();
    let cap = te.engine.config().retry.max_retries;
    te.executor.fail_starts("a", cap + 1);

    let def = DefinitionBuilder::new("slots").stage([task("a")]).build();
    let pipeline = te.engine.submit(&def, SubmitOptions::default()).await?;
    te.engine.wake(pipeline.id);

    // Nothing redelivers the wake yet, so the aborted unit stays aborted.
    let store = te.store.as_ref();
    let engine = &te.engine;
    with_timeout_secs(120, async {
        loop {
            let a = tasks_by_name(store, pipeline.id).await?.remove("a").ok_or("a missing")?;
            if a.extra.errors.len() > cap as usize && !engine.state().is_admitted(pipeline.id, a.id) {
                return Ok::<_, Box<dyn Error>>(());
            }
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        }
    })
    .await?;
    assert_eq!(te.engine.throttler().in_use(), 0);

    let done = with_timeout_secs(120, te.engine.wait_pipeline_done(pipeline.id)).await?;
    assert_eq!(done.status, Status::Success);
    assert_eq!(te.executor.count(CallKind::Start, "a"), cap as usize + 2);
    Ok(())
}

fn reusable_build() -> pipengine::definition::Definition {
    DefinitionBuilder::new("build")
        .stage([task("compile").policy(TaskPolicy::TryLatestSuccessResult)])
        .stage([task("lint")
            .allow_failure()
            .policy(TaskPolicy::TryLatestSuccessResult)])
        .build()
}

#[tokio::test(start_paused = true)]
async fn latest_success_is_reused_instead_of_executing() -> TestResult {
    init_tracing();
    let te = TestEngine::new();
    te.start();
    te.executor.script_runs(
        "compile",
        vec![Run::new(Status::Success).output("version", "1")],
    );
    te.executor.script("lint", Status::Failed);

    // No history yet: both tasks execute.
    let first = with_timeout_secs(60, te.engine.run_pipeline(&reusable_build(), SubmitOptions::default())).await?;
    assert_eq!(first.status, Status::Success);
    assert_eq!(te.executor.count(CallKind::Create, "compile"), 1);
    assert_eq!(te.executor.count(CallKind::Create, "lint"), 1);
    let before = tasks_by_name(te.store.as_ref(), first.id).await?;

    let second = with_timeout_secs(60, te.engine.run_pipeline(&reusable_build(), SubmitOptions::default())).await?;
    assert_eq!(second.status, Status::Success);
    let after = tasks_by_name(te.store.as_ref(), second.id).await?;

    let (old, new) = (&before["compile"], &after["compile"]);
    assert_eq!(te.executor.count(CallKind::Create, "compile"), 1);
    assert_eq!(new.status, Status::Success);
    assert_eq!(new.result.metadata.get("version").map(String::as_str), Some("1"));
    assert_eq!(new.time_begin, old.time_begin);
    assert_eq!(new.time_end, old.time_end);
    assert_eq!(new.cost_time_sec, old.cost_time_sec);
    assert!(new.extra.uuid.is_empty());

    // A failed historical result is never reused.
    assert_eq!(te.executor.count(CallKind::Create, "lint"), 2);
    assert_eq!(after["lint"].status, Status::Failed);
    Ok(())
}
