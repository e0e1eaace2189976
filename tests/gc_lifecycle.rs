// tests/gc_lifecycle.rs

use std::error::Error;
use std::time::Duration;

use chrono::Utc;
use pipengine::config::EngineConfig;
use pipengine::coord::{CoordinationStore, ExpiryMode, WatchKind};
use pipengine::definition::{Definition, DefinitionCatalog};
use pipengine::engine::SubmitOptions;
use pipengine::gc::{GcManager, GcOutcome, WaitRecord};
use pipengine::model::{Pipeline, PipelineId, Status};
use pipengine::store::PipelineStore;
use pipengine_test_utils::builders::{DefinitionBuilder, task};
use pipengine_test_utils::fake_executor::Run;
use pipengine_test_utils::{TestEngine, fast_config, init_tracing, with_timeout_secs};

type TestResult = Result<(), Box<dyn Error>>;

fn resource_key(gc: &GcManager, namespace: &str) -> String {
    format!("{}/{namespace}", gc.config().resource_prefix)
}

fn database_key(gc: &GcManager, pipeline_id: PipelineId) -> String {
    format!("{}/{pipeline_id}", gc.config().database_prefix)
}

async fn record(te: &TestEngine, key: &str) -> Result<Option<WaitRecord>, Box<dyn Error>> {
    match te.coord.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

fn two_tasks() -> Definition {
    DefinitionBuilder::new("build")
        .stage([task("compile")])
        .stage([task("test")])
        .build()
}

fn in_namespace(namespace: &str) -> SubmitOptions {
    SubmitOptions {
        namespace: Some(namespace.to_string()),
        ..SubmitOptions::default()
    }
}

async fn run(te: &TestEngine, def: &Definition, opts: SubmitOptions) -> Result<Pipeline, Box<dyn Error>> {
    Ok(with_timeout_secs(60, te.engine.run_pipeline(def, opts)).await?)
}

async fn wait_until_running(te: &TestEngine, pipeline_id: PipelineId) -> Result<(), Box<dyn Error>> {
    loop {
        let tasks = te.store.list_tasks(pipeline_id).await?;
        if tasks.iter().any(|t| t.status == Status::Running) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

/// GC TTLs short enough to fire inside a paused-time test.
fn short_gc_config() -> EngineConfig {
    let mut config = fast_config();
    config.gc.resource_ttl_success_secs = 5;
    config.gc.resource_ttl_failed_secs = 5;
    config.gc.database_ttl_finished_secs = 30;
    config.gc.archive_finished = true;
    config
}

#[tokio::test(start_paused = true)]
async fn rearming_moves_the_deadline_instead_of_adding_a_record() -> TestResult {
    init_tracing();
    let te = TestEngine::new();
    let gc = te.engine.gc();
    let key = database_key(gc, 42);

    gc.wait_database_gc(42, 10, false).await?;
    let first = record(&te, &key).await?.ok_or("record missing")?;
    tokio::time::sleep(Duration::from_secs(5)).await;
    gc.wait_database_gc(42, 10, false).await?;
    let second = record(&te, &key).await?.ok_or("record missing")?;

    assert_ne!(first.lease_id, second.lease_id);
    assert!(second.gc_at >= first.gc_at);
    let prefix = format!("{}/", gc.config().database_prefix);
    assert_eq!(te.coord.list(&prefix).await?.len(), 1);

    // The first lease has fired, but the key now rides the second one.
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(te.coord.get(&key).await?.is_some());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(te.coord.get(&key).await?.is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn finished_pipeline_is_collected_end_to_end() -> TestResult {
    init_tracing();
    let te = TestEngine::with(DefinitionCatalog::new(), short_gc_config());
    let _gc = te.engine.gc().spawn(te.shutdown.clone());
    te.start();

    let pipeline = run(&te, &two_tasks(), SubmitOptions::default()).await?;
    assert_eq!(pipeline.status, Status::Success);
    let uuids: Vec<String> = te
        .store
        .list_tasks(pipeline.id)
        .await?
        .into_iter()
        .map(|t| t.extra.uuid)
        .collect();

    // Resource TTL fires first.
    tokio::time::sleep(Duration::from_secs(10)).await;
    let mut deleted = te.executor.deleted();
    deleted.sort();
    let mut expected = uuids.clone();
    expected.sort();
    assert_eq!(deleted, expected);
    let collected = te.store.get_pipeline(pipeline.id).await?;
    assert!(collected.extra.gc_complete);
    assert!(
        te.coord
            .get(&resource_key(te.engine.gc(), pipeline.namespace()))
            .await?
            .is_none()
    );

    // Then the database TTL archives the rows.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(te.store.find_pipeline(pipeline.id).await?.is_none());
    assert!(te.store.list_tasks(pipeline.id).await?.is_empty());
    let archive = te
        .store
        .find_archive(pipeline.id)
        .await?
        .ok_or("pipeline was not archived")?;
    assert_eq!(archive.pipeline.status, Status::Success);
    assert_eq!(archive.tasks.len(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn running_neighbour_defers_namespace_collection() -> TestResult {
    init_tracing();
    let te = TestEngine::new();
    te.start();
    let gc = te.engine.gc();

    let done = run(&te, &two_tasks(), in_namespace("shared")).await?;
    assert_eq!(done.status, Status::Success);

    te.executor
        .script_runs("long", vec![Run::new(Status::Success).polls(10_000)]);
    let busy_def = DefinitionBuilder::new("busy").stage([task("long")]).build();
    let busy = te.engine.submit(&busy_def, in_namespace("shared")).await?;
    let waiter = {
        let engine = te.engine.clone();
        tokio::spawn(async move { engine.wait_pipeline_done(busy.id).await })
    };
    with_timeout_secs(60, wait_until_running(&te, busy.id)).await?;

    assert_eq!(gc.handle_resource_gc("shared").await?, GcOutcome::Deferred);
    assert!(te.executor.deleted().is_empty());
    assert!(!te.store.get_pipeline(done.id).await?.extra.gc_complete);
    let rearmed = record(&te, &resource_key(gc, "shared"))
        .await?
        .ok_or("record missing")?;
    assert_eq!(rearmed.ttl_secs, gc.config().delay_ttl_secs);

    te.engine.stop(busy.id).await?;
    let stopped = with_timeout_secs(60, waiter).await??;
    assert_eq!(stopped.status, Status::StopByUser);

    assert_eq!(gc.handle_resource_gc("shared").await?, GcOutcome::Collected);
    assert_eq!(te.executor.deleted().len(), 3);
    assert!(te.store.get_pipeline(done.id).await?.extra.gc_complete);
    assert!(te.store.get_pipeline(busy.id).await?.extra.gc_complete);
    let members = format!("{}/", resource_key(gc, "shared"));
    assert!(te.coord.list(&members).await?.is_empty());
    assert!(te.coord.get(&resource_key(gc, "shared")).await?.is_none());

    // Nothing left to collect.
    assert_eq!(gc.handle_resource_gc("shared").await?, GcOutcome::Nothing);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failed_batch_delete_is_retried_later() -> TestResult {
    init_tracing();
    let te = TestEngine::new();
    te.start();
    let gc = te.engine.gc();

    let pipeline = run(&te, &two_tasks(), SubmitOptions::default()).await?;
    let namespace = pipeline.namespace().to_string();

    te.executor.fail_batch_delete(true);
    assert_eq!(gc.handle_resource_gc(&namespace).await?, GcOutcome::Deferred);
    let rearmed = record(&te, &resource_key(gc, &namespace))
        .await?
        .ok_or("record missing")?;
    assert_eq!(rearmed.ttl_secs, gc.config().resource_ttl_failed_secs);
    // Marked before the executor was asked.
    assert!(te.store.get_pipeline(pipeline.id).await?.extra.gc_complete);
    assert!(te.executor.deleted().is_empty());

    te.executor.fail_batch_delete(false);
    assert_eq!(gc.handle_resource_gc(&namespace).await?, GcOutcome::Collected);
    assert_eq!(te.executor.deleted().len(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn database_gc_waits_for_resource_collection() -> TestResult {
    init_tracing();
    let te = TestEngine::new();
    te.start();
    let gc = te.engine.gc();

    let pipeline = run(&te, &two_tasks(), SubmitOptions::default()).await?;

    assert_eq!(
        gc.handle_database_gc(pipeline.id, None).await?,
        GcOutcome::Deferred
    );
    assert!(te.store.find_pipeline(pipeline.id).await?.is_some());
    let rearmed = record(&te, &database_key(gc, pipeline.id))
        .await?
        .ok_or("record missing")?;
    assert_eq!(rearmed.ttl_secs, gc.config().delay_ttl_secs);

    assert_eq!(
        gc.handle_resource_gc(pipeline.namespace()).await?,
        GcOutcome::Collected
    );
    // Falls back to the pipeline's policy, which does not archive.
    assert_eq!(
        gc.handle_database_gc(pipeline.id, None).await?,
        GcOutcome::Collected
    );
    assert!(te.store.find_pipeline(pipeline.id).await?.is_none());
    assert!(te.store.find_archive(pipeline.id).await?.is_none());

    assert_eq!(
        gc.handle_database_gc(pipeline.id, None).await?,
        GcOutcome::Nothing
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn database_gc_skips_active_and_collects_abandoned_pipelines() -> TestResult {
    init_tracing();
    let te = TestEngine::new();
    te.start();
    let gc = te.engine.gc();

    te.executor
        .script_runs("long", vec![Run::new(Status::Success).polls(10_000)]);
    let busy_def = DefinitionBuilder::new("busy").stage([task("long")]).build();
    let busy = te.engine.submit(&busy_def, SubmitOptions::default()).await?;
    let waiter = {
        let engine = te.engine.clone();
        tokio::spawn(async move { engine.wait_pipeline_done(busy.id).await })
    };
    with_timeout_secs(60, wait_until_running(&te, busy.id)).await?;
    assert_eq!(gc.handle_database_gc(busy.id, Some(true)).await?, GcOutcome::Nothing);
    assert!(te.store.find_pipeline(busy.id).await?.is_some());

    // Submitted but never woken: nothing reached an executor.
    let abandoned = te.engine.submit(&two_tasks(), SubmitOptions::default()).await?;
    assert_eq!(abandoned.status, Status::Analyzed);
    assert_eq!(
        gc.handle_database_gc(abandoned.id, Some(true)).await?,
        GcOutcome::Collected
    );
    let archive = te
        .store
        .find_archive(abandoned.id)
        .await?
        .ok_or("abandoned pipeline was not archived")?;
    assert_eq!(archive.pipeline.status, Status::Analyzed);
    assert_eq!(archive.tasks.len(), 2);

    te.engine.stop(busy.id).await?;
    with_timeout_secs(60, waiter).await??;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn ensure_sweep_expires_overdue_records() -> TestResult {
    init_tracing();
    let te = TestEngine::new();
    te.coord.set_expiry_mode(ExpiryMode::Suspended);
    te.start();
    let gc = te.engine.gc();

    let pipeline = run(&te, &two_tasks(), SubmitOptions::default()).await?;
    let res_key = resource_key(gc, pipeline.namespace());
    let db_key = database_key(gc, pipeline.id);
    let mut watcher = te.coord.watch(&format!("{}/", gc.config().resource_prefix));

    // Nothing is overdue yet.
    let report = gc.ensure_sweep().await?;
    assert_eq!(report.expired, 0);
    assert!(!report.skipped);

    let resource_ttl = pipeline.extra.gc.resource_ttl_success_secs as i64;
    let later = Utc::now() + chrono::Duration::seconds(resource_ttl + 60);
    let report = gc.ensure_sweep_at(later).await?;
    assert_eq!(report.expired, 1);
    assert_eq!(report.backfilled, 0);
    assert!(te.coord.get(&res_key).await?.is_none());
    assert!(te.coord.get(&db_key).await?.is_some());

    // Listeners see the sweep exactly like a lease expiry.
    let event = with_timeout_secs(5, watcher.next())
        .await
        .ok_or("watch closed")?;
    assert_eq!(event.kind, WatchKind::Delete);
    assert_eq!(event.key, res_key);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn compensation_rearms_lost_records() -> TestResult {
    init_tracing();
    let te = TestEngine::new();
    te.start();
    let gc = te.engine.gc();

    let pipeline = run(&te, &two_tasks(), SubmitOptions::default()).await?;
    let res_key = resource_key(gc, pipeline.namespace());
    let db_key = database_key(gc, pipeline.id);
    te.coord.delete(&res_key).await?;
    te.coord.delete(&db_key).await?;

    // Too recent to be considered lost.
    let report = gc.compensate_sweep().await?;
    assert_eq!(report.scanned, 0);

    let policy = &pipeline.extra.gc;
    let overdue = policy.resource_ttl_success_secs + gc.config().compensate_buffer_secs + 60;
    let later = Utc::now() + chrono::Duration::seconds(overdue as i64);
    let report = gc.compensate_sweep_at(later).await?;
    assert_eq!(report.scanned, 1);
    assert_eq!(report.resource_rearmed, 1);
    assert_eq!(report.database_rearmed, 1);
    assert!(te.coord.get(&res_key).await?.is_some());
    let db = record(&te, &db_key).await?.ok_or("database record missing")?;
    assert!(db.ttl_secs < policy.database_ttl_finished_secs);

    // Records exist again, so a second sweep leaves them alone.
    let report = gc.compensate_sweep_at(later).await?;
    assert_eq!(report.scanned, 1);
    assert_eq!(report.resource_rearmed, 0);
    assert_eq!(report.database_rearmed, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn silent_expiry_is_recovered_by_compensation() -> TestResult {
    init_tracing();
    let mut config = short_gc_config();
    config.gc.database_ttl_finished_secs = 100_000;
    let te = TestEngine::with(DefinitionCatalog::new(), config);
    let _gc = te.engine.gc().spawn(te.shutdown.clone());
    te.coord.set_expiry_mode(ExpiryMode::Silent);
    te.start();
    let gc = te.engine.gc();

    let pipeline = run(&te, &two_tasks(), SubmitOptions::default()).await?;
    tokio::time::sleep(Duration::from_secs(10)).await;
    // The record vanished without anyone being told.
    assert!(
        te.coord
            .get(&resource_key(gc, pipeline.namespace()))
            .await?
            .is_none()
    );
    assert!(te.executor.deleted().is_empty());

    te.coord.set_expiry_mode(ExpiryMode::Normal);
    let overdue = 5 + gc.config().compensate_buffer_secs + 60;
    let later = Utc::now() + chrono::Duration::seconds(overdue as i64);
    let report = gc.compensate_sweep_at(later).await?;
    assert_eq!(report.resource_rearmed, 1);
    assert_eq!(report.database_rearmed, 0);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(te.executor.deleted().len(), 2);
    assert!(te.store.get_pipeline(pipeline.id).await?.extra.gc_complete);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn every_loop_iteration_job_is_collected() -> TestResult {
    init_tracing();
    let te = TestEngine::with(DefinitionCatalog::new(), short_gc_config());
    let _gc = te.engine.gc().spawn(te.shutdown.clone());
    te.start();
    te.executor
        .script_runs("poll", vec![Run::new(Status::Success).output("ready", "no")]);

    let def = DefinitionBuilder::new("looping")
        .stage([task("poll").loop_until("outputs.ready == 'yes'", 3)])
        .build();
    let pipeline = with_timeout_secs(600, te.engine.run_pipeline(&def, SubmitOptions::default())).await?;
    assert_eq!(pipeline.status, Status::Success);

    let poll = te
        .store
        .list_tasks(pipeline.id)
        .await?
        .pop()
        .ok_or("poll task missing")?;
    assert_eq!(poll.extra.previous_uuids.len(), 2);

    tokio::time::sleep(Duration::from_secs(10)).await;
    let mut deleted = te.executor.deleted();
    deleted.sort();
    let expected: Vec<String> = (0..3)
        .map(|n| format!("pipeline-{}-task-{}-{n}", pipeline.id, poll.id))
        .collect();
    assert_eq!(deleted, expected);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn archive_flag_follows_the_pipeline_status() -> TestResult {
    init_tracing();
    let mut config = fast_config();
    config.gc.archive_analyzed = true;
    config.gc.archive_finished = false;
    let te = TestEngine::with(DefinitionCatalog::new(), config);
    te.start();
    let gc = te.engine.gc();

    let abandoned = te.engine.submit(&two_tasks(), SubmitOptions::default()).await?;
    let armed = record(&te, &database_key(gc, abandoned.id))
        .await?
        .ok_or("analyzed record missing")?;
    assert_eq!(armed.payload["need_archive"], true);
    assert_eq!(gc.handle_database_gc(abandoned.id, None).await?, GcOutcome::Collected);
    assert!(te.store.find_archive(abandoned.id).await?.is_some());

    let finished = run(&te, &two_tasks(), SubmitOptions::default()).await?;
    let armed = record(&te, &database_key(gc, finished.id))
        .await?
        .ok_or("finished record missing")?;
    assert_eq!(armed.payload["need_archive"], false);
    assert_eq!(
        gc.handle_resource_gc(finished.namespace()).await?,
        GcOutcome::Collected
    );
    assert_eq!(gc.handle_database_gc(finished.id, None).await?, GcOutcome::Collected);
    assert!(te.store.find_archive(finished.id).await?.is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn archives_are_dropped_after_their_retention() -> TestResult {
    init_tracing();
    let mut config = fast_config();
    config.gc.archive_retain_analyzed_secs = 3_600;
    config.gc.archive_retain_finished_secs = 86_400;
    let te = TestEngine::with(DefinitionCatalog::new(), config);
    te.start();
    let gc = te.engine.gc();

    let abandoned = te.engine.submit(&two_tasks(), SubmitOptions::default()).await?;
    assert_eq!(
        gc.handle_database_gc(abandoned.id, Some(true)).await?,
        GcOutcome::Collected
    );
    let finished = run(&te, &two_tasks(), SubmitOptions::default()).await?;
    gc.handle_resource_gc(finished.namespace()).await?;
    assert_eq!(
        gc.handle_database_gc(finished.id, Some(true)).await?,
        GcOutcome::Collected
    );

    let now = Utc::now();
    assert_eq!(gc.archive_retention_sweep_at(now).await?, 0);

    // Past the analyzed window only.
    let later = now + chrono::Duration::hours(2);
    assert_eq!(gc.archive_retention_sweep_at(later).await?, 1);
    assert!(te.store.find_archive(abandoned.id).await?.is_none());
    assert!(te.store.find_archive(finished.id).await?.is_some());

    let much_later = now + chrono::Duration::days(2);
    assert_eq!(gc.archive_retention_sweep_at(much_later).await?, 1);
    assert!(te.store.find_archive(finished.id).await?.is_none());
    Ok(())
}
