// src/taskrun/mod.rs

//! Per-task state machine.
//!
//! ```text
//! Analyzed -(prepare)-> Born -(create)-> Created -(start)-> Queue -(queue)-> Running -(wait)-> end
//! ```
//!
//! Each arrow is one unit of work against the resolved executor. Abnormal
//! faults reset the task to Analyzed and retry with backoff; loops reset a
//! finished task and run it again until the break expression holds.

pub mod backoff;
pub mod condition;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RetrySection;
use crate::engine::params;
use crate::errors::{EngineError, Result};
use crate::exec::{Executor, StatusDesc, Throttler};
use crate::model::{Pipeline, Status, Task};
use crate::policy::apply_policy;
use crate::store::PipelineStore;

use backoff::{abnormal_retry_delay, loop_delay};
use condition::{EvalContext, evaluate};

/// Pipeline-level view a task runs against.
#[derive(Debug, Clone)]
pub struct TaskEnv {
    pub pipeline: Arc<Pipeline>,
    /// Flat status of the pipeline when the task was dispatched.
    pub calculated_status: Status,
    /// Outputs of finished sibling tasks, keyed `task.key`.
    pub outputs: BTreeMap<String, String>,
    /// Fires at teardown; no further steps are taken afterwards.
    pub exit: CancellationToken,
}

/// Whether a task must be skipped because the pipeline already failed.
///
/// Tasks with an `if` guard still run after a failure, except when the
/// user stopped the pipeline.
pub fn should_skip(calculated: Status, task: &Task) -> bool {
    calculated.is_failed() && (task.condition.is_none() || calculated == Status::StopByUser)
}

/// Drives one task to a terminal status.
pub struct TaskRunner {
    store: Arc<dyn PipelineStore>,
    executor: Arc<dyn Executor>,
    throttler: Throttler,
    retry: RetrySection,
    wait_poll: Duration,
}

impl TaskRunner {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        executor: Arc<dyn Executor>,
        throttler: Throttler,
        retry: RetrySection,
        wait_poll: Duration,
    ) -> Self {
        Self {
            store,
            executor,
            throttler,
            retry,
            wait_poll,
        }
    }

    /// Run the task until it is terminal (and done looping), the exit
    /// signal fires, or abnormal retries are exhausted.
    ///
    /// Business and structural failures end as a terminal task status; only
    /// exhausted abnormal faults are returned as `Err`.
    pub async fn run(&self, mut task: Task, env: &TaskEnv) -> Result<Task> {
        let mut attempts = 0u32;
        loop {
            match self.drive(&mut task, env).await {
                Ok(()) => {}
                Err(err) if err.is_abnormal() => {
                    attempts += 1;
                    warn!(
                        pipeline_id = task.pipeline_id,
                        task = %task.name,
                        attempt = attempts,
                        error = %err,
                        "abnormal error while advancing task"
                    );
                    task.extra.errors.push(err.to_string());
                    if attempts > self.retry.max_retries {
                        self.store.update_task_extra(task.id, task.extra.clone()).await?;
                        return Err(err);
                    }
                    task.status = Status::Analyzed;
                    self.store.update_task(&task).await?;

                    let delay = abnormal_retry_delay(&self.retry, attempts);
                    if sleep_or_exit(delay, &env.exit).await {
                        return Ok(task);
                    }
                    continue;
                }
                Err(err) => self.fail(&mut task, err).await?,
            }

            if !task.status.is_end() {
                return Ok(task);
            }
            if !self.should_loop(&task, env) {
                return Ok(task);
            }
            if !self.reset_for_loop(&mut task, &env.exit).await? {
                return Ok(task);
            }
        }
    }

    async fn drive(&self, task: &mut Task, env: &TaskEnv) -> Result<()> {
        if !task.extra.uuid.is_empty() && !task.status.is_end() {
            self.resync(task).await?;
        }

        if !task.status.is_end() && should_skip(env.calculated_status, task) {
            info!(
                pipeline_id = task.pipeline_id,
                task = %task.name,
                pipeline_status = %env.calculated_status,
                "pipeline already failed; skipping task"
            );
            task.status = Status::NoNeedBySystem;
            task.allow_failure = true;
            self.store.update_task(task).await?;
            return Ok(());
        }

        while !task.status.is_end() {
            if env.exit.is_cancelled() {
                debug!(task = %task.name, status = %task.status, "pipeline exited; stop advancing");
                return Ok(());
            }
            match task.status {
                Status::Analyzed => self.prepare(task, env).await?,
                Status::Born => self.create(task).await?,
                Status::Created => self.start(task, env).await?,
                Status::Queue => self.queue(task, env).await?,
                Status::Running => self.wait(task, env).await?,
                Status::Paused => return Ok(()),
                _ => break,
            }
        }
        Ok(())
    }

    async fn prepare(&self, task: &mut Task, env: &TaskEnv) -> Result<()> {
        if apply_policy(self.store.as_ref(), &env.pipeline, task).await? {
            return Ok(());
        }

        if let Some(cond) = &task.condition {
            let ctx = EvalContext {
                task_status: task.status,
                pipeline_status: env.calculated_status,
                looped_times: looped_times(task),
                outputs: env.outputs.clone(),
            };
            if !evaluate(cond, &ctx)? {
                info!(task = %task.name, condition = %cond, "condition is false; task not needed");
                task.status = Status::NoNeedBySystem;
                self.store.update_task(task).await?;
                return Ok(());
            }
        }

        let snapshot = &env.pipeline.extra.snapshot;
        let mut envs = snapshot.envs.clone();
        envs.extend(snapshot.secrets.clone());
        envs.extend(task.extra.envs.clone());
        envs.insert("PIPENGINE_PIPELINE_ID".into(), task.pipeline_id.to_string());
        envs.insert("PIPENGINE_TASK_NAME".into(), task.name.clone());

        task.extra.uuid = format!(
            "pipeline-{}-task-{}-{}",
            task.pipeline_id,
            task.id,
            looped_times(task)
        );
        task.extra.command = params::resolve(
            &task.extra.command,
            &env.outputs,
            snapshot.effective_params(),
        )?;
        task.extra.envs = envs;
        task.status = Status::Born;
        self.store.update_task(task).await?;
        debug!(task = %task.name, uuid = %task.extra.uuid, "task prepared");
        Ok(())
    }

    async fn create(&self, task: &mut Task) -> Result<()> {
        self.executor.create(task).await?;
        task.status = Status::Created;
        self.store.update_task_status(task.id, task.status).await
    }

    async fn start(&self, task: &mut Task, env: &TaskEnv) -> Result<()> {
        tokio::select! {
            _ = self.throttler.acquire(task.id) => {}
            _ = env.exit.cancelled() => return Ok(()),
        }
        self.executor.start(task).await?;
        task.status = Status::Queue;
        task.time_begin = Some(Utc::now());
        self.store.update_task(task).await?;
        info!(pipeline_id = task.pipeline_id, task = %task.name, executor = %task.executor, "task started");
        Ok(())
    }

    async fn queue(&self, task: &mut Task, env: &TaskEnv) -> Result<()> {
        let remote = self.executor.status(task).await?;
        match remote.status {
            s if s.is_end() => self.finish(task, remote).await,
            Status::Running => {
                task.status = Status::Running;
                self.store.update_task_status(task.id, task.status).await
            }
            _ => {
                sleep_or_exit(self.wait_poll, &env.exit).await;
                Ok(())
            }
        }
    }

    async fn wait(&self, task: &mut Task, env: &TaskEnv) -> Result<()> {
        loop {
            let remote = self.executor.status(task).await?;
            if remote.status.is_end() {
                return self.finish(task, remote).await;
            }
            if sleep_or_exit(self.wait_poll, &env.exit).await {
                return Ok(());
            }
        }
    }

    async fn finish(&self, task: &mut Task, remote: StatusDesc) -> Result<()> {
        let now = Utc::now();
        task.status = remote.status;
        task.result.metadata.extend(remote.outputs);
        task.result.message = remote.message;
        task.time_end = Some(now);
        task.cost_time_sec = task
            .time_begin
            .map(|begin| (now - begin).num_seconds())
            .unwrap_or(0);
        self.store.update_task(task).await?;
        info!(
            pipeline_id = task.pipeline_id,
            task = %task.name,
            status = %task.status,
            "task finished"
        );
        Ok(())
    }

    /// Compare with the executor's view and adopt it when it is ahead.
    async fn resync(&self, task: &mut Task) -> Result<()> {
        let remote = self.executor.status(task).await?;
        if remote.status == task.status {
            return Ok(());
        }

        if remote.status.is_abnormal_failed() {
            warn!(
                task = %task.name,
                local = %task.status,
                remote = %remote.status,
                "executor reported abnormal status; ignoring"
            );
            return Ok(());
        }

        if remote.status.is_end() {
            if task.status.is_pre_run() {
                warn!(
                    task = %task.name,
                    local = %task.status,
                    remote = %remote.status,
                    "executor finished a task the engine never started"
                );
            }
            return self.finish(task, remote).await;
        }

        if progress_rank(remote.status) > progress_rank(task.status) {
            debug!(task = %task.name, from = %task.status, to = %remote.status, "status corrected from executor");
            task.status = remote.status;
            self.store.update_task_status(task.id, task.status).await?;
        }
        Ok(())
    }

    async fn fail(&self, task: &mut Task, err: EngineError) -> Result<()> {
        let status = if err.is_user() {
            Status::Failed
        } else {
            Status::Error
        };
        warn!(task = %task.name, %status, error = %err, "task failed");
        task.status = status;
        task.result.message = Some(err.to_string());
        task.time_end = Some(Utc::now());
        self.store.update_task(task).await
    }

    fn should_loop(&self, task: &Task, env: &TaskEnv) -> bool {
        let Some(opts) = &task.loop_options else {
            return false;
        };
        if opts.looped_times + 1 >= opts.strategy.max_times {
            info!(task = %task.name, looped = opts.looped_times, "loop limit reached");
            return false;
        }
        if opts.break_expr.trim().is_empty() {
            return true;
        }

        let mut outputs = env.outputs.clone();
        outputs.extend(task.result.metadata.clone());
        let ctx = EvalContext {
            task_status: task.status,
            pipeline_status: env.calculated_status,
            looped_times: opts.looped_times,
            outputs,
        };
        match evaluate(&opts.break_expr, &ctx) {
            Ok(stop) => !stop,
            Err(err) => {
                warn!(task = %task.name, error = %err, "invalid loop break expression; not looping");
                false
            }
        }
    }

    /// Returns `false` when the exit signal fired during the think time.
    async fn reset_for_loop(&self, task: &mut Task, exit: &CancellationToken) -> Result<bool> {
        let Some(opts) = task.loop_options.as_ref() else {
            return Ok(false);
        };
        let delay = loop_delay(&opts.strategy, opts.looped_times);
        info!(
            task = %task.name,
            looped = opts.looped_times,
            delay_secs = delay.as_secs_f64(),
            "looping task"
        );
        if sleep_or_exit(delay, exit).await {
            return Ok(false);
        }

        self.throttler.release(task.id);
        let finished = std::mem::take(&mut task.extra.uuid);
        let mut previous = std::mem::take(&mut task.extra.previous_uuids);
        task.reset_for_rerun();
        if !finished.is_empty() {
            previous.push(finished);
        }
        task.extra.previous_uuids = previous;
        if let Some(opts) = task.loop_options.as_mut() {
            opts.looped_times += 1;
        }
        self.store.update_task(task).await?;
        Ok(true)
    }
}

fn looped_times(task: &Task) -> u64 {
    task.loop_options.as_ref().map_or(0, |o| o.looped_times)
}

fn progress_rank(status: Status) -> u8 {
    match status {
        Status::Analyzed => 0,
        Status::Born => 1,
        Status::Created => 2,
        Status::Queue => 3,
        Status::Running | Status::Paused => 4,
        _ => 5,
    }
}

/// Sleep for `delay`; returns `true` if `exit` fired first.
async fn sleep_or_exit(delay: Duration, exit: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = exit.cancelled() => true,
    }
}
