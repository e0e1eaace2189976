use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pipengine::errors::{EngineError, Result};
use pipengine::exec::{Executor, StatusDesc};
use pipengine::model::{Status, Task};

pub const FAKE_EXECUTOR: &str = "fake";

/// One scripted execution of a task.
#[derive(Debug, Clone)]
pub struct Run {
    pub status: Status,
    pub outputs: BTreeMap<String, String>,
    /// Status polls answered with Running before the final status.
    pub running_polls: u32,
}

impl Run {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            outputs: BTreeMap::new(),
            running_polls: 0,
        }
    }

    pub fn output(mut self, key: &str, value: &str) -> Self {
        self.outputs.insert(key.to_string(), value.to_string());
        self
    }

    pub fn polls(mut self, running_polls: u32) -> Self {
        self.running_polls = running_polls;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Create,
    Start,
    Cancel,
    BatchDelete,
}

#[derive(Debug, Default)]
struct Script {
    /// Runs consumed in order; the last one repeats.
    runs: VecDeque<Run>,
    abnormal_creates: u32,
    abnormal_starts: u32,
}

#[derive(Debug, Clone)]
struct Job {
    task: String,
    status: Status,
    run: Run,
    polls_left: u32,
}

/// A fake executor that:
/// - records every call it receives, by task name
/// - answers status polls from a per-task script (default: Success)
/// - can inject abnormal failures into `create`, `start` and `batch_delete`.
pub struct FakeExecutor {
    name: String,
    scripts: Mutex<HashMap<String, Script>>,
    jobs: Mutex<HashMap<String, Job>>,
    calls: Mutex<Vec<(CallKind, String)>>,
    deleted: Mutex<Vec<String>>,
    fail_batch_delete: AtomicBool,
}

impl FakeExecutor {
    pub fn new() -> Arc<Self> {
        Self::named(FAKE_EXECUTOR)
    }

    pub fn named(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            scripts: Mutex::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            fail_batch_delete: AtomicBool::new(false),
        })
    }

    /// Every execution of `task` ends with `status`.
    pub fn script(&self, task: &str, status: Status) {
        self.script_runs(task, vec![Run::new(status)]);
    }

    pub fn script_runs(&self, task: &str, runs: Vec<Run>) {
        let mut scripts = self.scripts.lock().unwrap();
        scripts.entry(task.to_string()).or_default().runs = runs.into();
    }

    /// The next `times` create calls for `task` fail with an abnormal error.
    pub fn fail_creates(&self, task: &str, times: u32) {
        let mut scripts = self.scripts.lock().unwrap();
        scripts.entry(task.to_string()).or_default().abnormal_creates = times;
    }

    /// The next `times` start calls for `task` fail with an abnormal error.
    pub fn fail_starts(&self, task: &str, times: u32) {
        let mut scripts = self.scripts.lock().unwrap();
        scripts.entry(task.to_string()).or_default().abnormal_starts = times;
    }

    pub fn fail_batch_delete(&self, fail: bool) {
        self.fail_batch_delete.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(CallKind, String)> {
        self.calls.lock().unwrap().clone()
    }

    /// Task names in the order they were started.
    pub fn started(&self) -> Vec<String> {
        self.calls_of(CallKind::Start)
    }

    pub fn calls_of(&self, kind: CallKind) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn count(&self, kind: CallKind, task: &str) -> usize {
        self.calls_of(kind).iter().filter(|n| *n == task).count()
    }

    /// Job uuids released through `batch_delete`.
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    fn record(&self, kind: CallKind, task: &str) {
        self.calls.lock().unwrap().push((kind, task.to_string()));
    }

    fn next_run(&self, task: &str) -> Run {
        let mut scripts = self.scripts.lock().unwrap();
        let Some(script) = scripts.get_mut(task) else {
            return Run::new(Status::Success);
        };
        if script.runs.len() > 1 {
            script.runs.pop_front().unwrap_or_else(|| Run::new(Status::Success))
        } else {
            script
                .runs
                .front()
                .cloned()
                .unwrap_or_else(|| Run::new(Status::Success))
        }
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn status(&self, task: &Task) -> Result<StatusDesc> {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(&task.extra.uuid) else {
            return Ok(StatusDesc::new(Status::Born));
        };
        if job.status == Status::Running {
            if job.polls_left > 0 {
                job.polls_left -= 1;
                return Ok(StatusDesc::new(Status::Running));
            }
            job.status = job.run.status;
        }
        Ok(StatusDesc {
            status: job.status,
            outputs: if job.status.is_end() {
                job.run.outputs.clone()
            } else {
                BTreeMap::new()
            },
            message: None,
        })
    }

    async fn create(&self, task: &Task) -> Result<()> {
        self.record(CallKind::Create, &task.name);
        {
            let mut scripts = self.scripts.lock().unwrap();
            if let Some(script) = scripts.get_mut(&task.name) {
                if script.abnormal_creates > 0 {
                    script.abnormal_creates -= 1;
                    return Err(EngineError::abnormal(format!(
                        "injected create failure for '{}'",
                        task.name
                    )));
                }
            }
        }
        let run = self.next_run(&task.name);
        self.jobs.lock().unwrap().insert(
            task.extra.uuid.clone(),
            Job {
                task: task.name.clone(),
                status: Status::Created,
                polls_left: run.running_polls,
                run,
            },
        );
        Ok(())
    }

    async fn start(&self, task: &Task) -> Result<()> {
        self.record(CallKind::Start, &task.name);
        if let Some(script) = self.scripts.lock().unwrap().get_mut(&task.name) {
            if script.abnormal_starts > 0 {
                script.abnormal_starts -= 1;
                return Err(EngineError::abnormal(format!(
                    "injected start failure for '{}'",
                    task.name
                )));
            }
        }
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&task.extra.uuid).ok_or_else(|| {
            EngineError::abnormal(format!("job for '{}' was never created", task.name))
        })?;
        job.status = Status::Running;
        Ok(())
    }

    async fn cancel(&self, task: &Task) -> Result<()> {
        self.record(CallKind::Cancel, &task.name);
        if let Some(job) = self.jobs.lock().unwrap().get_mut(&task.extra.uuid) {
            job.status = Status::StopByUser;
        }
        Ok(())
    }

    async fn batch_delete(&self, tasks: &[Task]) -> Result<()> {
        for task in tasks {
            self.record(CallKind::BatchDelete, &task.name);
        }
        if self.fail_batch_delete.load(Ordering::SeqCst) {
            return Err(EngineError::abnormal("injected batch delete failure"));
        }
        let mut jobs = self.jobs.lock().unwrap();
        let mut deleted = self.deleted.lock().unwrap();
        for task in tasks {
            if let Some(job) = jobs.remove(&task.extra.uuid) {
                tracing::debug!(task = %job.task, uuid = %task.extra.uuid, "fake job deleted");
            }
            deleted.push(task.extra.uuid.clone());
        }
        Ok(())
    }
}
