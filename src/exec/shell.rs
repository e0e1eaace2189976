// src/exec/shell.rs

//! Local process executor running each task's command through the shell.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::{Arc, LazyLock};

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::backend::{Executor, StatusDesc};
use crate::errors::{EngineError, Result};
use crate::model::{Status, Task};

/// `::output key=value` lines on stdout publish task outputs.
static OUTPUT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^::output\s+([A-Za-z0-9_.-]+)=(.*)$").expect("valid output regex")
});

struct Job {
    command: String,
    envs: BTreeMap<String, String>,
    desc: StatusDesc,
    cancel: Option<oneshot::Sender<()>>,
}

/// Executor running `sh -c <command>` per task, keyed by the task uuid.
#[derive(Clone)]
pub struct ShellExecutor {
    name: String,
    jobs: Arc<DashMap<String, Job>>,
}

impl ShellExecutor {
    pub const DEFAULT_NAME: &'static str = "shell";

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            jobs: Arc::new(DashMap::new()),
        }
    }

    fn job_key(task: &Task) -> Result<&str> {
        if task.extra.uuid.is_empty() {
            return Err(EngineError::abnormal(format!(
                "task '{}' has no executor uuid",
                task.name
            )));
        }
        Ok(task.extra.uuid.as_str())
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new(Self::DEFAULT_NAME)
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn status(&self, task: &Task) -> Result<StatusDesc> {
        let key = Self::job_key(task)?;
        Ok(self
            .jobs
            .get(key)
            .map(|job| job.desc.clone())
            .unwrap_or_else(|| StatusDesc::new(Status::Born)))
    }

    async fn create(&self, task: &Task) -> Result<()> {
        let key = Self::job_key(task)?;
        self.jobs.entry(key.to_string()).or_insert_with(|| Job {
            command: task.extra.command.clone(),
            envs: task.extra.envs.clone(),
            desc: StatusDesc::new(Status::Created),
            cancel: None,
        });
        Ok(())
    }

    async fn start(&self, task: &Task) -> Result<()> {
        let key = Self::job_key(task)?.to_string();
        let (command, envs, cancel_rx) = {
            let mut job = self.jobs.get_mut(&key).ok_or_else(|| {
                EngineError::abnormal(format!("job '{key}' not created before start"))
            })?;
            if job.desc.status != Status::Created {
                debug!(task = %task.name, status = %job.desc.status, "job already started");
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            job.cancel = Some(tx);
            job.desc.status = Status::Running;
            (job.command.clone(), job.envs.clone(), rx)
        };

        let jobs = Arc::clone(&self.jobs);
        let task_name = task.name.clone();
        tokio::spawn(async move {
            let desc = match run_process(&task_name, &command, &envs, cancel_rx).await {
                Ok(desc) => desc,
                Err(err) => {
                    warn!(task = %task_name, error = %err, "task execution error");
                    StatusDesc {
                        status: Status::Failed,
                        outputs: BTreeMap::new(),
                        message: Some(format!("{err:#}")),
                    }
                }
            };
            if let Some(mut job) = jobs.get_mut(&key) {
                job.desc = desc;
                job.cancel = None;
            }
        });
        Ok(())
    }

    async fn cancel(&self, task: &Task) -> Result<()> {
        let key = Self::job_key(task)?;
        if let Some(mut job) = self.jobs.get_mut(key) {
            match job.cancel.take() {
                Some(tx) => {
                    let _ = tx.send(());
                }
                None if !job.desc.status.is_end() => {
                    job.desc.status = Status::StopByUser;
                }
                None => {}
            }
        }
        Ok(())
    }

    async fn batch_delete(&self, tasks: &[Task]) -> Result<()> {
        for task in tasks {
            if let Some((_, mut job)) = self.jobs.remove(task.extra.uuid.as_str()) {
                if let Some(tx) = job.cancel.take() {
                    let _ = tx.send(());
                }
                debug!(task = %task.name, uuid = %task.extra.uuid, "job deleted");
            }
        }
        Ok(())
    }
}

async fn run_process(
    task_name: &str,
    command: &str,
    envs: &BTreeMap<String, String>,
    mut cancel_rx: oneshot::Receiver<()>,
) -> anyhow::Result<StatusDesc> {
    info!(task = %task_name, cmd = %command, "starting task process");

    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(command);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(command);
        c
    };
    cmd.envs(envs)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning process for task '{task_name}'"))?;

    // Always consume stderr so buffers don't fill; log at debug.
    if let Some(stderr) = child.stderr.take() {
        let name = task_name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(task = %name, "stderr: {}", line);
            }
        });
    }

    let stdout_reader = child.stdout.take().map(|stdout| {
        let name = task_name.to_string();
        tokio::spawn(async move {
            let mut outputs = BTreeMap::new();
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(task = %name, "stdout: {}", line);
                if let Some(caps) = OUTPUT_LINE.captures(line.trim_end()) {
                    outputs.insert(caps[1].to_string(), caps[2].to_string());
                }
            }
            outputs
        })
    });

    tokio::select! {
        status_res = child.wait() => {
            let status = status_res
                .with_context(|| format!("waiting for process of task '{task_name}'"))?;
            let code = status.code().unwrap_or(-1);
            info!(task = %task_name, exit_code = code, success = status.success(), "task process exited");

            let outputs = match stdout_reader {
                Some(handle) => handle.await.unwrap_or_default(),
                None => BTreeMap::new(),
            };
            Ok(StatusDesc {
                status: if status.success() { Status::Success } else { Status::Failed },
                outputs,
                message: (!status.success()).then(|| format!("exit code {code}")),
            })
        }

        cancel = &mut cancel_rx => {
            if cancel.is_ok() {
                info!(task = %task_name, "cancellation requested; killing process");
                if let Err(e) = child.kill().await {
                    warn!(task = %task_name, error = %e, "failed to kill child process on cancellation");
                }
            }
            Ok(StatusDesc {
                status: Status::StopByUser,
                outputs: BTreeMap::new(),
                message: Some("cancelled".to_string()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_lines_are_recognised() {
        let caps = OUTPUT_LINE.captures("::output version=1.2.3").unwrap();
        assert_eq!(&caps[1], "version");
        assert_eq!(&caps[2], "1.2.3");
        assert!(OUTPUT_LINE.captures("output version=1").is_none());
    }
}
