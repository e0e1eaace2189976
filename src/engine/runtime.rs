// src/engine/runtime.rs

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Engine;
use crate::errors::{EngineError, Result};
use crate::model::{Pipeline, PipelineId};

impl Engine {
    /// Queue a reconcile pass for a pipeline.
    pub fn wake(&self, pipeline_id: PipelineId) {
        if self.inner.wake_tx.send(pipeline_id).is_err() {
            debug!(pipeline_id, "runtime stopped; wake dropped");
        }
    }

    /// Main wake loop.
    ///
    /// Every wake spawns an independent reconcile pass; passes for the same
    /// pipeline may overlap, admission keeps them from double-dispatching.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let Some(mut rx) = self.inner.wake_rx.lock().await.take() else {
            return Err(EngineError::Other(anyhow::anyhow!(
                "engine runtime is already running"
            )));
        };
        info!("engine runtime started");

        loop {
            let pipeline_id = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested; stopping runtime");
                    break;
                }
                next = rx.recv() => match next {
                    Some(id) => id,
                    None => break,
                },
            };

            let engine = self.clone();
            tokio::spawn(async move {
                if let Err(err) = engine.reconcile(pipeline_id).await {
                    warn!(pipeline_id, error = %err, "reconcile pass aborted");
                }
            });
        }

        info!("engine runtime exiting");
        Ok(())
    }

    /// Spawn [`Engine::run`] on the current runtime.
    pub fn start(&self, shutdown: CancellationToken) -> JoinHandle<Result<()>> {
        let engine = self.clone();
        tokio::spawn(async move { engine.run(shutdown).await })
    }

    /// Wake a pipeline and wait until its teardown has completed.
    ///
    /// The wake is redelivered periodically, so a pass aborted by an
    /// exhausted abnormal retry is picked up again.
    pub async fn wait_pipeline_done(&self, pipeline_id: PipelineId) -> Result<Pipeline> {
        let redeliver = self.inner.config.reconcile.redeliver();
        loop {
            let pipeline = self.inner.store.get_pipeline(pipeline_id).await?;
            if pipeline.status.is_end()
                && pipeline.extra.teardown_complete
                && !self.inner.state.is_tearing_down(pipeline_id)
            {
                return Ok(pipeline);
            }

            let ctx = self.inner.state.context(pipeline_id);
            self.wake(pipeline_id);
            tokio::select! {
                _ = ctx.done.cancelled() => {}
                _ = tokio::time::sleep(redeliver) => {
                    debug!(pipeline_id, "pipeline still running; redelivering wake");
                }
            }
        }
    }
}
