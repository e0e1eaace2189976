// src/engine/submit.rs

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::Engine;
use crate::definition::{Definition, SNIPPET_EXECUTOR, TaskDef};
use crate::errors::Result;
use crate::model::{
    LoopOptions, NestLink, OutputDecl, Pipeline, PipelineExtra, PipelineId, SnippetRef, Snapshot,
    Stage, StageId, Status, Task, TaskExtra, TaskResult,
};

/// Caller-supplied overrides for a submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Resource namespace; defaults to `pipeline-{id}`.
    pub namespace: Option<String>,
    /// Overrides the definition's parameter defaults.
    pub params: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, String>,
    pub envs: BTreeMap<String, String>,
}

/// Where a new pipeline comes from.
#[derive(Debug, Clone)]
pub(crate) struct PipelineSeed {
    pub source: String,
    pub nest: Option<NestLink>,
}

impl Engine {
    /// Materialise a definition as a new pipeline in status Analyzed.
    ///
    /// Nothing runs until the pipeline is woken (see [`Engine::wake`] and
    /// [`Engine::wait_pipeline_done`]).
    pub async fn submit(
        &self,
        definition: &Definition,
        options: SubmitOptions,
    ) -> Result<Pipeline> {
        let seed = PipelineSeed {
            source: definition.source.clone(),
            nest: None,
        };
        self.create_pipeline(definition, seed, options).await
    }

    /// Submit a definition and wait until the pipeline is torn down.
    pub async fn run_pipeline(
        &self,
        definition: &Definition,
        options: SubmitOptions,
    ) -> Result<Pipeline> {
        let pipeline = self.submit(definition, options).await?;
        self.wait_pipeline_done(pipeline.id).await
    }

    pub(crate) async fn create_pipeline(
        &self,
        definition: &Definition,
        seed: PipelineSeed,
        options: SubmitOptions,
    ) -> Result<Pipeline> {
        let store = &self.inner.store;
        let policy = self.inner.config.gc.policy();

        let mut labels = definition.labels.clone();
        labels.extend(options.labels);
        let mut secrets = definition.secrets.clone();
        secrets.extend(options.secrets);
        let mut envs = definition.envs.clone();
        envs.extend(options.envs);
        let mut run_params = definition.params.clone();
        run_params.extend(options.params);

        let record = Pipeline {
            id: 0,
            source: seed.source,
            name: definition.name.clone(),
            status: Status::Analyzed,
            is_snippet: seed.nest.is_some(),
            labels,
            extra: PipelineExtra {
                namespace: options.namespace.clone().unwrap_or_default(),
                gc: policy.clone(),
                snapshot: Snapshot {
                    secrets,
                    envs,
                    run_params,
                    resolved_params: None,
                },
                nest: seed.nest,
                outputs: definition
                    .outputs
                    .iter()
                    .map(|o| OutputDecl {
                        name: o.name.clone(),
                        reference: o.reference.clone(),
                    })
                    .collect(),
                ..PipelineExtra::default()
            },
            time_created: Utc::now(),
            time_begin: None,
            time_end: None,
            cost_time_sec: -1,
        };
        let mut pipeline = store.create_pipeline(record).await?;
        if options.namespace.is_none() {
            pipeline.extra.namespace = format!("pipeline-{}", pipeline.id);
            store
                .update_pipeline_extra(pipeline.id, pipeline.extra.clone())
                .await?;
        }

        let mut previous: Option<StageId> = None;
        for (order, stage_def) in definition.stages.iter().enumerate() {
            let stage = store
                .create_stage(Stage {
                    id: 0,
                    pipeline_id: pipeline.id,
                    order,
                    name: stage_name(order, &stage_def.name),
                    previous_stage_id: previous,
                })
                .await?;
            previous = Some(stage.id);

            for task_def in &stage_def.tasks {
                store
                    .create_task(new_task(pipeline.id, &stage, task_def))
                    .await?;
            }
        }

        if let Err(err) = self
            .inner
            .gc
            .wait_database_gc(pipeline.id, policy.database_ttl_analyzed_secs, policy.archive_analyzed)
            .await
        {
            warn!(pipeline_id = pipeline.id, error = %err, "failed to arm database gc");
        }

        info!(
            pipeline_id = pipeline.id,
            name = %pipeline.name,
            namespace = %pipeline.namespace(),
            nested = pipeline.is_snippet,
            "pipeline submitted"
        );
        Ok(pipeline)
    }
}

fn stage_name(order: usize, declared: &str) -> String {
    if declared.is_empty() {
        format!("stage-{order}")
    } else {
        declared.to_string()
    }
}

fn new_task(pipeline_id: PipelineId, stage: &Stage, def: &TaskDef) -> Task {
    let executor = if def.snippet.is_some() {
        SNIPPET_EXECUTOR.to_string()
    } else {
        def.executor.clone()
    };
    debug!(pipeline_id, task = %def.name, %executor, "creating task");
    Task {
        id: 0,
        pipeline_id,
        stage_id: stage.id,
        stage_order: stage.order,
        name: def.name.clone(),
        status: Status::Analyzed,
        after: Definition::after_of(def).to_vec(),
        executor,
        allow_failure: def.allow_failure,
        condition: def.condition.clone(),
        loop_options: def.loop_def.as_ref().map(|l| LoopOptions {
            break_expr: l.break_expr.clone(),
            strategy: l.strategy(),
            looped_times: 0,
        }),
        policy: def.policy,
        snippet: def.snippet.as_ref().map(|s| SnippetRef {
            definition: s.definition.clone(),
            params: s.params.clone(),
            pipeline_id: None,
        }),
        extra: TaskExtra {
            command: def.cmd.clone(),
            envs: def.envs.clone(),
            ..TaskExtra::default()
        },
        result: TaskResult::default(),
        time_begin: None,
        time_end: None,
        cost_time_sec: -1,
    }
}
