// src/gc/mod.rs

//! Lease-based delayed cleanup of compute resources and database rows.
//!
//! Teardown arms wait-records in the coordination store. When a record's
//! key is observed deleted (lease expiry, ensure sweep), the matching
//! handler runs under a short cross-instance lock:
//!
//! - [`resource`]: batch-delete executor resources of a namespace.
//! - [`database`]: archive or delete a pipeline's rows.
//!
//! Lease notifications get lost, so two periodic sweeps are a permanent
//! part of the design:
//!
//! - [`ensure`]: force-delete records already past their deadline and
//!   back-fill records for pipelines older than GC tracking.
//! - [`compensate`]: re-arm records for long-finished pipelines whose
//!   resources were never collected. The same loop also drops archives past
//!   their retention.

pub mod compensate;
pub mod database;
pub mod ensure;
pub mod resource;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GcSection;
use crate::coord::{CoordinationStore, DistributedLock, LeaseId, WatchKind, Watcher, try_lock};
use crate::errors::Result;
use crate::exec::ExecutorRegistry;
use crate::model::PipelineId;
use crate::store::PipelineStore;

pub use compensate::CompensationReport;
pub use ensure::SweepReport;

/// Value stored under a wait-record key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitRecord {
    pub ttl_secs: u64,
    pub lease_id: LeaseId,
    /// When the lease is due to fire.
    pub gc_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// What a GC handler did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcOutcome {
    Collected,
    /// Not eligible yet; the wait-record was re-armed.
    Deferred,
    /// Another instance holds the lock.
    Busy,
    Nothing,
}

/// Owns the GC wait-records and their handlers.
#[derive(Clone)]
pub struct GcManager {
    store: Arc<dyn PipelineStore>,
    coord: Arc<dyn CoordinationStore>,
    executors: ExecutorRegistry,
    config: GcSection,
}

impl std::fmt::Debug for GcManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcManager")
            .field("executors", &self.executors)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl GcManager {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        coord: Arc<dyn CoordinationStore>,
        executors: ExecutorRegistry,
        config: GcSection,
    ) -> Self {
        Self {
            store,
            coord,
            executors,
            config,
        }
    }

    pub fn config(&self) -> &GcSection {
        &self.config
    }

    pub(crate) fn resource_key(&self, namespace: &str) -> String {
        format!("{}/{namespace}", self.config.resource_prefix)
    }

    pub(crate) fn resource_member_prefix(&self, namespace: &str) -> String {
        format!("{}/{namespace}/", self.config.resource_prefix)
    }

    pub(crate) fn database_key(&self, pipeline_id: PipelineId) -> String {
        format!("{}/{pipeline_id}", self.config.database_prefix)
    }

    /// Single path segment directly under `prefix`, if `key` is one.
    pub(crate) fn record_name<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|name| !name.is_empty() && !name.contains('/'))
    }

    /// Put (or replace) a leased wait-record. Replacing moves the deadline.
    pub(crate) async fn arm(
        &self,
        key: &str,
        ttl_secs: u64,
        payload: serde_json::Value,
    ) -> Result<WaitRecord> {
        let ttl_secs = ttl_secs.max(1);
        let lease_id = self
            .coord
            .grant_lease(Duration::from_secs(ttl_secs))
            .await?;
        let record = WaitRecord {
            ttl_secs,
            lease_id,
            gc_at: Utc::now() + chrono::Duration::seconds(ttl_secs as i64),
            payload,
        };
        self.coord
            .put(key, serde_json::to_string(&record)?, Some(lease_id))
            .await?;
        debug!(key, ttl_secs, "wait-record armed");
        Ok(record)
    }

    pub(crate) async fn read_record(&self, key: &str) -> Result<Option<WaitRecord>> {
        match self.coord.get(key).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    pub(crate) async fn lock(&self, name: &str) -> Result<Option<DistributedLock>> {
        let key = format!("{}/{name}", self.config.lock_prefix);
        try_lock(&self.coord, &key, self.config.lock_ttl()).await
    }

    /// Start the watch listeners and both periodic sweeps.
    ///
    /// Watches are registered before this returns, so no event emitted
    /// afterwards is missed.
    pub fn spawn(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let resource_watch = self
            .coord
            .watch(&format!("{}/", self.config.resource_prefix));
        let database_watch = self
            .coord
            .watch(&format!("{}/", self.config.database_prefix));

        info!("gc manager started");
        vec![
            tokio::spawn(self.clone().listen(resource_watch, shutdown.clone(), true)),
            tokio::spawn(self.clone().listen(database_watch, shutdown.clone(), false)),
            tokio::spawn(self.clone().ensure_loop(shutdown.clone())),
            tokio::spawn(self.clone().compensate_loop(shutdown)),
        ]
    }

    async fn listen(self, mut watcher: Watcher, shutdown: CancellationToken, resource: bool) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                ev = watcher.next() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
            };
            if event.kind != WatchKind::Delete {
                continue;
            }

            let gc = self.clone();
            if resource {
                let Some(namespace) =
                    Self::record_name(&self.config.resource_prefix, &event.key).map(str::to_string)
                else {
                    continue;
                };
                tokio::spawn(async move {
                    if let Err(err) = gc.handle_resource_gc(&namespace).await {
                        warn!(%namespace, error = %err, "resource gc failed");
                    }
                });
            } else {
                let Some(pipeline_id) = Self::record_name(&self.config.database_prefix, &event.key)
                    .and_then(|name| name.parse::<PipelineId>().ok())
                else {
                    continue;
                };
                let need_archive = event
                    .value
                    .as_deref()
                    .and_then(|raw| serde_json::from_str::<WaitRecord>(raw).ok())
                    .and_then(|record| database::need_archive(&record.payload));
                tokio::spawn(async move {
                    if let Err(err) = gc.handle_database_gc(pipeline_id, need_archive).await {
                        warn!(pipeline_id, error = %err, "database gc failed");
                    }
                });
            }
        }
        debug!(resource, "gc watch listener stopped");
    }

    async fn ensure_loop(self, shutdown: CancellationToken) {
        // Spread instances out so they don't all contend for the lock.
        let jitter = Duration::from_secs(rand::thread_rng().gen_range(0..=60));
        let mut next = jitter;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(next) => {}
            }
            next = match self.ensure_sweep().await {
                Ok(report) => {
                    debug!(?report, "ensure sweep done");
                    Duration::from_secs(self.config.ensure_interval_secs)
                }
                Err(err) => {
                    warn!(error = %err, "ensure sweep failed");
                    Duration::from_secs(self.config.ensure_retry_secs)
                }
            };
        }
    }

    async fn compensate_loop(self, shutdown: CancellationToken) {
        let interval = Duration::from_secs(self.config.compensate_interval_secs);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            match self.compensate_sweep().await {
                Ok(report) => debug!(?report, "compensation sweep done"),
                Err(err) => warn!(error = %err, "compensation sweep failed"),
            }
            if let Err(err) = self.archive_retention_sweep().await {
                warn!(error = %err, "archive retention sweep failed");
            }
        }
    }
}
