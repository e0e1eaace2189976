// src/config/model.rs

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::model::GcPolicy;

/// Engine configuration as read from a TOML file.
///
/// ```toml
/// [reconcile]
/// wait_poll_secs = 5
/// throttler_capacity = 4
///
/// [retry]
/// max_retries = 3
///
/// [gc]
/// resource_ttl_success_secs = 1800
/// archive_finished = true
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEngineConfig {
    #[serde(default)]
    pub reconcile: ReconcileSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub gc: GcSection,
}

/// Validated engine configuration.
///
/// Only constructible through `TryFrom<RawEngineConfig>` (see
/// [`crate::config::validate`]) or [`EngineConfig::default`].
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub reconcile: ReconcileSection,
    pub retry: RetrySection,
    pub gc: GcSection,
}

impl EngineConfig {
    pub(crate) fn new_unchecked(
        reconcile: ReconcileSection,
        retry: RetrySection,
        gc: GcSection,
    ) -> Self {
        Self {
            reconcile,
            retry,
            gc,
        }
    }
}

/// `[reconcile]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcileSection {
    /// How often a running task's executor status is polled.
    pub wait_poll_secs: u64,
    /// Engine-wide execution slots; `0` means unlimited.
    pub throttler_capacity: usize,
    /// Reject done task names unreachable from the DAG roots.
    pub strict_schedule: bool,
    /// How often a waiter re-wakes a pipeline that has not finished.
    pub redeliver_secs: u64,
}

impl Default for ReconcileSection {
    fn default() -> Self {
        Self {
            wait_poll_secs: 5,
            throttler_capacity: 0,
            strict_schedule: true,
            redeliver_secs: 60,
        }
    }
}

impl ReconcileSection {
    pub fn wait_poll(&self) -> Duration {
        Duration::from_secs(self.wait_poll_secs)
    }

    pub fn redeliver(&self) -> Duration {
        Duration::from_secs(self.redeliver_secs)
    }
}

/// `[retry]` section: abnormal-error backoff of the task state machine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub base_secs: u64,
    pub ratio: f64,
    pub ceiling_secs: u64,
    pub floor_secs: u64,
    pub max_retries: u32,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            base_secs: 5,
            ratio: 2.0,
            ceiling_secs: 600,
            floor_secs: 30,
            max_retries: 3,
        }
    }
}

/// `[gc]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GcSection {
    pub resource_ttl_success_secs: u64,
    pub resource_ttl_failed_secs: u64,
    pub database_ttl_analyzed_secs: u64,
    pub database_ttl_finished_secs: u64,
    /// Archive rather than delete when database GC fires on a pipeline that
    /// never ran.
    pub archive_analyzed: bool,
    /// Archive rather than delete when database GC fires on a pipeline that
    /// ran.
    pub archive_finished: bool,
    /// How long archives of never-run pipelines are kept, counted from the
    /// pipeline's creation.
    pub archive_retain_analyzed_secs: u64,
    pub archive_retain_finished_secs: u64,
    /// TTL a pending wait-record is pushed out to by a delay.
    pub delay_ttl_secs: u64,
    pub lock_ttl_secs: u64,
    pub ensure_interval_secs: u64,
    /// Ensure sweep interval after a failed sweep.
    pub ensure_retry_secs: u64,
    pub compensate_interval_secs: u64,
    pub compensate_buffer_secs: u64,
    pub compensate_page_size: usize,
    /// Pipelines created before this instant predate wait-record tracking;
    /// the ensure sweep back-fills records for them.
    pub tracking_since: Option<DateTime<Utc>>,
    pub resource_prefix: String,
    pub database_prefix: String,
    pub lock_prefix: String,
}

impl Default for GcSection {
    fn default() -> Self {
        let policy = GcPolicy::default();
        Self {
            resource_ttl_success_secs: policy.resource_ttl_success_secs,
            resource_ttl_failed_secs: policy.resource_ttl_failed_secs,
            database_ttl_analyzed_secs: policy.database_ttl_analyzed_secs,
            database_ttl_finished_secs: policy.database_ttl_finished_secs,
            archive_analyzed: policy.archive_analyzed,
            archive_finished: policy.archive_finished,
            archive_retain_analyzed_secs: 259_200,
            archive_retain_finished_secs: 2_592_000,
            delay_ttl_secs: 86_400,
            lock_ttl_secs: 30,
            ensure_interval_secs: 7_200,
            ensure_retry_secs: 300,
            compensate_interval_secs: 3_600,
            compensate_buffer_secs: 3_600,
            compensate_page_size: 100,
            tracking_since: None,
            resource_prefix: "/pipengine/gc/resource".to_string(),
            database_prefix: "/pipengine/gc/database".to_string(),
            lock_prefix: "/pipengine/gc/lock".to_string(),
        }
    }
}

impl GcSection {
    /// GC policy stamped onto newly submitted pipelines.
    pub fn policy(&self) -> GcPolicy {
        GcPolicy {
            resource_ttl_success_secs: self.resource_ttl_success_secs,
            resource_ttl_failed_secs: self.resource_ttl_failed_secs,
            database_ttl_analyzed_secs: self.database_ttl_analyzed_secs,
            database_ttl_finished_secs: self.database_ttl_finished_secs,
            archive_analyzed: self.archive_analyzed,
            archive_finished: self.archive_finished,
        }
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}
