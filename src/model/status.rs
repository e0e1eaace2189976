// src/model/status.rs

//! Lifecycle status shared by pipelines, stages and tasks.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of a pipeline, stage or task.
///
/// The three record kinds track their status independently; the values just
/// overlap. Non-terminal values are the ones the engine still has to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Analyzed,
    Born,
    Created,
    Queue,
    Running,
    Paused,

    Success,
    Failed,
    Timeout,
    StopByUser,
    AnalyzeFailed,
    #[serde(rename = "DBError")]
    DbError,
    NoNeedBySystem,
    Disabled,
    Error,
}

impl Status {
    pub const ALL: [Status; 15] = [
        Status::Analyzed,
        Status::Born,
        Status::Created,
        Status::Queue,
        Status::Running,
        Status::Paused,
        Status::Success,
        Status::Failed,
        Status::Timeout,
        Status::StopByUser,
        Status::AnalyzeFailed,
        Status::DbError,
        Status::NoNeedBySystem,
        Status::Disabled,
        Status::Error,
    ];

    /// Terminal statuses: the engine will not advance the record any further.
    pub fn is_end(self) -> bool {
        matches!(
            self,
            Status::Success
                | Status::Failed
                | Status::Timeout
                | Status::StopByUser
                | Status::AnalyzeFailed
                | Status::DbError
                | Status::NoNeedBySystem
                | Status::Disabled
                | Status::Error
        )
    }

    /// Statuses counted as success when aggregating.
    ///
    /// `Disabled` and `NoNeedBySystem` are never rewritten in storage, they
    /// only count as success for the parent's computed status.
    pub fn is_success_like(self) -> bool {
        matches!(
            self,
            Status::Success | Status::Disabled | Status::NoNeedBySystem
        )
    }

    /// Terminal and not success-equivalent.
    pub fn is_failed(self) -> bool {
        self.is_end() && !self.is_success_like()
    }

    /// Failure classes caused by the platform rather than the user's job.
    ///
    /// An executor reporting one of these while the engine believes otherwise
    /// is logged but never trusted.
    pub fn is_abnormal_failed(self) -> bool {
        matches!(self, Status::Error | Status::DbError | Status::AnalyzeFailed)
    }

    /// States before the task reached the executor.
    pub fn is_pre_run(self) -> bool {
        matches!(self, Status::Analyzed | Status::Born)
    }

    /// Whether database GC may remove a pipeline in this status.
    pub fn can_delete(self) -> bool {
        self == Status::Analyzed || self.is_end()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Analyzed => "Analyzed",
            Status::Born => "Born",
            Status::Created => "Created",
            Status::Queue => "Queue",
            Status::Running => "Running",
            Status::Paused => "Paused",
            Status::Success => "Success",
            Status::Failed => "Failed",
            Status::Timeout => "Timeout",
            Status::StopByUser => "StopByUser",
            Status::AnalyzeFailed => "AnalyzeFailed",
            Status::DbError => "DBError",
            Status::NoNeedBySystem => "NoNeedBySystem",
            Status::Disabled => "Disabled",
            Status::Error => "Error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Status::ALL
            .iter()
            .copied()
            .find(|st| st.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| format!("invalid status: {trimmed}"))
    }
}
