//! Core job types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use clustercmd_core::JobId;

use super::store::JobRunStoreError;
use crate::command_service::CommandError;

/// Job execution status.
///
/// `NotStarted -> Running -> Completed | Failed`; both end states are terminal and a
/// runner is never started twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    NotStarted,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// The part of an operation a job invocation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRole {
    /// Originates the operation and fans commands out to the cluster.
    Initiator,
    /// Performs the local portion in response to a command.
    Worker,
}

impl core::fmt::Display for JobRole {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            JobRole::Initiator => f.write_str("initiator"),
            JobRole::Worker => f.write_str("worker"),
        }
    }
}

/// A log line attached to a job run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Persisted record of one job run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    /// Percent complete, `0.0..=100.0`.
    pub progress: f64,
    pub logs: Vec<JobLogEntry>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRun {
    /// A run that has just started.
    pub fn started(id: JobId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            status: JobStatus::Running,
            progress: 0.0,
            logs: Vec::new(),
            error: None,
            started_at: Some(Utc::now()),
            finished_at: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("task failed: {0}")]
    Task(String),

    /// A task or hook panicked; the panic was stopped at the runner.
    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("job {job:?} cannot run as {role}")]
    RoleNotSupported { job: String, role: JobRole },

    #[error("job {0} was already started")]
    AlreadyStarted(JobId),

    #[error("invalid job: {0}")]
    Invalid(String),

    /// At least one cluster member reported failure for a fanned-out command.
    #[error("command {command_type:?} failed on cluster members: {summary}")]
    MemberFailed { command_type: String, summary: String },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Store(#[from] JobRunStoreError),
}

impl JobError {
    pub fn task(msg: impl Into<String>) -> Self {
        Self::Task(msg.into())
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        Self::Task(format!("{err:#}"))
    }
}
