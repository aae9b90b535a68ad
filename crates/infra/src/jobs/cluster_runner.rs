//! Jobs that span the cluster.
//!
//! The same job type runs in two roles. The initiator fans a command out to every
//! member (itself included) and waits for all of them; each member's worker handler
//! then runs the job as a worker to do the local part.
//!
//! Jobs can be nested: an outer job may run an inner one as a slice of its own work by
//! giving it a `chunk_of_work_percentage` below 1. Only the outermost initiator fires
//! the `on_start`/`on_completed` lifecycle hooks.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::warn;

use clustercmd_core::JobId;

use super::async_runner::{AsyncJob, Task, task};
use super::runner::JobRunner;
use super::types::{JobError, JobRole};
use crate::command_service::{CommandOptions, CommandService};

/// Payload field carrying the initiator's job id.
pub const JOB_ID_FIELD: &str = "jobId";

/// Payload field carrying the target site.
pub const SITE_FIELD: &str = "site";

/// Default outcome of an initiator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterJobSummary {
    pub success: bool,
    pub id: JobId,
    pub site: Option<String>,
    pub error: Option<String>,
    pub results: Vec<JsonValue>,
}

pub struct ClusterJobRunner {
    base: JobRunner,
    commands: Arc<CommandService>,
    is_initiator: bool,
    chunk_of_work_percentage: f64,
    site: Option<String>,
}

impl ClusterJobRunner {
    /// An outermost initiator.
    pub fn new(base: JobRunner, commands: Arc<CommandService>) -> Self {
        Self {
            base,
            commands,
            is_initiator: true,
            chunk_of_work_percentage: 1.0,
            site: None,
        }
    }

    pub fn as_worker(mut self) -> Self {
        self.is_initiator = false;
        self
    }

    pub fn with_site(mut self, site: impl Into<String>) -> Self {
        self.site = Some(site.into());
        self
    }

    pub fn with_chunk_of_work_percentage(mut self, share: f64) -> Result<Self, JobError> {
        self.set_chunk_of_work_percentage(share)?;
        Ok(self)
    }

    pub fn base(&self) -> &JobRunner {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut JobRunner {
        &mut self.base
    }

    pub fn commands(&self) -> &Arc<CommandService> {
        &self.commands
    }

    pub fn id(&self) -> JobId {
        self.base.id()
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn role(&self) -> JobRole {
        if self.is_initiator {
            JobRole::Initiator
        } else {
            JobRole::Worker
        }
    }

    pub fn set_run_as_initiator(&mut self, is_initiator: bool) {
        self.is_initiator = is_initiator;
    }

    pub fn chunk_of_work_percentage(&self) -> f64 {
        self.chunk_of_work_percentage
    }

    /// Must lie in `(0, 1]`.
    pub fn set_chunk_of_work_percentage(&mut self, share: f64) -> Result<(), JobError> {
        if !(share > 0.0 && share <= 1.0) {
            return Err(JobError::Invalid(format!(
                "chunk of work percentage must be in (0, 1], got {share}"
            )));
        }
        self.chunk_of_work_percentage = share;
        Ok(())
    }

    pub fn site(&self) -> Option<&str> {
        self.site.as_deref()
    }

    pub fn set_site(&mut self, site: Option<String>) {
        self.site = site;
    }

    pub fn require_site(&self) -> Result<String, JobError> {
        self.site
            .clone()
            .ok_or_else(|| JobError::Invalid(format!("job {:?} needs a site", self.base.name())))
    }

    /// The outermost invocation of an operation: an initiator owning all of the work.
    pub fn is_outermost(&self) -> bool {
        self.is_initiator && self.chunk_of_work_percentage == 1.0
    }

    /// Options pre-filled with this job's id and site, for commands to workers.
    pub fn command_options(&self) -> CommandOptions {
        let options = CommandOptions::new().field(JOB_ID_FIELD, self.id().to_string());
        match &self.site {
            Some(site) => options.field(SITE_FIELD, site.clone()),
            None => options,
        }
    }

    /// A task that sends `command_type` to every member and fails if any member does.
    pub fn create_command_task(&self, command_type: impl Into<String>, options: CommandOptions) -> Task {
        let commands = self.commands.clone();
        let command_type = command_type.into();

        task(move || async move {
            let responses = commands
                .send_command_to_all_get_responses(&command_type, options)
                .await?;

            let failures: Vec<String> = responses
                .iter()
                .filter_map(|r| r.err.as_ref().map(|err| format!("{}: {err}", r.member)))
                .collect();
            if !failures.is_empty() {
                return Err(JobError::MemberFailed {
                    command_type,
                    summary: failures.join("; "),
                });
            }

            Ok(JsonValue::Bool(true))
        })
    }

    /// Summarize initiator task results. Falsy results count as failures.
    pub fn summarize(&self, outcome: &Result<Vec<JsonValue>, JobError>) -> ClusterJobSummary {
        let (results, error) = match outcome {
            Ok(results) => {
                let failed = results.iter().filter(|r| is_falsy(r)).count();
                let error = (failed > 0).then(|| format!("{failed} task(s) reported failure"));
                (results.clone(), error)
            }
            Err(e) => (Vec::new(), Some(e.to_string())),
        };

        ClusterJobSummary {
            success: error.is_none(),
            id: self.id(),
            site: self.site.clone(),
            error,
            results,
        }
    }
}

impl core::fmt::Debug for ClusterJobRunner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ClusterJobRunner")
            .field("base", &self.base)
            .field("is_initiator", &self.is_initiator)
            .field("chunk_of_work_percentage", &self.chunk_of_work_percentage)
            .field("site", &self.site)
            .finish()
    }
}

fn is_falsy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::Bool(b) => !b,
        JsonValue::Object(map) => map.get("error").is_some_and(|e| !e.is_null()),
        _ => false,
    }
}

/// A job that runs as initiator or worker.
///
/// Implement the task list for each role the job supports; the other role fails with
/// [`JobError::RoleNotSupported`].
#[async_trait]
pub trait ClusterJob: Send + Sync {
    fn cluster(&self) -> &ClusterJobRunner;

    async fn get_initiator_tasks(&self) -> Result<Vec<Task>, JobError> {
        Err(JobError::RoleNotSupported {
            job: self.cluster().base().name().to_string(),
            role: JobRole::Initiator,
        })
    }

    async fn get_worker_tasks(&self) -> Result<Vec<Task>, JobError> {
        Err(JobError::RoleNotSupported {
            job: self.cluster().base().name().to_string(),
            role: JobRole::Worker,
        })
    }

    /// Fold per-member results into a [`ClusterJobSummary`]; an unsuccessful summary is an error.
    async fn process_cluster_results(
        &self,
        outcome: Result<Vec<JsonValue>, JobError>,
    ) -> Result<JsonValue, JobError> {
        let summary = self.cluster().summarize(&outcome);
        if summary.success {
            return serde_json::to_value(&summary).map_err(|e| JobError::task(e.to_string()));
        }

        warn!(job_id = %summary.id, site = ?summary.site, error = ?summary.error, "cluster job failed");
        match outcome {
            Err(e) => Err(e),
            Ok(_) => Err(JobError::Task(summary.error.unwrap_or_default())),
        }
    }

    async fn process_worker_results(
        &self,
        outcome: Result<Vec<JsonValue>, JobError>,
    ) -> Result<JsonValue, JobError> {
        outcome.map(JsonValue::Array)
    }

    async fn on_start(&self) -> Result<(), JobError> {
        self.cluster().base().on_start();
        Ok(())
    }

    async fn on_completed(&self, err: Option<&JobError>) {
        self.cluster().base().on_completed(err);
    }
}

#[async_trait]
impl<T> AsyncJob for T
where
    T: ClusterJob,
{
    fn runner(&self) -> &JobRunner {
        self.cluster().base()
    }

    fn progress_share(&self) -> f64 {
        self.cluster().chunk_of_work_percentage()
    }

    async fn get_tasks(&self) -> Result<Vec<Task>, JobError> {
        if self.cluster().is_initiator() {
            self.get_initiator_tasks().await
        } else {
            self.get_worker_tasks().await
        }
    }

    async fn on_before_first_task(&self) -> Result<(), JobError> {
        if self.cluster().is_outermost() {
            self.on_start().await?;
        }
        Ok(())
    }

    async fn process_results(
        &self,
        outcome: Result<Vec<JsonValue>, JobError>,
    ) -> Result<JsonValue, JobError> {
        let result = if self.cluster().is_initiator() {
            self.process_cluster_results(outcome).await
        } else {
            self.process_worker_results(outcome).await
        };

        if self.cluster().is_outermost() {
            self.on_completed(result.as_ref().err()).await;
        }
        result
    }
}
