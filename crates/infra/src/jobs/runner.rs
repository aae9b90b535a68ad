//! Shared state of every job runner: identity, status machine, progress, and the
//! optional job-run store the lifecycle hooks write to.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use clustercmd_core::JobId;

use super::store::JobRunStore;
use super::types::{JobError, JobRun, JobStatus};

#[derive(Debug)]
struct RunState {
    status: JobStatus,
    progress: f64,
}

pub struct JobRunner {
    id: JobId,
    name: String,
    parallel_limit: usize,
    state: Mutex<RunState>,
    store: Option<Arc<dyn JobRunStore>>,
}

impl JobRunner {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            parallel_limit: 1,
            state: Mutex::new(RunState {
                status: JobStatus::NotStarted,
                progress: 0.0,
            }),
            store: None,
        }
    }

    /// Reuse an existing id, e.g. the initiator's id on a worker.
    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    pub fn with_parallel_limit(mut self, limit: usize) -> Self {
        self.set_parallel_limit(limit);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn JobRunStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> Option<&Arc<dyn JobRunStore>> {
        self.store.as_ref()
    }

    /// Maximum tasks in flight; `1` runs them strictly in order.
    pub fn parallel_limit(&self) -> usize {
        self.parallel_limit
    }

    pub fn set_parallel_limit(&mut self, limit: usize) {
        self.parallel_limit = limit.max(1);
    }

    pub fn status(&self) -> JobStatus {
        self.state().status
    }

    pub fn progress(&self) -> f64 {
        self.state().progress
    }

    /// Log a line against this run.
    pub fn log(&self, message: &str) {
        info!(job_id = %self.id, job = %self.name, "{message}");
        if let Some(store) = &self.store {
            if let Err(e) = store.append_log(self.id, message) {
                debug!(job_id = %self.id, error = %e, "job log not persisted");
            }
        }
    }

    /// Record the start of the whole operation.
    pub fn on_start(&self) {
        info!(job_id = %self.id, job = %self.name, "job started");
        if let Some(store) = &self.store {
            if let Err(e) = store.start(JobRun::started(self.id, self.name.clone())) {
                warn!(job_id = %self.id, error = %e, "job run not recorded");
            }
        }
    }

    /// Advance progress by `increment` percent.
    pub fn on_update(&self, increment: f64) {
        let progress = {
            let mut state = self.state();
            state.progress = (state.progress + increment).clamp(0.0, 100.0);
            state.progress
        };
        debug!(job_id = %self.id, progress, "job progress");

        if let Some(store) = &self.store {
            if let Err(e) = store.add_progress(self.id, increment) {
                debug!(job_id = %self.id, error = %e, "job progress not persisted");
            }
        }
    }

    /// Record the end of the whole operation.
    pub fn on_completed(&self, err: Option<&JobError>) {
        match err {
            None => info!(job_id = %self.id, job = %self.name, "job completed"),
            Some(e) => warn!(job_id = %self.id, job = %self.name, error = %e, "job failed"),
        }

        if let Some(store) = &self.store {
            let status = if err.is_some() {
                JobStatus::Failed
            } else {
                JobStatus::Completed
            };
            if let Err(e) = store.finish(self.id, status, err.map(ToString::to_string)) {
                warn!(job_id = %self.id, error = %e, "job outcome not recorded");
            }
        }
    }

    /// `NotStarted -> Running`. A runner is single-use.
    pub(crate) fn begin(&self) -> Result<(), JobError> {
        let mut state = self.state();
        if state.status != JobStatus::NotStarted {
            return Err(JobError::AlreadyStarted(self.id));
        }
        state.status = JobStatus::Running;
        Ok(())
    }

    /// `Running -> Completed | Failed`.
    pub(crate) fn finish(&self, failed: bool) {
        let mut state = self.state();
        state.status = if failed {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };
    }

    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl core::fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobRunner")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("parallel_limit", &self.parallel_limit)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobRunStore;

    #[test]
    fn parallel_limit_is_at_least_one() {
        let runner = JobRunner::new("job").with_parallel_limit(0);
        assert_eq!(runner.parallel_limit(), 1);
    }

    #[test]
    fn runner_is_single_use() {
        let runner = JobRunner::new("job");
        runner.begin().unwrap();
        runner.finish(false);
        assert_eq!(runner.status(), JobStatus::Completed);
        assert!(matches!(runner.begin(), Err(JobError::AlreadyStarted(_))));
    }

    #[test]
    fn hooks_write_through_to_store() {
        let store = InMemoryJobRunStore::arc();
        let runner = JobRunner::new("site.activate").with_store(store.clone());

        runner.on_start();
        runner.on_update(25.0);
        runner.log("activating");
        runner.on_completed(None);

        let run = store.get(runner.id()).unwrap().unwrap();
        assert_eq!(run.status, JobStatus::Completed);
        assert_eq!(run.progress, 100.0);
        assert_eq!(run.logs[0].message, "activating");
        assert_eq!(runner.progress(), 25.0);
    }
}
