//! Job-run persistence.
//!
//! Runners write through this boundary when one is attached; without it they only log.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;

use clustercmd_core::JobId;

use super::types::{JobLogEntry, JobRun, JobStatus};

pub trait JobRunStore: Send + Sync {
    /// Insert (or replace) a run record.
    fn start(&self, run: JobRun) -> Result<(), JobRunStoreError>;

    fn get(&self, id: JobId) -> Result<Option<JobRun>, JobRunStoreError>;

    /// Add to the run's progress (capped at 100) and return the new value.
    fn add_progress(&self, id: JobId, increment: f64) -> Result<f64, JobRunStoreError>;

    fn append_log(&self, id: JobId, message: &str) -> Result<(), JobRunStoreError>;

    /// Mark the run terminal.
    fn finish(&self, id: JobId, status: JobStatus, error: Option<String>) -> Result<(), JobRunStoreError>;

    /// All runs, most recently started first.
    fn list(&self) -> Result<Vec<JobRun>, JobRunStoreError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum JobRunStoreError {
    #[error("job run not found: {0}")]
    NotFound(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// In-memory job-run store (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryJobRunStore {
    runs: RwLock<HashMap<JobId, JobRun>>,
}

impl InMemoryJobRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn with_run<T>(
        &self,
        id: JobId,
        f: impl FnOnce(&mut JobRun) -> T,
    ) -> Result<T, JobRunStoreError> {
        let mut runs = self
            .runs
            .write()
            .map_err(|_| JobRunStoreError::Storage("lock poisoned".to_string()))?;
        let run = runs.get_mut(&id).ok_or(JobRunStoreError::NotFound(id))?;
        Ok(f(run))
    }
}

impl JobRunStore for InMemoryJobRunStore {
    fn start(&self, run: JobRun) -> Result<(), JobRunStoreError> {
        let mut runs = self
            .runs
            .write()
            .map_err(|_| JobRunStoreError::Storage("lock poisoned".to_string()))?;
        runs.insert(run.id, run);
        Ok(())
    }

    fn get(&self, id: JobId) -> Result<Option<JobRun>, JobRunStoreError> {
        let runs = self
            .runs
            .read()
            .map_err(|_| JobRunStoreError::Storage("lock poisoned".to_string()))?;
        Ok(runs.get(&id).cloned())
    }

    fn add_progress(&self, id: JobId, increment: f64) -> Result<f64, JobRunStoreError> {
        self.with_run(id, |run| {
            run.progress = (run.progress + increment).clamp(0.0, 100.0);
            run.progress
        })
    }

    fn append_log(&self, id: JobId, message: &str) -> Result<(), JobRunStoreError> {
        self.with_run(id, |run| {
            run.logs.push(JobLogEntry {
                at: Utc::now(),
                message: message.to_string(),
            })
        })
    }

    fn finish(&self, id: JobId, status: JobStatus, error: Option<String>) -> Result<(), JobRunStoreError> {
        self.with_run(id, |run| {
            run.status = status;
            run.error = error;
            run.finished_at = Some(Utc::now());
            if status == JobStatus::Completed {
                run.progress = 100.0;
            }
        })
    }

    fn list(&self) -> Result<Vec<JobRun>, JobRunStoreError> {
        let runs = self
            .runs
            .read()
            .map_err(|_| JobRunStoreError::Storage("lock poisoned".to_string()))?;
        let mut all: Vec<JobRun> = runs.values().cloned().collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_capped() {
        let store = InMemoryJobRunStore::new();
        let id = JobId::new();
        store.start(JobRun::started(id, "site.activate")).unwrap();

        assert_eq!(store.add_progress(id, 60.0).unwrap(), 60.0);
        assert_eq!(store.add_progress(id, 60.0).unwrap(), 100.0);
    }

    #[test]
    fn finish_records_outcome() {
        let store = InMemoryJobRunStore::new();
        let id = JobId::new();
        store.start(JobRun::started(id, "plugin.install")).unwrap();
        store.append_log(id, "installing").unwrap();
        store
            .finish(id, JobStatus::Failed, Some("boom".to_string()))
            .unwrap();

        let run = store.get(id).unwrap().unwrap();
        assert_eq!(run.status, JobStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("boom"));
        assert_eq!(run.logs.len(), 1);
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn unknown_run_is_not_found() {
        let store = InMemoryJobRunStore::new();
        assert!(matches!(
            store.add_progress(JobId::new(), 1.0),
            Err(JobRunStoreError::NotFound(_))
        ));
    }
}
