//! Task-list job execution.
//!
//! A job supplies a list of tasks; [`run`] executes them serially or with bounded
//! concurrency, stops at the first failure, and hands the outcome to the job's
//! `process_results`. Panics in tasks and hooks are caught and become
//! [`JobError::Panicked`].

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{StreamExt, stream};
use serde_json::Value as JsonValue;
use tracing::{debug, instrument};

use super::runner::JobRunner;
use super::types::JobError;
use crate::fault::isolate;

/// One unit of work. Runs at most once.
pub type Task = Box<dyn FnOnce() -> BoxFuture<'static, Result<JsonValue, JobError>> + Send>;

/// Wrap an async closure as a [`Task`].
pub fn task<F, Fut>(f: F) -> Task
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<JsonValue, JobError>> + Send + 'static,
{
    Box::new(move || Box::pin(f()))
}

#[async_trait]
pub trait AsyncJob: Send + Sync {
    fn runner(&self) -> &JobRunner;

    /// Share of the overall operation this invocation represents, in `(0, 1]`.
    fn progress_share(&self) -> f64 {
        1.0
    }

    async fn get_tasks(&self) -> Result<Vec<Task>, JobError>;

    async fn on_before_first_task(&self) -> Result<(), JobError> {
        Ok(())
    }

    /// Post-process the task outcome; by default results are returned as an array.
    async fn process_results(
        &self,
        outcome: Result<Vec<JsonValue>, JobError>,
    ) -> Result<JsonValue, JobError> {
        outcome.map(JsonValue::Array)
    }
}

/// Run `job` to completion. Fails with [`JobError::AlreadyStarted`] on a second call.
#[instrument(skip(job), fields(job_id = %job.runner().id(), job = %job.runner().name()), err)]
pub async fn run<J>(job: &J) -> Result<JsonValue, JobError>
where
    J: AsyncJob + ?Sized,
{
    let runner = job.runner();
    runner.begin()?;

    let outcome = isolate(execute(job))
        .await
        .unwrap_or_else(|panic| Err(JobError::Panicked(panic)));

    let result = isolate(job.process_results(outcome))
        .await
        .unwrap_or_else(|panic| Err(JobError::Panicked(panic)));

    runner.finish(result.is_err());
    result
}

async fn execute<J>(job: &J) -> Result<Vec<JsonValue>, JobError>
where
    J: AsyncJob + ?Sized,
{
    let runner = job.runner();
    let tasks = job.get_tasks().await?;
    job.on_before_first_task().await?;

    let total = tasks.len();
    let limit = runner.parallel_limit();
    let increment = if total == 0 {
        0.0
    } else {
        100.0 / total as f64 * job.progress_share()
    };
    debug!(job_id = %runner.id(), total, limit, "running tasks");

    if limit <= 1 {
        let mut results = Vec::with_capacity(total);
        for task in tasks {
            results.push(run_task(task).await?);
            runner.on_update(increment);
        }
        return Ok(results);
    }

    // Boxed up front: a closure building the futures inside the stream trips the
    // higher-ranked `Send` check on `run`.
    let steps: Vec<BoxFuture<'_, (usize, Result<JsonValue, JobError>)>> = tasks
        .into_iter()
        .enumerate()
        .map(|(index, task)| Box::pin(step(index, task, runner, increment)) as BoxFuture<'_, _>)
        .collect();

    // Unordered so the first failure ends the run without waiting on slower earlier tasks.
    let mut in_flight = stream::iter(steps).buffer_unordered(limit);
    let mut results = Vec::with_capacity(total);
    while let Some((index, result)) = in_flight.next().await {
        results.push((index, result?));
    }
    results.sort_unstable_by_key(|(index, _)| *index);
    Ok(results.into_iter().map(|(_, value)| value).collect())
}

async fn step(
    index: usize,
    task: Task,
    runner: &JobRunner,
    increment: f64,
) -> (usize, Result<JsonValue, JobError>) {
    let result = run_task(task).await;
    if result.is_ok() {
        runner.on_update(increment);
    }
    (index, result)
}

async fn run_task(task: Task) -> Result<JsonValue, JobError> {
    isolate(async move { task().await })
        .await
        .unwrap_or_else(|panic| Err(JobError::Panicked(panic)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::jobs::types::JobStatus;
    use serde_json::json;

    /// Job whose tasks are built by a closure on each `get_tasks` call.
    struct ListJob {
        runner: JobRunner,
        build: Box<dyn Fn() -> Vec<Task> + Send + Sync>,
    }

    #[async_trait]
    impl AsyncJob for ListJob {
        fn runner(&self) -> &JobRunner {
            &self.runner
        }

        async fn get_tasks(&self) -> Result<Vec<Task>, JobError> {
            Ok((self.build)())
        }
    }

    fn counted(ran: &Arc<AtomicUsize>, value: JsonValue) -> Task {
        let ran = ran.clone();
        task(move || async move {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(value)
        })
    }

    #[tokio::test]
    async fn serial_run_stops_at_first_failure() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let job = ListJob {
            runner: JobRunner::new("serial"),
            build: Box::new(move || {
                vec![
                    counted(&counter, json!(1)),
                    task(|| async { Err(JobError::task("second failed")) }),
                    counted(&counter, json!(3)),
                ]
            }),
        };

        let err = run(&job).await.unwrap_err();
        assert!(matches!(err, JobError::Task(ref m) if m == "second failed"));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(job.runner().status(), JobStatus::Failed);
    }

    #[tokio::test]
    async fn parallel_run_keeps_task_order() {
        let job = ListJob {
            runner: JobRunner::new("parallel").with_parallel_limit(3),
            build: Box::new(|| {
                [30u64, 0, 15]
                    .into_iter()
                    .enumerate()
                    .map(|(i, delay)| {
                        task(move || async move {
                            tokio::time::sleep(Duration::from_millis(delay)).await;
                            Ok(json!(i))
                        })
                    })
                    .collect()
            }),
        };

        let results = run(&job).await.unwrap();
        assert_eq!(results, json!([0, 1, 2]));
        assert_eq!(job.runner().status(), JobStatus::Completed);
        assert_eq!(job.runner().progress(), 100.0);
    }

    #[tokio::test]
    async fn parallel_limit_bounds_concurrency() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (current, max) = (in_flight.clone(), peak.clone());

        let job = ListJob {
            runner: JobRunner::new("bounded").with_parallel_limit(2),
            build: Box::new(move || {
                (0..6)
                    .map(|_| {
                        let (current, max) = (current.clone(), max.clone());
                        task(move || async move {
                            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                            max.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            current.fetch_sub(1, Ordering::SeqCst);
                            Ok(JsonValue::Null)
                        })
                    })
                    .collect()
            }),
        };

        run(&job).await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn parallel_failure_does_not_wait_for_slower_tasks() {
        let later = Arc::new(AtomicUsize::new(0));
        let counter = later.clone();
        let job = ListJob {
            runner: JobRunner::new("fail-fast").with_parallel_limit(2),
            build: Box::new(move || {
                vec![
                    task(|| async {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        Ok(json!("slow"))
                    }),
                    task(|| async { Err(JobError::task("boom")) }),
                    counted(&counter, json!(3)),
                    counted(&counter, json!(4)),
                ]
            }),
        };

        let started = std::time::Instant::now();
        let err = run(&job).await.unwrap_err();
        assert!(matches!(err, JobError::Task(ref m) if m == "boom"));
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(later.load(Ordering::SeqCst), 0);
        assert_eq!(job.runner().status(), JobStatus::Failed);
    }

    #[tokio::test]
    async fn panicking_task_becomes_error() {
        let job = ListJob {
            runner: JobRunner::new("panics"),
            build: Box::new(|| {
                vec![task(|| async {
                    let items: Vec<JsonValue> = Vec::new();
                    Ok(items[3].clone())
                })]
            }),
        };

        let err = run(&job).await.unwrap_err();
        assert!(matches!(err, JobError::Panicked(_)));
        assert_eq!(job.runner().status(), JobStatus::Failed);
    }

    #[tokio::test]
    async fn runner_cannot_be_reused() {
        let job = ListJob {
            runner: JobRunner::new("once"),
            build: Box::new(Vec::new),
        };

        assert_eq!(run(&job).await.unwrap(), json!([]));
        assert!(matches!(run(&job).await, Err(JobError::AlreadyStarted(_))));
    }
}
