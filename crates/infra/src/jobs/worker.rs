//! Worker-side dispatch of cluster jobs.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use clustercmd_core::JobId;
use clustercmd_events::Command;

use super::async_runner::run;
use super::cluster_runner::{ClusterJob, ClusterJobRunner, JOB_ID_FIELD, SITE_FIELD};
use super::runner::JobRunner;
use super::types::JobError;
use crate::command_service::{CommandHandler, CommandService, REPLY_ERROR_FIELD, Reply, command_handler};

/// Reply field carrying whether the worker run succeeded.
pub const REPLY_RESULT_FIELD: &str = "result";

/// Run a worker job for every `command_type` command this member receives, and reply
/// with `{"error": <string|null>, "result": <bool>}`.
///
/// `factory` gets a worker runner that already carries the initiator's job id and the
/// command's site. Returns the registered handler (for later unregistration).
pub fn register_cluster_job_handler<J, F>(
    service: &CommandService,
    command_type: &str,
    factory: F,
) -> CommandHandler
where
    J: ClusterJob + 'static,
    F: Fn(ClusterJobRunner, &Command) -> Result<J, JobError> + Send + Sync + 'static,
{
    let factory = Arc::new(factory);
    let name = command_type.to_string();

    let handler = command_handler(move |service: Arc<CommandService>, command: Command| {
        let factory = factory.clone();
        let name = name.clone();
        async move {
            let outcome = run_worker(&service, &name, &command, factory.as_ref()).await;

            let reply = match &outcome {
                Ok(_) => Reply::new()
                    .with_field(REPLY_ERROR_FIELD, JsonValue::Null)
                    .with_field(REPLY_RESULT_FIELD, true),
                Err(e) => {
                    warn!(command_id = %command.id, job = %name, error = %e, "worker job failed");
                    Reply::new()
                        .with_field(REPLY_ERROR_FIELD, e.to_string())
                        .with_field(REPLY_RESULT_FIELD, false)
                }
            };

            service.send_in_response_to(&command, reply).await?;
            Ok(())
        }
    });

    service.register_for_type(command_type, handler.clone());
    handler
}

async fn run_worker<J, F>(
    service: &Arc<CommandService>,
    name: &str,
    command: &Command,
    factory: &F,
) -> Result<JsonValue, JobError>
where
    J: ClusterJob + 'static,
    F: Fn(ClusterJobRunner, &Command) -> Result<J, JobError>,
{
    let mut base = JobRunner::new(name);
    if let Some(raw) = command.get_str(JOB_ID_FIELD) {
        let id: JobId = raw
            .parse()
            .map_err(|e| JobError::Invalid(format!("bad {JOB_ID_FIELD}: {e}")))?;
        base = base.with_id(id);
    }

    let mut runner = ClusterJobRunner::new(base, service.clone()).as_worker();
    runner.set_site(command.get_str(SITE_FIELD).map(str::to_string));

    let job = factory(runner, command)?;
    debug!(job_id = %job.cluster().id(), job = %name, "running worker job");
    run(&job).await
}

