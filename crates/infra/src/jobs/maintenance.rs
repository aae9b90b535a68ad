//! Maintenance mode toggle across the cluster.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use super::async_runner::{Task, task};
use super::cluster_runner::{ClusterJob, ClusterJobRunner};
use super::types::JobError;
use super::worker::register_cluster_job_handler;
use crate::command_service::CommandService;

pub const MAINTENANCE_TOGGLE: &str = "maintenance.toggle";

/// Payload field carrying the requested state as a JSON bool.
pub const MAINTENANCE_FIELD: &str = "enabled";

#[async_trait]
pub trait MaintenanceService: Send + Sync {
    /// Enter or leave maintenance mode for `site`, or for the whole member when `None`.
    async fn set_maintenance(&self, enabled: bool, site: Option<&str>) -> anyhow::Result<()>;
}

pub struct MaintenanceToggleJob {
    cluster: ClusterJobRunner,
    maintenance: Arc<dyn MaintenanceService>,
    enabled: bool,
}

impl MaintenanceToggleJob {
    pub fn new(cluster: ClusterJobRunner, maintenance: Arc<dyn MaintenanceService>, enabled: bool) -> Self {
        Self {
            cluster,
            maintenance,
            enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

#[async_trait]
impl ClusterJob for MaintenanceToggleJob {
    fn cluster(&self) -> &ClusterJobRunner {
        &self.cluster
    }

    async fn get_initiator_tasks(&self) -> Result<Vec<Task>, JobError> {
        let state = if self.enabled { "on" } else { "off" };
        self.cluster
            .base()
            .log(&format!("turning maintenance {state} on all members"));
        let options = self
            .cluster
            .command_options()
            .field(MAINTENANCE_FIELD, self.enabled);
        Ok(vec![self.cluster.create_command_task(MAINTENANCE_TOGGLE, options)])
    }

    async fn get_worker_tasks(&self) -> Result<Vec<Task>, JobError> {
        let maintenance = self.maintenance.clone();
        let enabled = self.enabled;
        let site = self.cluster.site().map(str::to_string);
        Ok(vec![task(move || async move {
            maintenance.set_maintenance(enabled, site.as_deref()).await?;
            Ok(JsonValue::Bool(true))
        })])
    }
}

/// The requested state must be explicit; a missing flag is not read as "off".
pub fn register_maintenance_handlers(service: &CommandService, maintenance: Arc<dyn MaintenanceService>) {
    register_cluster_job_handler(service, MAINTENANCE_TOGGLE, move |runner, command| {
        let enabled = command
            .get(MAINTENANCE_FIELD)
            .and_then(JsonValue::as_bool)
            .ok_or_else(|| JobError::Invalid(format!("{MAINTENANCE_TOGGLE} needs a boolean `{MAINTENANCE_FIELD}`")))?;
        Ok(MaintenanceToggleJob::new(runner, maintenance.clone(), enabled))
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::cluster::StaticClusterRegistry;
    use crate::command_service::CommandOptions;
    use crate::jobs::async_runner::run;
    use crate::jobs::runner::JobRunner;
    use clustercmd_core::MemberId;
    use clustercmd_events::InMemoryCommandBroker;
    use serde_json::json;

    #[derive(Default)]
    struct Switch {
        states: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl MaintenanceService for Switch {
        async fn set_maintenance(&self, enabled: bool, _site: Option<&str>) -> anyhow::Result<()> {
            self.states.lock().unwrap().push(enabled);
            Ok(())
        }
    }

    async fn single_member() -> Arc<CommandService> {
        let me = MemberId::new("m1").unwrap();
        let service = CommandService::new(
            me.clone(),
            Arc::new(InMemoryCommandBroker::new()),
            Arc::new(StaticClusterRegistry::from_ids([me])),
            Some(Duration::from_secs(2)),
        );
        service.init().await.unwrap();
        service
    }

    #[tokio::test]
    async fn toggle_on_then_off() {
        let service = single_member().await;
        let switch = Arc::new(Switch::default());
        register_maintenance_handlers(&service, switch.clone());

        for enabled in [true, false] {
            let job = MaintenanceToggleJob::new(
                ClusterJobRunner::new(JobRunner::new(MAINTENANCE_TOGGLE), service.clone()),
                switch.clone(),
                enabled,
            );
            run(&job).await.unwrap();
        }

        assert_eq!(switch.states.lock().unwrap().clone(), vec![true, false]);
    }

    #[tokio::test]
    async fn missing_flag_is_rejected_by_worker() {
        let service = single_member().await;
        let switch = Arc::new(Switch::default());
        register_maintenance_handlers(&service, switch.clone());

        let reply = service
            .send_command_get_response(
                MAINTENANCE_TOGGLE,
                CommandOptions::new().to(service.me().clone()).field(MAINTENANCE_FIELD, "yes"),
            )
            .await
            .unwrap();

        assert_eq!(reply.get("result"), Some(&json!(false)));
        assert!(reply.get_str("error").unwrap().contains("needs a boolean"));
        assert!(switch.states.lock().unwrap().is_empty());
    }
}
