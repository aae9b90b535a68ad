//! Plugin installation and removal across the cluster.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use super::async_runner::{Task, task};
use super::cluster_runner::{ClusterJob, ClusterJobRunner};
use super::types::JobError;
use super::worker::register_cluster_job_handler;
use crate::command_service::CommandService;

pub const PLUGIN_INSTALL: &str = "plugin.install";
pub const PLUGIN_UNINSTALL: &str = "plugin.uninstall";

/// Payload field naming the plugin.
pub const PLUGIN_FIELD: &str = "plugin";

/// Local plugin operations on one member. `site` is `None` for cluster-wide plugins.
#[async_trait]
pub trait PluginService: Send + Sync {
    async fn install(&self, plugin: &str, site: Option<&str>) -> anyhow::Result<()>;
    async fn uninstall(&self, plugin: &str, site: Option<&str>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PluginAction {
    Install,
    Uninstall,
}

impl PluginAction {
    fn command_type(self) -> &'static str {
        match self {
            PluginAction::Install => PLUGIN_INSTALL,
            PluginAction::Uninstall => PLUGIN_UNINSTALL,
        }
    }
}

/// Shared body of the install and uninstall jobs.
struct PluginJob {
    cluster: ClusterJobRunner,
    plugins: Arc<dyn PluginService>,
    plugin: String,
    action: PluginAction,
}

impl PluginJob {
    fn initiator_tasks(&self) -> Result<Vec<Task>, JobError> {
        self.cluster
            .base()
            .log(&format!("{} {} on all members", self.action.command_type(), self.plugin));

        let options = self
            .cluster
            .command_options()
            .field(PLUGIN_FIELD, self.plugin.clone());
        Ok(vec![
            self.cluster
                .create_command_task(self.action.command_type(), options),
        ])
    }

    fn worker_tasks(&self) -> Result<Vec<Task>, JobError> {
        let plugins = self.plugins.clone();
        let plugin = self.plugin.clone();
        let site = self.cluster.site().map(str::to_string);
        let action = self.action;

        Ok(vec![task(move || async move {
            match action {
                PluginAction::Install => plugins.install(&plugin, site.as_deref()).await?,
                PluginAction::Uninstall => plugins.uninstall(&plugin, site.as_deref()).await?,
            }
            Ok(JsonValue::Bool(true))
        })])
    }
}

fn plugin_job(
    cluster: ClusterJobRunner,
    plugins: Arc<dyn PluginService>,
    plugin: impl Into<String>,
    action: PluginAction,
) -> Result<PluginJob, JobError> {
    let plugin = plugin.into();
    if plugin.trim().is_empty() {
        return Err(JobError::Invalid("plugin name must not be empty".to_string()));
    }
    Ok(PluginJob {
        cluster,
        plugins,
        plugin,
        action,
    })
}

pub struct PluginInstallJob(PluginJob);

impl PluginInstallJob {
    pub fn new(
        cluster: ClusterJobRunner,
        plugins: Arc<dyn PluginService>,
        plugin: impl Into<String>,
    ) -> Result<Self, JobError> {
        plugin_job(cluster, plugins, plugin, PluginAction::Install).map(Self)
    }

    pub fn plugin(&self) -> &str {
        &self.0.plugin
    }
}

#[async_trait]
impl ClusterJob for PluginInstallJob {
    fn cluster(&self) -> &ClusterJobRunner {
        &self.0.cluster
    }

    async fn get_initiator_tasks(&self) -> Result<Vec<Task>, JobError> {
        self.0.initiator_tasks()
    }

    async fn get_worker_tasks(&self) -> Result<Vec<Task>, JobError> {
        self.0.worker_tasks()
    }
}

pub struct PluginUninstallJob(PluginJob);

impl PluginUninstallJob {
    pub fn new(
        cluster: ClusterJobRunner,
        plugins: Arc<dyn PluginService>,
        plugin: impl Into<String>,
    ) -> Result<Self, JobError> {
        plugin_job(cluster, plugins, plugin, PluginAction::Uninstall).map(Self)
    }

    pub fn plugin(&self) -> &str {
        &self.0.plugin
    }
}

#[async_trait]
impl ClusterJob for PluginUninstallJob {
    fn cluster(&self) -> &ClusterJobRunner {
        &self.0.cluster
    }

    async fn get_initiator_tasks(&self) -> Result<Vec<Task>, JobError> {
        self.0.initiator_tasks()
    }

    async fn get_worker_tasks(&self) -> Result<Vec<Task>, JobError> {
        self.0.worker_tasks()
    }
}

/// Register the worker side of both plugin jobs on `service`.
pub fn register_plugin_handlers(service: &CommandService, plugins: Arc<dyn PluginService>) {
    let install = plugins.clone();
    register_cluster_job_handler(service, PLUGIN_INSTALL, move |runner, command| {
        let plugin = command.get_str(PLUGIN_FIELD).unwrap_or_default();
        PluginInstallJob::new(runner, install.clone(), plugin)
    });
    register_cluster_job_handler(service, PLUGIN_UNINSTALL, move |runner, command| {
        let plugin = command.get_str(PLUGIN_FIELD).unwrap_or_default();
        PluginUninstallJob::new(runner, plugins.clone(), plugin)
    });
}
