//! Site activation and deactivation across the cluster.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use super::async_runner::{Task, task};
use super::cluster_runner::{ClusterJob, ClusterJobRunner};
use super::types::JobError;
use super::worker::register_cluster_job_handler;
use crate::command_service::CommandService;

pub const SITE_ACTIVATE: &str = "site.activate";
pub const SITE_DEACTIVATE: &str = "site.deactivate";

/// Local site operations on one member.
#[async_trait]
pub trait SiteService: Send + Sync {
    async fn activate(&self, site: &str) -> anyhow::Result<()>;
    async fn deactivate(&self, site: &str) -> anyhow::Result<()>;
}

pub struct SiteActivateJob {
    cluster: ClusterJobRunner,
    sites: Arc<dyn SiteService>,
}

impl SiteActivateJob {
    pub fn new(cluster: ClusterJobRunner, sites: Arc<dyn SiteService>) -> Self {
        Self { cluster, sites }
    }
}

#[async_trait]
impl ClusterJob for SiteActivateJob {
    fn cluster(&self) -> &ClusterJobRunner {
        &self.cluster
    }

    async fn get_initiator_tasks(&self) -> Result<Vec<Task>, JobError> {
        let site = self.cluster.require_site()?;
        self.cluster.base().log(&format!("activating site {site} on all members"));
        Ok(vec![
            self.cluster
                .create_command_task(SITE_ACTIVATE, self.cluster.command_options()),
        ])
    }

    async fn get_worker_tasks(&self) -> Result<Vec<Task>, JobError> {
        let site = self.cluster.require_site()?;
        let sites = self.sites.clone();
        Ok(vec![task(move || async move {
            sites.activate(&site).await?;
            Ok(JsonValue::Bool(true))
        })])
    }
}

pub struct SiteDeactivateJob {
    cluster: ClusterJobRunner,
    sites: Arc<dyn SiteService>,
}

impl SiteDeactivateJob {
    pub fn new(cluster: ClusterJobRunner, sites: Arc<dyn SiteService>) -> Self {
        Self { cluster, sites }
    }
}

#[async_trait]
impl ClusterJob for SiteDeactivateJob {
    fn cluster(&self) -> &ClusterJobRunner {
        &self.cluster
    }

    async fn get_initiator_tasks(&self) -> Result<Vec<Task>, JobError> {
        let site = self.cluster.require_site()?;
        self.cluster.base().log(&format!("deactivating site {site} on all members"));
        Ok(vec![
            self.cluster
                .create_command_task(SITE_DEACTIVATE, self.cluster.command_options()),
        ])
    }

    async fn get_worker_tasks(&self) -> Result<Vec<Task>, JobError> {
        let site = self.cluster.require_site()?;
        let sites = self.sites.clone();
        Ok(vec![task(move || async move {
            sites.deactivate(&site).await?;
            Ok(JsonValue::Bool(true))
        })])
    }
}

/// Register the worker side of both site jobs on `service`.
pub fn register_site_handlers(service: &CommandService, sites: Arc<dyn SiteService>) {
    let activate = sites.clone();
    register_cluster_job_handler(service, SITE_ACTIVATE, move |runner, _| {
        Ok(SiteActivateJob::new(runner, activate.clone()))
    });
    register_cluster_job_handler(service, SITE_DEACTIVATE, move |runner, _| {
        Ok(SiteDeactivateJob::new(runner, sites.clone()))
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
    use crate::jobs::store::{InMemoryJobRunStore, JobRunStore};
    use crate::jobs::types::JobStatus;
    use clustercmd_core::MemberId;
    use clustercmd_events::InMemoryCommandBroker;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingSites {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SiteService for RecordingSites {
        async fn activate(&self, site: &str) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("activate {site}"));
            Ok(())
        }

        async fn deactivate(&self, site: &str) -> anyhow::Result<()> {
            anyhow::bail!("site {site} is pinned")
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
    async fn activation_runs_on_every_member() {
        let service = single_member().await;
        let sites = Arc::new(RecordingSites::default());
        register_site_handlers(&service, sites.clone());

        let store = InMemoryJobRunStore::arc();
        let job = SiteActivateJob::new(
            ClusterJobRunner::new(JobRunner::new(SITE_ACTIVATE).with_store(store.clone()), service)
                .with_site("blog"),
            sites.clone(),
        );

        let summary = run(&job).await.unwrap();
        assert_eq!(summary["success"], json!(true));
        assert_eq!(summary["site"], json!("blog"));
        assert_eq!(sites.calls.lock().unwrap().clone(), vec!["activate blog"]);

        let record = store.get(job.cluster().id()).unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn worker_failure_fails_initiator() {
        let service = single_member().await;
        register_site_handlers(&service, Arc::new(RecordingSites::default()));

        let job = SiteDeactivateJob::new(
            ClusterJobRunner::new(JobRunner::new(SITE_DEACTIVATE), service).with_site("blog"),
            Arc::new(RecordingSites::default()),
        );

        match run(&job).await.unwrap_err() {
            JobError::MemberFailed { command_type, summary } => {
                assert_eq!(command_type, SITE_DEACTIVATE);
                assert!(summary.contains("pinned"));
            }
            other => panic!("expected member failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn worker_without_site_replies_with_error() {
        let service = single_member().await;
        register_site_handlers(&service, Arc::new(RecordingSites::default()));

        let reply = service
            .send_command_get_response(SITE_ACTIVATE, CommandOptions::new().to(service.me().clone()))
            .await
            .unwrap();
        assert_eq!(reply.get("result"), Some(&json!(false)));
        assert!(reply.get_str("error").unwrap().contains("needs a site"));
    }
}
