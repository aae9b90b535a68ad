//! Locale table refresh across the cluster.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use super::async_runner::{Task, task};
use super::cluster_runner::{ClusterJob, ClusterJobRunner};
use super::types::JobError;
use super::worker::register_cluster_job_handler;
use crate::command_service::CommandService;

pub const LOCALE_UPDATE: &str = "locale.update";

/// Payload field naming the locale, e.g. `"de-DE"`.
pub const LOCALE_FIELD: &str = "locale";

/// Reloads translation tables on one member. `site` is `None` for the shared tables.
#[async_trait]
pub trait LocaleService: Send + Sync {
    async fn reload(&self, locale: &str, site: Option<&str>) -> anyhow::Result<()>;
}

pub struct LocaleUpdateJob {
    cluster: ClusterJobRunner,
    locales: Arc<dyn LocaleService>,
    locale: String,
}

impl LocaleUpdateJob {
    pub fn new(
        cluster: ClusterJobRunner,
        locales: Arc<dyn LocaleService>,
        locale: impl Into<String>,
    ) -> Result<Self, JobError> {
        let locale = locale.into();
        if locale.trim().is_empty() {
            return Err(JobError::Invalid("locale must not be empty".to_string()));
        }
        Ok(Self {
            cluster,
            locales,
            locale,
        })
    }

    pub fn locale(&self) -> &str {
        &self.locale
    }
}

#[async_trait]
impl ClusterJob for LocaleUpdateJob {
    fn cluster(&self) -> &ClusterJobRunner {
        &self.cluster
    }

    async fn get_initiator_tasks(&self) -> Result<Vec<Task>, JobError> {
        self.cluster
            .base()
            .log(&format!("reloading locale {} on all members", self.locale));
        let options = self
            .cluster
            .command_options()
            .field(LOCALE_FIELD, self.locale.clone());
        Ok(vec![self.cluster.create_command_task(LOCALE_UPDATE, options)])
    }

    async fn get_worker_tasks(&self) -> Result<Vec<Task>, JobError> {
        let locales = self.locales.clone();
        let locale = self.locale.clone();
        let site = self.cluster.site().map(str::to_string);
        Ok(vec![task(move || async move {
            locales.reload(&locale, site.as_deref()).await?;
            Ok(JsonValue::Bool(true))
        })])
    }
}

pub fn register_locale_handlers(service: &CommandService, locales: Arc<dyn LocaleService>) {
    register_cluster_job_handler(service, LOCALE_UPDATE, move |runner, command| {
        let locale = command.get_str(LOCALE_FIELD).unwrap_or_default();
        LocaleUpdateJob::new(runner, locales.clone(), locale)
    });
}
