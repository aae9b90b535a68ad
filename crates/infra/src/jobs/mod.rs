//! Job runners.
//!
//! ## Components
//!
//! - `JobRunner`: identity, status machine, progress, and lifecycle hooks
//! - `AsyncJob` + `run`: task lists run serially or with bounded concurrency, fail-fast
//! - `ClusterJob`: initiator/worker jobs built on the command service
//! - `register_cluster_job_handler`: worker-side dispatch of cluster job commands
//! - `JobRunStore`: optional persistence of job runs
//! - site, plugin, locale and maintenance jobs

pub mod async_runner;
pub mod cluster_runner;
pub mod locale;
pub mod maintenance;
pub mod plugin;
pub mod runner;
pub mod site;
pub mod store;
pub mod types;
pub mod worker;

pub use async_runner::{AsyncJob, Task, run, task};
pub use cluster_runner::{ClusterJob, ClusterJobRunner, ClusterJobSummary, JOB_ID_FIELD, SITE_FIELD};
pub use locale::{LOCALE_FIELD, LOCALE_UPDATE, LocaleService, LocaleUpdateJob, register_locale_handlers};
pub use maintenance::{
    MAINTENANCE_FIELD, MAINTENANCE_TOGGLE, MaintenanceService, MaintenanceToggleJob, register_maintenance_handlers,
};
pub use plugin::{PluginInstallJob, PluginService, PluginUninstallJob, register_plugin_handlers};
pub use runner::JobRunner;
pub use site::{SiteActivateJob, SiteDeactivateJob, SiteService, register_site_handlers};
pub use store::{InMemoryJobRunStore, JobRunStore, JobRunStoreError};
pub use types::{JobError, JobLogEntry, JobRole, JobRun, JobStatus};
pub use worker::{REPLY_RESULT_FIELD, register_cluster_job_handler};
