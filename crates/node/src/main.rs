//! Cluster node.
//!
//! Joins the command bus, answers `ping`, and serves the worker side of the site and
//! plugin, locale and maintenance jobs until interrupted. A broker that gives up on its subscription ends the
//! process with an error after the usual shutdown.
//!
//! Environment: the `CLUSTER_*` knobs, `CLUSTER_MEMBERS` (comma-separated member ids,
//! default this member only), `DATABASE_URL` for the tailing broker, and with the
//! `redis` feature `REDIS_URL` to use Redis pub/sub instead.

mod local;

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::mpsc;
use tracing::{info, warn};

use clustercmd_core::MemberId;
use clustercmd_events::{BrokerError, CommandBroker};
use clustercmd_infra::broker::{FatalErrorHandler, TailingCommandBroker, fatal_channel};
use clustercmd_infra::jobs::{
    register_locale_handlers, register_maintenance_handlers, register_plugin_handlers, register_site_handlers,
};
use clustercmd_infra::store::PostgresCappedStore;
use clustercmd_infra::{ClusterConfig, CommandService, Reply, StaticClusterRegistry, command_handler};

use local::{LocalLocales, LocalMaintenance, LocalPlugins, LocalSites};

/// The broker this node talks through.
enum Transport {
    Tailing(Arc<TailingCommandBroker<PostgresCappedStore>>),
    #[cfg(feature = "redis")]
    Redis(Arc<clustercmd_infra::broker::RedisCommandBroker>),
}

impl Transport {
    async fn connect(config: &ClusterConfig, on_fatal: FatalErrorHandler) -> anyhow::Result<Self> {
        if let Some(transport) = Self::redis(config, on_fatal.clone())? {
            return Ok(transport);
        }

        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await
            .context("connecting to postgres")?;

        let store = Arc::new(PostgresCappedStore::new(pool));
        Ok(Transport::Tailing(Arc::new(
            TailingCommandBroker::new(store, config.broker.clone()).with_fatal_handler(on_fatal),
        )))
    }

    #[cfg(feature = "redis")]
    fn redis(config: &ClusterConfig, on_fatal: FatalErrorHandler) -> anyhow::Result<Option<Self>> {
        let Ok(url) = std::env::var("REDIS_URL") else {
            return Ok(None);
        };
        let broker = clustercmd_infra::broker::RedisCommandBroker::new(url, config.broker.clone())?
            .with_fatal_handler(on_fatal);
        Ok(Some(Transport::Redis(Arc::new(broker))))
    }

    #[cfg(not(feature = "redis"))]
    fn redis(_config: &ClusterConfig, _on_fatal: FatalErrorHandler) -> anyhow::Result<Option<Self>> {
        Ok(None)
    }

    fn broker(&self) -> Arc<dyn CommandBroker> {
        match self {
            Transport::Tailing(b) => b.clone(),
            #[cfg(feature = "redis")]
            Transport::Redis(b) => b.clone(),
        }
    }

    /// Drop whatever is still queued for `me` once the node has left.
    async fn release(&self, me: &MemberId) {
        match self {
            Transport::Tailing(broker) => match broker.purge_channel(me.as_str()).await {
                Ok(purged) => info!(purged, "released member channel"),
                Err(e) => warn!(error = %e, "could not release member channel"),
            },
            #[cfg(feature = "redis")]
            Transport::Redis(_) => {}
        }
    }
}

fn cluster_members(me: &MemberId) -> anyhow::Result<Vec<MemberId>> {
    let raw = std::env::var("CLUSTER_MEMBERS").unwrap_or_default();
    let mut members = StaticClusterRegistry::parse_ids(&raw).context("parsing CLUSTER_MEMBERS")?;
    if members.is_empty() {
        members.push(me.clone());
    }
    Ok(members)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    clustercmd_observability::init();

    let config = ClusterConfig::from_env()?;
    let me = config.member_id()?;
    let members = cluster_members(&me)?;

    let (on_fatal, mut fatal) = fatal_channel();
    let transport = Transport::connect(&config, on_fatal).await?;
    let registry = Arc::new(StaticClusterRegistry::from_ids(members.clone()));
    let service = CommandService::new(
        me.clone(),
        transport.broker(),
        registry,
        config.command_timeout(),
    );

    service.register_for_type(
        "ping",
        command_handler(|service, command| async move {
            service
                .send_in_response_to(&command, Reply::new().with_field("pong", true))
                .await?;
            Ok(())
        }),
    );
    register_site_handlers(&service, Arc::new(LocalSites::default()));
    register_plugin_handlers(&service, Arc::new(LocalPlugins::default()));
    register_locale_handlers(&service, Arc::new(LocalLocales::default()));
    register_maintenance_handlers(&service, Arc::new(LocalMaintenance::default()));

    service.init().await.context("joining the command bus")?;
    info!(member = %me, members = members.len(), "node ready");

    let outcome = run_until_stopped(tokio::signal::ctrl_c(), &mut fatal).await;

    if let Err(e) = service.shutdown().await {
        warn!(error = %e, "command service shutdown failed");
    }
    transport.release(&me).await;
    outcome
}

/// Serve until `stop` resolves or a broker reports it can no longer deliver.
async fn run_until_stopped<F>(
    stop: F,
    fatal: &mut mpsc::UnboundedReceiver<BrokerError>,
) -> anyhow::Result<()>
where
    F: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        stopped = stop => {
            stopped.context("waiting for shutdown signal")?;
            info!("shutdown requested");
            Ok(())
        }
        Some(err) = fatal.recv() => {
            Err(anyhow::Error::new(err).context("command bus failed"))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn fatal_broker_error_ends_the_run_with_an_error() {
        let (on_fatal, mut fatal) = fatal_channel();
        on_fatal(BrokerError::Store("connection reset".to_string()));

        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            run_until_stopped(std::future::pending(), &mut fatal),
        )
        .await
        .unwrap();

        let err = outcome.unwrap_err();
        assert!(format!("{err:#}").contains("connection reset"));
    }

    #[tokio::test]
    async fn stop_signal_ends_the_run_cleanly() {
        let (_on_fatal, mut fatal) = fatal_channel();
        run_until_stopped(async { Ok(()) }, &mut fatal).await.unwrap();
    }
}
