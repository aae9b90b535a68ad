//! Infrastructure-backed command brokers.
//!
//! The broker contract lives in `clustercmd-events`. This module provides a broker that
//! tails a capped store and, behind the `redis` feature, one over Redis pub/sub. Both
//! reconnect on failure until an `ErrorsOverTime` window says the failures are coming
//! too fast, then hand the aggregate error to a fatal handler.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::error;

use clustercmd_events::BrokerError;

#[cfg(feature = "redis")]
pub mod redis_pubsub;
pub mod tailing;

#[cfg(feature = "redis")]
pub use redis_pubsub::RedisCommandBroker;
pub use tailing::TailingCommandBroker;

/// Receives the error that made a subscription loop give up.
pub type FatalErrorHandler = Arc<dyn Fn(BrokerError) + Send + Sync>;

/// Used when the owner installs nothing else: log and terminate the process.
///
/// A panic would only end the spawned loop task, leaving a member that looks alive but no
/// longer hears its channel.
pub fn default_fatal_handler() -> FatalErrorHandler {
    Arc::new(|err: BrokerError| {
        error!(error = %err, "broker subscription is unrecoverable, exiting");
        std::process::exit(1);
    })
}

/// Forward fatal errors to a receiver so the process can run its own shutdown first.
pub fn fatal_channel() -> (FatalErrorHandler, mpsc::UnboundedReceiver<BrokerError>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: FatalErrorHandler = Arc::new(move |err: BrokerError| {
        error!(error = %err, "broker subscription is unrecoverable");
        if tx.send(err).is_err() {
            error!("fatal error receiver is gone");
        }
    });
    (handler, rx)
}
