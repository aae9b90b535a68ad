//! Command transport abstraction (mechanics only).
//!
//! A `CommandBroker` moves `Command`s between cluster members over named channels.
//! It knows nothing about handler registries, correlation or timeouts; those live one
//! layer up in the command service.
//!
//! ## Delivery Guarantees
//!
//! - **At-least-once**: a record may be delivered more than once (e.g. after a
//!   reconnect); consumers must tolerate duplicates
//! - **No cross-channel ordering**: records on different channels may interleave freely
//! - **Publish is not acknowledgement**: `publish` succeeding means the record was
//!   durably appended/sent, not that any subscriber received it
//!
//! ## Implementations
//!
//! - `InMemoryCommandBroker` (this crate): single-process fan-out, tests/dev
//! - tailing broker (infra): polls a capped append-only store
//! - Redis broker (infra, feature `redis`): native pub/sub
//!
//! All of them satisfy the same `init/shutdown/publish/subscribe` contract, so the
//! command service can be pointed at any of them without change.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use clustercmd_core::ErrorBurst;

use crate::command::Command;

/// Callback invoked for each record delivered on a subscribed channel.
///
/// Receives `(channel, command)`. It must not block: anything long-running should be
/// spawned by the callee.
pub type BrokerHandler = Arc<dyn Fn(String, Command) + Send + Sync>;

/// Wrap a closure as a [`BrokerHandler`].
pub fn broker_handler<F>(f: F) -> BrokerHandler
where
    F: Fn(String, Command) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker is not initialized")]
    NotInitialized,

    #[error("broker is shut down")]
    Closed,

    #[error("store error: {0}")]
    Store(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// The reconnect loop gave up after a fast burst of failures.
    #[error(transparent)]
    ErrorBurst(#[from] ErrorBurst),
}

/// Pluggable pub/sub transport for commands.
///
/// ## Lifecycle
///
/// - `init()` is idempotent and must succeed before `publish`/`subscribe`
/// - `shutdown()` releases resources, stops subscription loops, and is safe to call
///   more than once
///
/// ## Thread Safety
///
/// Implementations are shared behind `Arc` by the command service and the job runners,
/// so they must be `Send + Sync`.
#[async_trait]
pub trait CommandBroker: Send + Sync {
    /// Ensure the backing store/channel exists.
    async fn init(&self) -> Result<(), BrokerError>;

    /// Release resources and stop all subscription loops.
    async fn shutdown(&self) -> Result<(), BrokerError>;

    /// Append `command` to `channel`.
    async fn publish(&self, channel: &str, command: &Command) -> Result<(), BrokerError>;

    /// Invoke `handler` for every record appended to `channel` from now on.
    async fn subscribe(&self, channel: &str, handler: BrokerHandler) -> Result<(), BrokerError>;
}

#[async_trait]
impl<B> CommandBroker for Arc<B>
where
    B: CommandBroker + ?Sized,
{
    async fn init(&self) -> Result<(), BrokerError> {
        (**self).init().await
    }

    async fn shutdown(&self) -> Result<(), BrokerError> {
        (**self).shutdown().await
    }

    async fn publish(&self, channel: &str, command: &Command) -> Result<(), BrokerError> {
        (**self).publish(channel, command).await
    }

    async fn subscribe(&self, channel: &str, handler: BrokerHandler) -> Result<(), BrokerError> {
        (**self).subscribe(channel, handler).await
    }
}
