//! Redis pub/sub command broker (feature `redis`).
//!
//! Note: Redis pub/sub is not durable; a member that is offline when a command is
//! published never sees it. Callers already tolerate that through response timeouts.
//!
//! The synchronous redis client is used: publishes run on the blocking pool and each
//! subscription owns a blocking thread whose read timeout doubles as the shutdown poll.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::Commands;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use clustercmd_core::ErrorsOverTime;
use clustercmd_events::{BrokerError, BrokerHandler, Command, CommandBroker};

use super::{FatalErrorHandler, default_fatal_handler};
use crate::config::BrokerConfig;

/// How long `subscribe` waits for the server to confirm SUBSCRIBE.
const SUBSCRIBE_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// Sent once the first SUBSCRIBE of a subscriber thread succeeds or fails.
type ReadySignal = oneshot::Sender<Result<(), BrokerError>>;

pub struct RedisCommandBroker {
    client: redis::Client,
    config: BrokerConfig,
    initialized: AtomicBool,
    closed: Arc<AtomicBool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    on_fatal: FatalErrorHandler,
}

impl RedisCommandBroker {
    pub fn new(redis_url: impl AsRef<str>, config: BrokerConfig) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(redis_error)?;
        Ok(Self {
            client,
            config,
            initialized: AtomicBool::new(false),
            closed: Arc::new(AtomicBool::new(false)),
            loops: Mutex::new(Vec::new()),
            on_fatal: default_fatal_handler(),
        })
    }

    pub fn with_fatal_handler(mut self, on_fatal: FatalErrorHandler) -> Self {
        self.on_fatal = on_fatal;
        self
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(BrokerError::NotInitialized);
        }
        Ok(())
    }
}

impl core::fmt::Debug for RedisCommandBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisCommandBroker")
            .field("config", &self.config)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl CommandBroker for RedisCommandBroker {
    #[instrument(skip(self), err)]
    async fn init(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        let client = self.client.clone();
        tokio::task::spawn_blocking(move || -> Result<(), BrokerError> {
            let mut conn = client.get_connection().map_err(redis_error)?;
            let _: String = redis::cmd("PING").query(&mut conn).map_err(redis_error)?;
            Ok(())
        })
        .await
        .map_err(|e| BrokerError::Transport(e.to_string()))??;

        info!("redis broker ready");
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let loops = match self.loops.lock() {
            Ok(mut loops) => std::mem::take(&mut *loops),
            Err(_) => Vec::new(),
        };
        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "subscriber thread ended abnormally");
            }
        }

        info!("redis broker shut down");
        Ok(())
    }

    #[instrument(skip(self, command), fields(command_id = %command.id, command_type = %command.command_type), err)]
    async fn publish(&self, channel: &str, command: &Command) -> Result<(), BrokerError> {
        self.ensure_open()?;

        let wire = command
            .to_wire(channel)
            .map_err(|e| BrokerError::Serialization(e.to_string()))?;
        let payload =
            serde_json::to_string(&wire).map_err(|e| BrokerError::Serialization(e.to_string()))?;

        let client = self.client.clone();
        let channel = channel.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), BrokerError> {
            let mut conn = client.get_connection().map_err(redis_error)?;
            let _: i64 = conn.publish(&channel, payload).map_err(redis_error)?;
            Ok(())
        })
        .await
        .map_err(|e| BrokerError::Transport(e.to_string()))?
    }

    #[instrument(skip(self, handler), err)]
    async fn subscribe(&self, channel: &str, handler: BrokerHandler) -> Result<(), BrokerError> {
        self.ensure_open()?;

        let subscriber = Subscriber {
            client: self.client.clone(),
            channel: channel.to_string(),
            handler,
            config: self.config.clone(),
            closed: self.closed.clone(),
        };
        let on_fatal = self.on_fatal.clone();
        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::task::spawn_blocking(move || subscriber.run(ready_tx, on_fatal));

        self.loops
            .lock()
            .map_err(|_| BrokerError::Transport("lock poisoned".to_string()))?
            .push(handle);

        // Pub/sub keeps no backlog: report ready only once the server has the subscription.
        match tokio::time::timeout(SUBSCRIBE_CONFIRM_TIMEOUT, ready_rx).await {
            Ok(Ok(confirmed)) => confirmed,
            Ok(Err(_)) => Err(BrokerError::Transport(format!(
                "subscriber for {channel:?} exited before subscribing"
            ))),
            Err(_) => Err(BrokerError::Transport(format!(
                "no SUBSCRIBE confirmation for {channel:?} within {SUBSCRIBE_CONFIRM_TIMEOUT:?}"
            ))),
        }
    }
}

struct Subscriber {
    client: redis::Client,
    channel: String,
    handler: BrokerHandler,
    config: BrokerConfig,
    closed: Arc<AtomicBool>,
}

impl Subscriber {
    fn run(self, ready: ReadySignal, on_fatal: FatalErrorHandler) {
        let mut errors = ErrorsOverTime::new(self.config.error_span, self.config.error_threshold());
        let mut ready = Some(ready);

        while !self.closed.load(Ordering::SeqCst) {
            let session = std::panic::AssertUnwindSafe(|| self.session(&mut ready));
            let outcome = std::panic::catch_unwind(session).unwrap_or_else(|panic| {
                Err(BrokerError::Transport(format!(
                    "subscriber panicked: {}",
                    crate::fault::panic_message(panic)
                )))
            });

            let Err(err) = outcome else { break };

            // A first subscription that never came up goes back to the caller of `subscribe`.
            if let Some(ready) = ready.take() {
                if ready.send(Err(err)).is_err() {
                    debug!(channel = %self.channel, "subscribe caller gone before failure was reported");
                }
                break;
            }

            let prefix = format!("redis subscription to {:?} failed repeatedly", self.channel);
            if let Err(burst) = errors.assert_within_limits(&err, &prefix) {
                on_fatal(BrokerError::ErrorBurst(burst));
                break;
            }

            warn!(channel = %self.channel, error = %err, "subscription failed, reconnecting");
            std::thread::sleep(self.config.reconnect_delay());
        }
    }

    fn session(&self, ready: &mut Option<ReadySignal>) -> Result<(), BrokerError> {
        let mut conn = self.client.get_connection().map_err(redis_error)?;
        let mut pubsub = conn.as_pubsub();
        pubsub.subscribe(&self.channel).map_err(redis_error)?;
        pubsub
            .set_read_timeout(Some(self.config.poll_wait()))
            .map_err(redis_error)?;

        if let Some(ready) = ready.take() {
            if ready.send(Ok(())).is_err() {
                debug!(channel = %self.channel, "subscribe caller gone before confirmation");
            }
        }

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(());
            }

            let msg = match pubsub.get_message() {
                Ok(m) => m,
                Err(e) if e.is_timeout() => continue,
                Err(e) => return Err(redis_error(e)),
            };

            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    debug!(channel = %self.channel, error = %e, "discarding non-text message");
                    continue;
                }
            };

            let decoded = serde_json::from_str(&payload)
                .map_err(|e| e.to_string())
                .and_then(|wire| Command::from_wire(wire).map_err(|e| e.to_string()));

            match decoded {
                Ok((channel, command)) => (self.handler)(channel, command),
                Err(e) => debug!(channel = %self.channel, error = %e, "discarding malformed message"),
            }
        }
    }
}

fn redis_error(err: redis::RedisError) -> BrokerError {
    BrokerError::Transport(err.to_string())
}
