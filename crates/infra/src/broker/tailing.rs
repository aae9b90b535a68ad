//! Command broker that tails a capped, append-only store.
//!
//! `publish` appends a record; every subscription runs its own loop that keeps asking
//! the store for records newer than the last position it has seen. The store's
//! `read_after` wait bounds each poll, so an idle loop sleeps instead of spinning and
//! still notices shutdown promptly.
//!
//! ## Failure policy
//!
//! Each loop iteration runs inside a fault boundary. Store errors and panics are fed to
//! an `ErrorsOverTime` window:
//!
//! - within limits: pause for the reconnect delay and resume from the last seen position
//! - out of bounds: the aggregate `ErrorBurst` goes to the fatal handler and the loop
//!   stops (a fast burst means the connection to the store is gone)

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use clustercmd_core::ErrorsOverTime;
use clustercmd_events::{BrokerError, BrokerHandler, Command, CommandBroker};

use super::{FatalErrorHandler, default_fatal_handler};
use crate::config::BrokerConfig;
use crate::fault::isolate;
use crate::store::{CappedStore, NewRecord, RecordFilter, StoreError};

pub struct TailingCommandBroker<S> {
    store: Arc<S>,
    config: BrokerConfig,
    initialized: AtomicBool,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    on_fatal: FatalErrorHandler,
}

impl<S> TailingCommandBroker<S>
where
    S: CappedStore + 'static,
{
    pub fn new(store: Arc<S>, config: BrokerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            config,
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown_tx,
            loops: Mutex::new(Vec::new()),
            on_fatal: default_fatal_handler(),
        }
    }

    /// Replace the handler that receives the error burst of a dead subscription.
    pub fn with_fatal_handler(mut self, on_fatal: FatalErrorHandler) -> Self {
        self.on_fatal = on_fatal;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Drop every record addressed to `channel` (e.g. a member leaving the cluster).
    #[instrument(skip(self), err)]
    pub async fn purge_channel(&self, channel: &str) -> Result<u64, BrokerError> {
        self.store
            .delete_matching(&RecordFilter::channel(channel))
            .await
            .map_err(store_error)
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

impl<S> core::fmt::Debug for TailingCommandBroker<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TailingCommandBroker")
            .field("config", &self.config)
            .field("initialized", &self.initialized.load(Ordering::SeqCst))
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl<S> CommandBroker for TailingCommandBroker<S>
where
    S: CappedStore + 'static,
{
    #[instrument(skip(self), err)]
    async fn init(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        let created = self
            .store
            .ensure_capped(self.config.max_records)
            .await
            .map_err(store_error)?;

        if created || self.store.latest_position().await.map_err(store_error)?.is_none() {
            self.store
                .append(NewRecord::primer())
                .await
                .map_err(store_error)?;
        }

        info!(created, max_records = self.config.max_records, "tailing broker ready");
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown_tx.send_replace(true);

        let loops = match self.loops.lock() {
            Ok(mut loops) => std::mem::take(&mut *loops),
            Err(_) => Vec::new(),
        };
        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "tail loop ended abnormally");
            }
        }

        info!("tailing broker shut down");
        Ok(())
    }

    #[instrument(skip(self, command), fields(command_id = %command.id, command_type = %command.command_type), err)]
    async fn publish(&self, channel: &str, command: &Command) -> Result<(), BrokerError> {
        self.ensure_open()?;

        let wire = command
            .to_wire(channel)
            .map_err(|e| BrokerError::Serialization(e.to_string()))?;

        self.store
            .append(NewRecord::new(channel, wire))
            .await
            .map_err(store_error)?;
        Ok(())
    }

    #[instrument(skip(self, handler), err)]
    async fn subscribe(&self, channel: &str, handler: BrokerHandler) -> Result<(), BrokerError> {
        self.ensure_open()?;

        // Fix the starting point now so records appended after `subscribe` returns are seen.
        let start = self
            .store
            .latest_position()
            .await
            .map_err(store_error)?
            .unwrap_or(0);

        let tail = Tail {
            store: self.store.clone(),
            channel: channel.to_string(),
            handler,
            config: self.config.clone(),
            position: start,
        };
        let handle = tokio::spawn(tail.run(self.shutdown_tx.subscribe(), self.on_fatal.clone()));

        self.loops
            .lock()
            .map_err(|_| BrokerError::Transport("lock poisoned".to_string()))?
            .push(handle);
        Ok(())
    }
}

/// State of one subscription loop.
struct Tail<S> {
    store: Arc<S>,
    channel: String,
    handler: BrokerHandler,
    config: BrokerConfig,
    position: u64,
}

impl<S> Tail<S>
where
    S: CappedStore + 'static,
{
    async fn run(mut self, mut shutdown: watch::Receiver<bool>, on_fatal: FatalErrorHandler) {
        let mut errors = ErrorsOverTime::new(self.config.error_span, self.config.error_threshold());
        debug!(channel = %self.channel, position = self.position, "tail started");

        loop {
            let outcome = match isolate(self.session(&mut shutdown)).await {
                Ok(result) => result,
                Err(panic) => Err(BrokerError::Transport(format!("tail loop panicked: {panic}"))),
            };

            let err = match outcome {
                Ok(()) => break,
                Err(err) => err,
            };

            let prefix = format!("tail of channel {:?} failed repeatedly", self.channel);
            if let Err(burst) = errors.assert_within_limits(&err, &prefix) {
                on_fatal(BrokerError::ErrorBurst(burst));
                break;
            }

            warn!(
                channel = %self.channel,
                error = %err,
                total_errors = errors.total_errors(),
                "tail failed, reconnecting"
            );

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay()) => {}
            }
        }

        debug!(channel = %self.channel, "tail stopped");
    }

    /// Poll until shutdown (`Ok`) or the first store error.
    async fn session(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), BrokerError> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let records = tokio::select! {
                biased;
                _ = shutdown.changed() => return Ok(()),
                found = self.store.read_after(&self.channel, self.position, self.config.poll_wait()) => {
                    found.map_err(store_error)?
                }
            };

            for record in records {
                self.position = self.position.max(record.position);
                if record.primer {
                    continue;
                }

                match Command::from_wire(record.body) {
                    Ok((channel, command)) => (self.handler)(channel, command),
                    Err(e) => debug!(
                        channel = %self.channel,
                        position = record.position,
                        error = %e,
                        "discarding malformed record"
                    ),
                }
            }
        }
    }
}

fn store_error(err: StoreError) -> BrokerError {
    BrokerError::Store(err.to_string())
}
