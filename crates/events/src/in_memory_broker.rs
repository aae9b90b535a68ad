//! In-memory command broker for tests/dev.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::debug;

use crate::broker::{BrokerError, BrokerHandler, CommandBroker};
use crate::command::Command;

/// In-memory pub/sub broker.
///
/// - No IO
/// - Every record is round-tripped through the wire encoding, like a real transport
/// - Handlers are invoked inline on the publishing task, after the lock is released
#[derive(Default)]
pub struct InMemoryCommandBroker {
    subscribers: Mutex<HashMap<String, Vec<BrokerHandler>>>,
    initialized: AtomicBool,
    closed: AtomicBool,
}

impl InMemoryCommandBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of handlers subscribed to `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.subscribers
            .lock()
            .map(|subs| subs.get(channel).map_or(0, Vec::len))
            .unwrap_or(0)
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

impl core::fmt::Debug for InMemoryCommandBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryCommandBroker")
            .field("initialized", &self.initialized.load(Ordering::SeqCst))
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl CommandBroker for InMemoryCommandBroker {
    async fn init(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.clear();
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, command: &Command) -> Result<(), BrokerError> {
        self.ensure_open()?;

        let wire = command
            .to_wire(channel)
            .map_err(|e| BrokerError::Serialization(e.to_string()))?;

        let handlers = {
            let subs = self
                .subscribers
                .lock()
                .map_err(|_| BrokerError::Transport("lock poisoned".to_string()))?;
            subs.get(channel).cloned().unwrap_or_default()
        };

        if handlers.is_empty() {
            debug!(channel, command_id = %command.id, "no subscribers for channel");
            return Ok(());
        }

        let (channel, delivered) =
            Command::from_wire(wire).map_err(|e| BrokerError::Serialization(e.to_string()))?;
        for handler in handlers {
            handler(channel.clone(), delivered.clone());
        }

        Ok(())
    }

    async fn subscribe(&self, channel: &str, handler: BrokerHandler) -> Result<(), BrokerError> {
        self.ensure_open()?;

        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| BrokerError::Transport("lock poisoned".to_string()))?;
        subs.entry(channel.to_string()).or_default().push(handler);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::broker::broker_handler;
    use clustercmd_core::MemberId;

    #[tokio::test]
    async fn publish_requires_init() {
        let broker = InMemoryCommandBroker::new();
        let cmd = Command::new("ping", MemberId::new("m1").unwrap());

        let err = broker.publish("m1", &cmd).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotInitialized));
    }

    #[tokio::test]
    async fn delivers_only_to_matching_channel() {
        let broker = InMemoryCommandBroker::new();
        broker.init().await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        broker
            .subscribe(
                "m2",
                broker_handler(move |channel, cmd| {
                    sink.lock().unwrap().push((channel, cmd.command_type));
                }),
            )
            .await
            .unwrap();

        let from = MemberId::new("m1").unwrap();
        broker.publish("m2", &Command::new("ping", from.clone())).await.unwrap();
        broker.publish("m3", &Command::new("other", from)).await.unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen, vec![("m2".to_string(), "ping".to_string())]);
    }

    #[tokio::test]
    async fn shutdown_is_repeatable_and_closes_publish() {
        let broker = InMemoryCommandBroker::new();
        broker.init().await.unwrap();
        broker.shutdown().await.unwrap();
        broker.shutdown().await.unwrap();

        let cmd = Command::new("ping", MemberId::new("m1").unwrap());
        assert!(matches!(
            broker.publish("m1", &cmd).await.unwrap_err(),
            BrokerError::Closed
        ));
    }
}
