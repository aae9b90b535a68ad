//! Process-scoped command service.
//!
//! Sits on top of a [`CommandBroker`] and adds what the transport lacks:
//!
//! - a registrant table: command `type` -> ordered handlers
//! - an awaiting-response table: sent command id -> pending reply slot
//! - request/response with timeouts and cluster-wide fan-out
//!
//! ## Addressing
//!
//! Every member subscribes to its own channel (its member id) and to
//! [`BROADCAST_CHANNEL`]. Targeted commands are published on the target's channel,
//! broadcasts on the shared one. On receipt a command is only dispatched when its `to`
//! is this member or absent.
//!
//! ## Dispatch
//!
//! Replies (commands with `replyTo`) never reach type handlers; they complete the
//! matching pending request, or are logged and dropped when nobody waits any more.
//! Everything else is handed to each registered handler on its own task, behind a
//! panic boundary, so one failing handler cannot affect the others.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, join_all};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use clustercmd_core::{CommandId, MemberId};
use clustercmd_events::{BrokerError, Command, CommandBroker, broker_handler, reserved_key};

use crate::cluster::{ClusterRegistry, RegistryError};
use crate::config::DEFAULT_COMMAND_TIMEOUT;
use crate::fault::isolate;

/// Channel every member listens on for commands without a target.
pub const BROADCAST_CHANNEL: &str = "cluster.broadcast";

/// Reply field a worker uses to report failure to the initiator.
pub const REPLY_ERROR_FIELD: &str = "error";

/// A registered command handler.
///
/// Receives the service (to reply or send follow-ups) and the command.
pub type CommandHandler =
    Arc<dyn Fn(Arc<CommandService>, Command) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`CommandHandler`].
pub fn command_handler<F, Fut>(f: F) -> CommandHandler
where
    F: Fn(Arc<CommandService>, Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |service, command| Box::pin(f(service, command)))
}

/// Called with `(index, total)` right before each member is sent to during fan-out.
pub type ProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("invalid command: {0}")]
    Validation(String),

    #[error("command {command_type:?} requires a target member")]
    MissingTarget { command_type: String },

    #[error("no response to command {id} within {timeout:?}")]
    Timeout { id: CommandId, timeout: Duration },

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("command service is shut down")]
    Shutdown,
}

/// Options for the `send_*` family.
#[derive(Clone, Default)]
pub struct CommandOptions {
    /// Target member; `None` broadcasts.
    pub to: Option<MemberId>,
    /// Use this id instead of generating one.
    pub id: Option<CommandId>,
    /// Response timeout for request/response sends.
    pub timeout: Option<Duration>,
    /// Type-specific fields.
    pub payload: Map<String, JsonValue>,
    /// Leave this member out of fan-out.
    pub ignore_me: bool,
    pub progress: Option<ProgressFn>,
}

impl CommandOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to(mut self, member: MemberId) -> Self {
        self.to = Some(member);
        self
    }

    pub fn id(mut self, id: CommandId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn payload(mut self, payload: Map<String, JsonValue>) -> Self {
        self.payload.extend(payload);
        self
    }

    pub fn ignore_me(mut self, ignore_me: bool) -> Self {
        self.ignore_me = ignore_me;
        self
    }

    pub fn progress<F>(mut self, f: F) -> Self
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(f));
        self
    }
}

impl core::fmt::Debug for CommandOptions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandOptions")
            .field("to", &self.to)
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .field("payload", &self.payload)
            .field("ignore_me", &self.ignore_me)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Body of a reply built by [`CommandService::send_in_response_to`].
#[derive(Debug, Clone, Default)]
pub struct Reply {
    /// Defaults to the type of the command being answered.
    pub command_type: Option<String>,
    pub payload: Map<String, JsonValue>,
}

impl Reply {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, command_type: impl Into<String>) -> Self {
        self.command_type = Some(command_type.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }
}

/// One member's outcome in a fan-out.
///
/// Exactly one of `err` and `command` is set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberResponse {
    pub member: MemberId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Command>,
}

impl MemberResponse {
    fn from_outcome(member: MemberId, outcome: Result<Command, CommandError>) -> Self {
        match outcome {
            Ok(reply) => match reply.get_str(REPLY_ERROR_FIELD).filter(|e| !e.is_empty()) {
                Some(err) => Self {
                    member,
                    err: Some(err.to_string()),
                    command: None,
                },
                None => Self {
                    member,
                    err: None,
                    command: Some(reply),
                },
            },
            Err(e) => Self {
                member,
                err: Some(e.to_string()),
                command: None,
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.err.is_none()
    }
}

pub struct CommandService {
    this: Weak<CommandService>,
    me: MemberId,
    broker: Arc<dyn CommandBroker>,
    registry: Arc<dyn ClusterRegistry>,
    default_timeout: Option<Duration>,
    registrants: Mutex<HashMap<String, Vec<CommandHandler>>>,
    awaiting: Mutex<HashMap<CommandId, oneshot::Sender<Command>>>,
    /// Channels already subscribed; also serialises `init`.
    subscribed: tokio::sync::Mutex<HashSet<String>>,
    initialized: AtomicBool,
    closed: AtomicBool,
}

impl CommandService {
    /// `default_timeout` applies when a send does not carry its own timeout; without it
    /// [`DEFAULT_COMMAND_TIMEOUT`] is used.
    pub fn new(
        me: MemberId,
        broker: Arc<dyn CommandBroker>,
        registry: Arc<dyn ClusterRegistry>,
        default_timeout: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            me,
            broker,
            registry,
            default_timeout,
            registrants: Mutex::new(HashMap::new()),
            awaiting: Mutex::new(HashMap::new()),
            subscribed: tokio::sync::Mutex::new(HashSet::new()),
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// This member's identity (and channel).
    pub fn me(&self) -> &MemberId {
        &self.me
    }

    pub fn broker(&self) -> &Arc<dyn CommandBroker> {
        &self.broker
    }

    pub fn registry(&self) -> &Arc<dyn ClusterRegistry> {
        &self.registry
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Number of requests still waiting for a reply.
    pub fn awaiting_count(&self) -> usize {
        self.awaiting().len()
    }

    pub fn registrant_count(&self, command_type: &str) -> usize {
        self.registrants().get(command_type).map_or(0, Vec::len)
    }

    /// Initialize the broker and subscribe this member's channels. Idempotent.
    #[instrument(skip(self), fields(member = %self.me), err)]
    pub async fn init(&self) -> Result<(), CommandError> {
        let mut subscribed = self.subscribed.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(CommandError::Shutdown);
        }
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.broker.init().await?;

        // A retry after a partial failure must not subscribe a channel twice.
        for channel in [self.me.as_str(), BROADCAST_CHANNEL] {
            if subscribed.contains(channel) {
                continue;
            }
            let this = self.this.clone();
            self.broker
                .subscribe(
                    channel,
                    broker_handler(move |_channel, command| {
                        if let Some(service) = this.upgrade() {
                            service.on_command_received(command);
                        }
                    }),
                )
                .await?;
            subscribed.insert(channel.to_string());
        }

        self.initialized.store(true, Ordering::SeqCst);
        info!(member = %self.me, "command service ready");
        Ok(())
    }

    /// Stop the broker and fail every pending request with [`CommandError::Shutdown`].
    pub async fn shutdown(&self) -> Result<(), CommandError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let pending = std::mem::take(&mut *self.awaiting());
        if !pending.is_empty() {
            debug!(pending = pending.len(), "abandoning pending requests");
        }
        drop(pending);

        self.broker.shutdown().await?;
        info!(member = %self.me, "command service shut down");
        Ok(())
    }

    /// Register `handler` for `command_type`. Returns `false` if it already is.
    pub fn register_for_type(&self, command_type: impl Into<String>, handler: CommandHandler) -> bool {
        let mut registrants = self.registrants();
        let handlers = registrants.entry(command_type.into()).or_default();
        if handlers.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            return false;
        }
        handlers.push(handler);
        true
    }

    /// Remove `handler` from `command_type`. Returns `false` if it was not registered.
    pub fn unregister_for_type(&self, command_type: &str, handler: &CommandHandler) -> bool {
        let mut registrants = self.registrants();
        let Some(handlers) = registrants.get_mut(command_type) else {
            return false;
        };

        let before = handlers.len();
        handlers.retain(|h| !Arc::ptr_eq(h, handler));
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            registrants.remove(command_type);
        }
        removed
    }

    /// Entry point for every command delivered on one of this member's channels.
    pub fn on_command_received(&self, command: Command) {
        match &command.to {
            Some(to) if *to != self.me => {
                debug!(command_id = %command.id, to = %to, "ignoring command for another member");
            }
            _ => self.notify_of_command(command),
        }
    }

    /// Dispatch a raw wire record. Records that do not decode are dropped.
    pub fn notify_of_record(&self, record: JsonValue) {
        match Command::from_wire(record) {
            Ok((_, command)) => self.notify_of_command(command),
            Err(e) => debug!(error = %e, "ignoring malformed command record"),
        }
    }

    /// Route a command to its pending request (replies) or its type handlers.
    ///
    /// Never fails and never runs a handler inline.
    pub fn notify_of_command(&self, command: Command) {
        if command.command_type.trim().is_empty() {
            debug!(command_id = %command.id, "ignoring command without a type");
            return;
        }

        if let Some(reply_to) = command.reply_to {
            let pending = self.awaiting().remove(&reply_to);
            match pending {
                Some(slot) => {
                    if slot.send(command).is_err() {
                        debug!(reply_to = %reply_to, "requester stopped waiting before the reply arrived");
                    }
                }
                None => warn!(
                    reply_to = %reply_to,
                    command_type = %command.command_type,
                    "discarding reply with no pending request"
                ),
            }
            return;
        }

        let handlers = self
            .registrants()
            .get(&command.command_type)
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!(command_type = %command.command_type, "no handlers registered");
            return;
        }

        let Some(service) = self.this.upgrade() else {
            return;
        };

        for handler in handlers {
            let service = service.clone();
            let command = command.clone();
            tokio::spawn(async move {
                let command_id = command.id;
                let command_type = command.command_type.clone();
                match isolate(async move { handler(service, command).await }).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(%command_id, %command_type, error = %e, "command handler failed"),
                    Err(panic) => warn!(%command_id, %command_type, panic = %panic, "command handler panicked"),
                }
            });
        }
    }

    /// Publish a command and return its id. Does not wait for any reply.
    #[instrument(skip(self, options), fields(to = ?options.to), err)]
    pub async fn send_command(
        &self,
        command_type: &str,
        options: CommandOptions,
    ) -> Result<CommandId, CommandError> {
        let command = self.build_command(command_type, options)?;
        self.publish(&command).await?;
        Ok(command.id)
    }

    /// Send to `options.to` and wait for the correlated reply.
    #[instrument(skip(self, options), fields(to = ?options.to), err)]
    pub async fn send_command_get_response(
        &self,
        command_type: &str,
        options: CommandOptions,
    ) -> Result<Command, CommandError> {
        if options.to.is_none() {
            return Err(CommandError::MissingTarget {
                command_type: command_type.to_string(),
            });
        }

        let timeout = options
            .timeout
            .or(self.default_timeout)
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT);
        let command = self.build_command(command_type, options)?;
        let id = command.id;

        let (slot, reply) = oneshot::channel();
        {
            let mut awaiting = self.awaiting();
            if awaiting.contains_key(&id) {
                return Err(CommandError::Validation(format!(
                    "command {id} is already awaiting a response"
                )));
            }
            awaiting.insert(id, slot);
        }
        let _pending = PendingGuard { service: self, id };

        self.publish(&command).await?;

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CommandError::Shutdown),
            Err(_) => {
                self.awaiting().remove(&id);
                debug!(command_id = %id, ?timeout, "request timed out");
                Err(CommandError::Timeout { id, timeout })
            }
        }
    }

    /// Send to every cluster member and wait for all of them.
    ///
    /// Results are in registry order. A member that fails, times out, or replies with a
    /// non-empty `error` field gets `err` set; it does not affect the other members.
    #[instrument(skip(self, options), err)]
    pub async fn send_command_to_all_get_responses(
        &self,
        command_type: &str,
        options: CommandOptions,
    ) -> Result<Vec<MemberResponse>, CommandError> {
        let members: Vec<MemberId> = self
            .registry
            .list_members()
            .await?
            .into_iter()
            .map(|m| m.id)
            .filter(|id| !(options.ignore_me && *id == self.me))
            .collect();

        let total = members.len();
        let sends = members.into_iter().enumerate().map(|(index, member)| {
            let progress = options.progress.clone();
            let per_member = CommandOptions {
                to: Some(member.clone()),
                id: None,
                progress: None,
                ..options.clone()
            };

            async move {
                if let Some(progress) = progress {
                    progress(index, total);
                }
                let outcome = self.send_command_get_response(command_type, per_member).await;
                MemberResponse::from_outcome(member, outcome)
            }
        });

        Ok(join_all(sends).await)
    }

    /// Answer `original`: addressed to its sender, correlated by its id.
    #[instrument(skip(self, original, reply), fields(reply_to = %original.id), err)]
    pub async fn send_in_response_to(
        &self,
        original: &Command,
        reply: Reply,
    ) -> Result<CommandId, CommandError> {
        let command_type = reply
            .command_type
            .unwrap_or_else(|| original.command_type.clone());

        let mut command = self.build_command(
            &command_type,
            CommandOptions::new().to(original.from.clone()).payload(reply.payload),
        )?;
        command.reply_to = Some(original.id);

        self.publish(&command).await?;
        Ok(command.id)
    }

    fn build_command(&self, command_type: &str, options: CommandOptions) -> Result<Command, CommandError> {
        if command_type.trim().is_empty() {
            return Err(CommandError::Validation("command type must not be empty".to_string()));
        }
        if let Some(key) = reserved_key(&options.payload) {
            return Err(CommandError::Validation(format!(
                "payload field `{key}` is reserved for the command envelope"
            )));
        }

        Ok(Command {
            id: options.id.unwrap_or_default(),
            command_type: command_type.to_string(),
            from: self.me.clone(),
            to: options.to,
            reply_to: None,
            date: Utc::now(),
            payload: options.payload,
        })
    }

    async fn publish(&self, command: &Command) -> Result<(), CommandError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CommandError::Shutdown);
        }

        let channel = command.to.as_ref().map_or(BROADCAST_CHANNEL, MemberId::as_str);
        self.broker.publish(channel, command).await?;
        debug!(
            command_id = %command.id,
            command_type = %command.command_type,
            channel,
            "command sent"
        );
        Ok(())
    }

    fn registrants(&self) -> MutexGuard<'_, HashMap<String, Vec<CommandHandler>>> {
        self.registrants.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn awaiting(&self) -> MutexGuard<'_, HashMap<CommandId, oneshot::Sender<Command>>> {
        self.awaiting.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl core::fmt::Debug for CommandService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandService")
            .field("me", &self.me)
            .field("default_timeout", &self.default_timeout)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

/// Clears the awaiting entry when a request ends early (publish error or cancellation).
struct PendingGuard<'a> {
    service: &'a CommandService,
    id: CommandId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.service.awaiting().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::cluster::StaticClusterRegistry;
    use clustercmd_events::InMemoryCommandBroker;
    use serde_json::json;

    fn member(key: &str) -> MemberId {
        MemberId::new(key).unwrap()
    }

    /// Services for `keys`, sharing one in-memory broker and a static registry.
    async fn cluster(keys: &[&str]) -> Vec<Arc<CommandService>> {
        let broker: Arc<dyn CommandBroker> = Arc::new(InMemoryCommandBroker::new());
        let registry: Arc<dyn ClusterRegistry> =
            Arc::new(StaticClusterRegistry::from_ids(keys.iter().map(|k| member(k))));

        let mut services = Vec::new();
        for key in keys {
            let service = CommandService::new(member(key), broker.clone(), registry.clone(), None);
            service.init().await.unwrap();
            services.push(service);
        }
        services
    }

    fn pong_handler() -> CommandHandler {
        command_handler(|service, command| async move {
            service
                .send_in_response_to(&command, Reply::new().with_field("pong", true))
                .await?;
            Ok(())
        })
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> CommandHandler {
        command_handler(move |_, _| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let services = cluster(&["m1"]).await;
        services[0].init().await.unwrap();
        assert!(services[0].is_initialized());
    }

    #[tokio::test]
    async fn request_gets_correlated_reply() {
        let services = cluster(&["initiator", "m1"]).await;
        services[1].register_for_type("ping", pong_handler());

        let reply = services[0]
            .send_command_get_response(
                "ping",
                CommandOptions::new().to(member("m1")).timeout(Duration::from_millis(500)),
            )
            .await
            .unwrap();

        assert_eq!(reply.get("pong"), Some(&json!(true)));
        assert_eq!(reply.command_type, "ping");
        assert_eq!(reply.to, Some(member("initiator")));
        assert_eq!(services[0].awaiting_count(), 0);
    }

    #[tokio::test]
    async fn request_requires_target() {
        let services = cluster(&["m1"]).await;
        let err = services[0]
            .send_command_get_response("ping", CommandOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::MissingTarget { .. }));
    }

    #[tokio::test]
    async fn empty_type_is_rejected() {
        let services = cluster(&["m1"]).await;
        let err = services[0]
            .send_command(" ", CommandOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Validation(_)));
    }

    #[tokio::test]
    async fn envelope_keys_in_payload_are_rejected() {
        let services = cluster(&["initiator", "m1"]).await;
        services[1].register_for_type("ping", pong_handler());

        let err = services[0]
            .send_command_get_response(
                "ping",
                CommandOptions::new()
                    .to(member("m1"))
                    .field("from", "someone-else")
                    .timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Validation(ref m) if m.contains("`from`")));
        assert_eq!(services[0].awaiting_count(), 0);

        let original = Command::new("ping", member("initiator"));
        let err = services[1]
            .send_in_response_to(&original, Reply::new().with_field("replyTo", "elsewhere"))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Validation(ref m) if m.contains("`replyTo`")));
    }

    /// Broker whose first subscription to the broadcast channel fails.
    struct FlakyBroadcast {
        inner: InMemoryCommandBroker,
        failed_once: AtomicBool,
    }

    #[async_trait::async_trait]
    impl CommandBroker for FlakyBroadcast {
        async fn init(&self) -> Result<(), BrokerError> {
            self.inner.init().await
        }

        async fn shutdown(&self) -> Result<(), BrokerError> {
            self.inner.shutdown().await
        }

        async fn publish(&self, channel: &str, command: &Command) -> Result<(), BrokerError> {
            self.inner.publish(channel, command).await
        }

        async fn subscribe(
            &self,
            channel: &str,
            handler: clustercmd_events::BrokerHandler,
        ) -> Result<(), BrokerError> {
            if channel == BROADCAST_CHANNEL && !self.failed_once.swap(true, Ordering::SeqCst) {
                return Err(BrokerError::Transport("subscribe refused".to_string()));
            }
            self.inner.subscribe(channel, handler).await
        }
    }

    #[tokio::test]
    async fn retried_init_subscribes_each_channel_once() {
        let broker = Arc::new(FlakyBroadcast {
            inner: InMemoryCommandBroker::new(),
            failed_once: AtomicBool::new(false),
        });
        let registry: Arc<dyn ClusterRegistry> =
            Arc::new(StaticClusterRegistry::from_ids([member("m1")]));
        let service = CommandService::new(member("m1"), broker.clone(), registry, None);

        assert!(matches!(service.init().await, Err(CommandError::Broker(_))));
        assert!(!service.is_initialized());

        service.init().await.unwrap();
        assert!(service.is_initialized());
        assert_eq!(broker.inner.subscriber_count("m1"), 1);
        assert_eq!(broker.inner.subscriber_count(BROADCAST_CHANNEL), 1);
    }

    #[tokio::test]
    async fn unanswered_request_times_out_with_command_id() {
        let services = cluster(&["initiator", "m1"]).await;
        let id = CommandId::new();

        let started = tokio::time::Instant::now();
        let err = services[0]
            .send_command_get_response(
                "ping",
                CommandOptions::new()
                    .to(member("m1"))
                    .id(id)
                    .timeout(Duration::from_millis(40)),
            )
            .await
            .unwrap_err();

        assert!(started.elapsed() >= Duration::from_millis(40));
        match err {
            CommandError::Timeout { id: timed_out, timeout } => {
                assert_eq!(timed_out, id);
                assert_eq!(timeout, Duration::from_millis(40));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(services[0].awaiting_count(), 0);
    }

    #[tokio::test]
    async fn late_reply_is_discarded() {
        let services = cluster(&["initiator", "m1"]).await;
        let original = Command::new("ping", member("initiator")).with_to(member("m1"));

        let late = Command {
            reply_to: Some(original.id),
            ..Command::new("ping", member("m1")).with_to(member("initiator"))
        };
        services[0].notify_of_command(late);
        assert_eq!(services[0].awaiting_count(), 0);
    }

    #[tokio::test]
    async fn registration_is_idempotent() {
        let services = cluster(&["m1"]).await;
        let counter = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(counter.clone());

        assert!(services[0].register_for_type("tick", handler.clone()));
        assert!(!services[0].register_for_type("tick", handler.clone()));
        assert_eq!(services[0].registrant_count("tick"), 1);

        services[0].notify_of_command(Command::new("tick", member("m1")));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        assert!(services[0].unregister_for_type("tick", &handler));
        assert!(!services[0].unregister_for_type("tick", &handler));
        assert_eq!(services[0].registrant_count("tick"), 0);
    }

    #[tokio::test]
    async fn failing_handlers_do_not_block_siblings() {
        let services = cluster(&["m1"]).await;
        let counter = Arc::new(AtomicUsize::new(0));

        services[0].register_for_type(
            "tick",
            command_handler(|_, _| async { anyhow::bail!("handler failed") }),
        );
        services[0].register_for_type(
            "tick",
            command_handler(|_, command: Command| async move {
                if command.command_type == "tick" {
                    panic!("handler panicked");
                }
                Ok(())
            }),
        );
        services[0].register_for_type("tick", counting_handler(counter.clone()));

        services[0].notify_of_command(Command::new("tick", member("m1")));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn commands_for_other_members_are_ignored() {
        let services = cluster(&["m1"]).await;
        let counter = Arc::new(AtomicUsize::new(0));
        services[0].register_for_type("tick", counting_handler(counter.clone()));

        services[0].on_command_received(Command::new("tick", member("m2")).with_to(member("m2")));
        services[0].on_command_received(Command::new("tick", member("m2")).with_to(member("m1")));
        services[0].on_command_received(Command::new("tick", member("m2")));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn malformed_records_are_ignored() {
        let services = cluster(&["m1"]).await;
        let counter = Arc::new(AtomicUsize::new(0));
        services[0].register_for_type("tick", counting_handler(counter.clone()));

        services[0].notify_of_record(json!("not an object"));
        services[0].notify_of_record(json!({ "type": "" }));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fan_out_preserves_member_order() {
        let services = cluster(&["m1", "m2", "m3"]).await;

        // m1 answers last, m2 first.
        for (service, delay_ms) in services.iter().zip([60u64, 0, 30]) {
            service.register_for_type(
                "check",
                command_handler(move |service, command| async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    service
                        .send_in_response_to(
                            &command,
                            Reply::new().with_field("member", service.me().as_str()),
                        )
                        .await?;
                    Ok(())
                }),
            );
        }

        let progress = Arc::new(Mutex::new(Vec::new()));
        let seen = progress.clone();
        let results = services[0]
            .send_command_to_all_get_responses(
                "check",
                CommandOptions::new()
                    .timeout(Duration::from_secs(2))
                    .progress(move |i, total| seen.lock().unwrap().push((i, total))),
            )
            .await
            .unwrap();

        let order: Vec<&str> = results.iter().map(|r| r.member.as_str()).collect();
        assert_eq!(order, vec!["m1", "m2", "m3"]);
        for result in &results {
            let reply = result.command.as_ref().unwrap();
            assert_eq!(reply.get_str("member"), Some(result.member.as_str()));
        }

        let mut progress = progress.lock().unwrap().clone();
        progress.sort();
        assert_eq!(progress, vec![(0, 3), (1, 3), (2, 3)]);
    }

    #[tokio::test]
    async fn fan_out_can_skip_self() {
        let services = cluster(&["m1", "m2"]).await;
        services[1].register_for_type("ping", pong_handler());

        let results = services[0]
            .send_command_to_all_get_responses(
                "ping",
                CommandOptions::new().ignore_me(true).timeout(Duration::from_secs(1)),
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].member, member("m2"));
        assert!(results[0].is_ok());
    }

    #[tokio::test]
    async fn reply_error_field_marks_member_failed() {
        let services = cluster(&["m1", "m2"]).await;
        for service in &services {
            service.register_for_type(
                "check",
                command_handler(|service, command| async move {
                    let reply = if service.me().as_str() == "m1" {
                        Reply::new().with_field(REPLY_ERROR_FIELD, "disk full")
                    } else {
                        Reply::new().with_field(REPLY_ERROR_FIELD, JsonValue::Null)
                    };
                    service.send_in_response_to(&command, reply).await?;
                    Ok(())
                }),
            );
        }

        let results = services[0]
            .send_command_to_all_get_responses("check", CommandOptions::new().timeout(Duration::from_secs(1)))
            .await
            .unwrap();

        assert_eq!(results[0].err.as_deref(), Some("disk full"));
        assert!(results[0].command.is_none());
        assert!(results[1].err.is_none());
        assert!(results[1].command.is_some());
    }

    #[tokio::test]
    async fn shutdown_releases_pending_requests() {
        let services = cluster(&["initiator", "m1"]).await;
        let requester = services[0].clone();

        let pending = tokio::spawn(async move {
            requester
                .send_command_get_response(
                    "ping",
                    CommandOptions::new().to(member("m1")).timeout(Duration::from_secs(5)),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        services[0].shutdown().await.unwrap();
        services[0].shutdown().await.unwrap();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, CommandError::Shutdown));
    }
}
