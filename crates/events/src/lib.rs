//! Command bus contract: the wire-level `Command`, the pluggable `CommandBroker`
//! transport, and an in-memory broker for tests/dev.

pub mod broker;
pub mod command;
pub mod in_memory_broker;

pub use broker::{BrokerError, BrokerHandler, CommandBroker, broker_handler};
pub use command::{CHANNEL_FIELD, Command, CommandDecodeError, RESERVED_FIELDS, reserved_key};
pub use in_memory_broker::InMemoryCommandBroker;
