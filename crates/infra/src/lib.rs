//! Infrastructure layer: capped stores, brokers, the command service, configuration,
//! and the job runners built on top of them.

pub mod broker;
pub mod cluster;
pub mod command_service;
pub mod config;
pub mod fault;
pub mod jobs;
pub mod store;


pub use cluster::{ClusterRegistry, MemberDescriptor, RegistryError, StaticClusterRegistry};
pub use command_service::{
    BROADCAST_CHANNEL, CommandError, CommandHandler, CommandOptions, CommandService, MemberResponse,
    Reply, command_handler,
};
pub use config::{BrokerConfig, ClusterConfig, ConfigError};
