// src/lib.rs

pub mod client;
pub mod config;
pub mod connection;
pub mod core;

// Re-export
pub use crate::client::Client;
pub use crate::config::{ClientConfig, ClusterConfig, Config};
pub use crate::connection::{
    Connection, ConnectionEvent, ConnectionOptions, ConnectionState, Endpoint,
};
pub use crate::core::cluster::{ClusterClient, ClusterOptions};
pub use crate::core::pipeline::{Pipeline, Transaction, TransactionOutcome};
pub use crate::core::pubsub::{MessageFilter, PubSubMessage};
pub use crate::core::{ClientError, Command, RespFrame, RespValue, cmd};
