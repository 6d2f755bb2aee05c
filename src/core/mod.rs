// src/core/mod.rs

//! Protocol, command model and the higher-level client machinery built on
//! top of `connection`.

pub mod cluster;
pub mod commands;
pub mod errors;
pub mod pipeline;
pub mod protocol;
pub mod pubsub;
pub mod reconnect;
pub mod scan;

pub use commands::{Command, cmd};
pub use errors::ClientError;
pub use protocol::{RespFrame, RespValue};
