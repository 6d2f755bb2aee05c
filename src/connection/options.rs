// src/connection/options.rs

//! Runtime options of a single connection, built from `ClientConfig` or by
//! hand. Unlike the serializable config, these may carry trait objects such as
//! a custom backoff, a reconnect-on-error predicate or a custom connector.

use super::queue::OfflineQueuePolicy;
use super::stream::{Connector, DefaultConnector, Endpoint};
use crate::core::reconnect::ReconnectPolicy;
use bytes::Bytes;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// AUTH parameters. A username selects ACL authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: String,
}

impl Credentials {
    pub fn password(password: impl Into<String>) -> Self {
        Self {
            username: None,
            password: password.into(),
        }
    }

    pub fn acl(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// When the offline queue is flushed relative to the readiness check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineFlush {
    /// Flush once the readiness check reports the server ready.
    #[default]
    AfterReady,
    /// Flush as soon as the socket is authenticated; the check runs behind it.
    OnConnect,
}

#[derive(Clone)]
pub struct ConnectionOptions {
    pub endpoint: Endpoint,
    pub credentials: Option<Credentials>,
    pub db: u32,
    pub connection_name: Option<String>,
    /// Send READONLY during the handshake (cluster replica reads).
    pub read_only: bool,
    pub enable_ready_check: bool,
    pub offline_queue: OfflineQueuePolicy,
    pub offline_flush: OfflineFlush,
    pub auto_resubscribe: bool,
    pub auto_resend_unfulfilled_commands: bool,
    pub lazy_connect: bool,
    pub connect_timeout: Duration,
    pub command_timeout: Option<Duration>,
    pub key_prefix: Option<Bytes>,
    pub max_retries_per_request: Option<u32>,
    pub reconnect: ReconnectPolicy,
    pub connector: Arc<dyn Connector>,
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("endpoint", &self.endpoint)
            .field("credentials", &self.credentials)
            .field("db", &self.db)
            .field("connection_name", &self.connection_name)
            .field("read_only", &self.read_only)
            .field("enable_ready_check", &self.enable_ready_check)
            .field("offline_queue", &self.offline_queue)
            .field("offline_flush", &self.offline_flush)
            .field("auto_resubscribe", &self.auto_resubscribe)
            .field("lazy_connect", &self.lazy_connect)
            .field("connect_timeout", &self.connect_timeout)
            .field("command_timeout", &self.command_timeout)
            .field("max_retries_per_request", &self.max_retries_per_request)
            .field("reconnect", &self.reconnect)
            .finish_non_exhaustive()
    }
}

impl ConnectionOptions {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            credentials: None,
            db: 0,
            connection_name: None,
            read_only: false,
            enable_ready_check: true,
            offline_queue: OfflineQueuePolicy::Unbounded,
            offline_flush: OfflineFlush::AfterReady,
            auto_resubscribe: true,
            auto_resend_unfulfilled_commands: true,
            lazy_connect: false,
            connect_timeout: Duration::from_secs(10),
            command_timeout: None,
            key_prefix: None,
            max_retries_per_request: Some(20),
            reconnect: ReconnectPolicy::default(),
            connector: Arc::new(DefaultConnector::plain()),
        }
    }

    /// A copy pointing at another endpoint, as used for cluster nodes.
    pub fn for_endpoint(&self, endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            ..self.clone()
        }
    }

    pub fn with_connector(mut self, connector: impl Connector) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}
