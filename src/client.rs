// src/client.rs

//! `Client`, a single entry point over a standalone connection or a cluster,
//! with typed helpers for the most common commands.

use crate::config::Config;
use crate::connection::{Connection, ConnectionState};
use crate::core::cluster::ClusterClient;
use crate::core::commands::{Command, ToArg, cmd};
use crate::core::errors::ClientError;
use crate::core::pipeline::{Pipeline, Transaction};
use crate::core::protocol::{FromRespValue, RespValue};
use crate::core::pubsub::{MessageFilter, MessageStream, parse_ack};
use crate::core::scan::{self, ScanOptions, ScanStream};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
pub enum Client {
    Standalone(Connection),
    Cluster(ClusterClient),
}

impl From<Connection> for Client {
    fn from(conn: Connection) -> Self {
        Client::Standalone(conn)
    }
}

impl From<ClusterClient> for Client {
    fn from(cluster: ClusterClient) -> Self {
        Client::Cluster(cluster)
    }
}

impl Client {
    /// Connects as the config describes. A standalone client waits until the
    /// connection is ready unless `lazy_connect` is set; a cluster client
    /// waits until the slot table is loaded.
    pub async fn connect(config: &Config) -> Result<Self, ClientError> {
        let cluster = config
            .cluster_options()
            .map_err(|e| ClientError::InvalidArgument(e.to_string()))?;
        if let Some(options) = cluster {
            info!("Connecting to cluster via {} seed(s)", options.seeds.len());
            return Ok(Client::Cluster(ClusterClient::connect(options).await?));
        }

        let options = config.connection_options();
        info!("Connecting to {}", options.endpoint);
        let lazy = options.lazy_connect;
        let conn = Connection::new(options);
        if !lazy {
            conn.wait_until_ready().await?;
        }
        Ok(Client::Standalone(conn))
    }

    /// Connects to a `redis://`, `rediss://` or `unix://` URL.
    pub async fn from_url(url: &str) -> Result<Self, ClientError> {
        let config =
            Config::from_url(url).map_err(|e| ClientError::InvalidArgument(format!("{e:#}")))?;
        Self::connect(&config).await
    }

    pub fn connection(&self) -> Option<&Connection> {
        match self {
            Client::Standalone(conn) => Some(conn),
            Client::Cluster(_) => None,
        }
    }

    pub fn cluster(&self) -> Option<&ClusterClient> {
        match self {
            Client::Standalone(_) => None,
            Client::Cluster(cluster) => Some(cluster),
        }
    }

    /// The connection state. A cluster client reports `Ready` while it has
    /// a slot table.
    pub fn status(&self) -> ConnectionState {
        match self {
            Client::Standalone(conn) => conn.state(),
            Client::Cluster(cluster) if cluster.slot_table().covered_slots() > 0 => {
                ConnectionState::Ready
            }
            Client::Cluster(_) => ConnectionState::Connecting,
        }
    }

    /// Sends any command and returns its transformed reply.
    pub async fn send(&self, command: Command) -> Result<RespValue, ClientError> {
        match self {
            Client::Standalone(conn) => conn.send(command).await,
            Client::Cluster(cluster) => cluster.send(command).await,
        }
    }

    pub async fn query<T: FromRespValue>(&self, command: Command) -> Result<T, ClientError> {
        T::from_resp(self.send(command).await?)
    }

    pub fn pipeline(&self) -> Pipeline {
        match self {
            Client::Standalone(conn) => Pipeline::new(Arc::new(conn.clone())),
            Client::Cluster(cluster) => cluster.pipeline(),
        }
    }

    pub fn transaction(&self) -> Transaction {
        match self {
            Client::Standalone(conn) => Transaction::new(Arc::new(conn.clone())),
            Client::Cluster(cluster) => cluster.transaction(),
        }
    }

    pub fn disconnect(&self) {
        match self {
            Client::Standalone(conn) => conn.disconnect(false),
            Client::Cluster(cluster) => cluster.disconnect(),
        }
    }

    pub async fn quit(&self) -> Result<(), ClientError> {
        match self {
            Client::Standalone(conn) => conn.quit().await,
            Client::Cluster(cluster) => cluster.quit().await,
        }
    }

    // --- Typed helpers ---

    pub async fn ping(&self) -> Result<String, ClientError> {
        self.query(cmd("PING")).await
    }

    pub async fn get(&self, key: impl ToArg) -> Result<Option<Bytes>, ClientError> {
        self.query(cmd("GET").arg(key)).await
    }

    pub async fn set(&self, key: impl ToArg, value: impl ToArg) -> Result<(), ClientError> {
        self.query(cmd("SET").arg(key).arg(value)).await
    }

    /// `SET key value PX ttl`.
    pub async fn set_ex(
        &self,
        key: impl ToArg,
        value: impl ToArg,
        ttl: Duration,
    ) -> Result<(), ClientError> {
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        self.query(cmd("SET").arg(key).arg(value).arg("PX").arg(millis))
            .await
    }

    /// `SET key value NX`; returns whether the key was set.
    pub async fn set_nx(&self, key: impl ToArg, value: impl ToArg) -> Result<bool, ClientError> {
        let reply: Option<String> = self.query(cmd("SET").arg(key).arg(value).arg("NX")).await?;
        Ok(reply.is_some())
    }

    pub async fn del<I, T>(&self, keys: I) -> Result<i64, ClientError>
    where
        I: IntoIterator<Item = T>,
        T: ToArg,
    {
        self.query(cmd("DEL").args(keys)).await
    }

    pub async fn exists(&self, key: impl ToArg) -> Result<bool, ClientError> {
        let count: i64 = self.query(cmd("EXISTS").arg(key)).await?;
        Ok(count > 0)
    }

    pub async fn incr(&self, key: impl ToArg) -> Result<i64, ClientError> {
        self.query(cmd("INCR").arg(key)).await
    }

    pub async fn incr_by(&self, key: impl ToArg, delta: i64) -> Result<i64, ClientError> {
        self.query(cmd("INCRBY").arg(key).arg(delta)).await
    }

    pub async fn expire(&self, key: impl ToArg, ttl: Duration) -> Result<bool, ClientError> {
        self.query(cmd("PEXPIRE").arg(key).arg(ttl.as_millis() as u64))
            .await
    }

    /// Remaining time to live in milliseconds; `-1` without expiry, `-2` if
    /// the key does not exist.
    pub async fn pttl(&self, key: impl ToArg) -> Result<i64, ClientError> {
        self.query(cmd("PTTL").arg(key)).await
    }

    pub async fn hget(
        &self,
        key: impl ToArg,
        field: impl ToArg,
    ) -> Result<Option<Bytes>, ClientError> {
        self.query(cmd("HGET").arg(key).arg(field)).await
    }

    pub async fn hset(
        &self,
        key: impl ToArg,
        field: impl ToArg,
        value: impl ToArg,
    ) -> Result<i64, ClientError> {
        self.query(cmd("HSET").arg(key).arg(field).arg(value)).await
    }

    pub async fn hgetall(&self, key: impl ToArg) -> Result<HashMap<Bytes, Bytes>, ClientError> {
        self.query(cmd("HGETALL").arg(key)).await
    }

    pub async fn lpush<I, T>(&self, key: impl ToArg, values: I) -> Result<i64, ClientError>
    where
        I: IntoIterator<Item = T>,
        T: ToArg,
    {
        self.query(cmd("LPUSH").arg(key).args(values)).await
    }

    pub async fn rpush<I, T>(&self, key: impl ToArg, values: I) -> Result<i64, ClientError>
    where
        I: IntoIterator<Item = T>,
        T: ToArg,
    {
        self.query(cmd("RPUSH").arg(key).args(values)).await
    }

    pub async fn lrange(
        &self,
        key: impl ToArg,
        start: i64,
        stop: i64,
    ) -> Result<Vec<Bytes>, ClientError> {
        self.query(cmd("LRANGE").arg(key).arg(start).arg(stop)).await
    }

    /// Publishes a message; returns the number of receiving subscribers.
    pub async fn publish(
        &self,
        channel: impl ToArg,
        message: impl ToArg,
    ) -> Result<i64, ClientError> {
        self.query(cmd("PUBLISH").arg(channel).arg(message)).await
    }

    // --- Pub/sub ---

    async fn subscription(&self, command: Command) -> Result<i64, ClientError> {
        match self {
            Client::Standalone(conn) => {
                let frame = conn.send_raw(command).await?.into_result()?;
                Ok(parse_ack(&frame).map_or(0, |ack| ack.count))
            }
            Client::Cluster(cluster) => match command.name() {
                "SUBSCRIBE" => cluster.subscribe(command.subscription_targets()).await,
                "PSUBSCRIBE" => cluster.psubscribe(command.subscription_targets()).await,
                "UNSUBSCRIBE" => cluster.unsubscribe(command.subscription_targets()).await,
                _ => cluster.punsubscribe(command.subscription_targets()).await,
            },
        }
    }

    /// Subscribes to channels; returns the subscription count after the last
    /// acknowledgement. Messages are delivered through `messages`.
    pub async fn subscribe<I, T>(&self, channels: I) -> Result<i64, ClientError>
    where
        I: IntoIterator<Item = T>,
        T: ToArg,
    {
        self.subscription(cmd("SUBSCRIBE").args(channels)).await
    }

    pub async fn psubscribe<I, T>(&self, patterns: I) -> Result<i64, ClientError>
    where
        I: IntoIterator<Item = T>,
        T: ToArg,
    {
        self.subscription(cmd("PSUBSCRIBE").args(patterns)).await
    }

    /// Unsubscribes from the given channels, or from all of them when empty.
    pub async fn unsubscribe<I, T>(&self, channels: I) -> Result<i64, ClientError>
    where
        I: IntoIterator<Item = T>,
        T: ToArg,
    {
        self.subscription(cmd("UNSUBSCRIBE").args(channels)).await
    }

    pub async fn punsubscribe<I, T>(&self, patterns: I) -> Result<i64, ClientError>
    where
        I: IntoIterator<Item = T>,
        T: ToArg,
    {
        self.subscription(cmd("PUNSUBSCRIBE").args(patterns)).await
    }

    pub fn messages(&self, filter: MessageFilter) -> MessageStream {
        match self {
            Client::Standalone(conn) => conn.messages(filter),
            Client::Cluster(cluster) => cluster.messages(filter),
        }
    }

    // --- Cursor iteration ---

    /// Iterates the keyspace; in cluster mode every master is scanned in turn.
    pub fn scan_stream(&self, options: ScanOptions) -> ScanStream {
        match self {
            Client::Standalone(conn) => scan::scan_stream(conn, options),
            Client::Cluster(cluster) => scan::cluster_scan_stream(cluster, options),
        }
    }

    pub fn hscan_stream(&self, key: impl ToArg, options: ScanOptions) -> ScanStream {
        match self {
            Client::Standalone(conn) => scan::hscan_stream(conn, key, options),
            Client::Cluster(cluster) => scan::hscan_stream(cluster, key, options),
        }
    }

    pub fn sscan_stream(&self, key: impl ToArg, options: ScanOptions) -> ScanStream {
        match self {
            Client::Standalone(conn) => scan::sscan_stream(conn, key, options),
            Client::Cluster(cluster) => scan::sscan_stream(cluster, key, options),
        }
    }

    pub fn zscan_stream(&self, key: impl ToArg, options: ScanOptions) -> ScanStream {
        match self {
            Client::Standalone(conn) => scan::zscan_stream(conn, key, options),
            Client::Cluster(cluster) => scan::zscan_stream(cluster, key, options),
        }
    }
}
